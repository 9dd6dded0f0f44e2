//! Mail provider client
//!
//! Everything that touches the network lives behind [`MailProvider`]: the OAuth
//! refresh-token exchange, Graph REST calls and the two IMAP generations. The
//! scheduler only ever talks to the trait, so tests substitute a mock and the
//! production [`OutlookProvider`] can change wire details freely.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FetchedMessage, Folder, Protocol, TokenGrant};

pub mod graph;
pub mod imap;
pub mod oauth;
pub mod outlook;

pub use outlook::OutlookProvider;

/// Everything a protocol needs to open a mailbox
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub protocol: Protocol,
    pub email: String,
    pub access_token: String,
    pub proxy: Option<String>,
}

impl Credentials {
    pub fn new(
        protocol: Protocol,
        email: impl Into<String>,
        access_token: impl Into<String>,
        proxy: Option<&str>,
    ) -> Self {
        Self {
            protocol,
            email: email.into(),
            access_token: access_token.into(),
            proxy: proxy.map(str::to_string),
        }
    }
}

// Keep bearer tokens out of debug logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("protocol", &self.protocol)
            .field("email", &self.email)
            .field("access_token", &"<redacted>")
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Trait defining provider operations for easier testing
///
/// Implementations must report a failing outbound proxy as
/// [`SyncError::ProxyTransport`](crate::error::SyncError::ProxyTransport) and
/// every other per-protocol failure as
/// [`SyncError::Protocol`](crate::error::SyncError::Protocol), so the fallback
/// engine can tell "this protocol is broken" from "nothing will work".
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Exchange a refresh token at the token endpoint for `protocol`
    async fn refresh_token(
        &self,
        protocol: Protocol,
        client_id: &str,
        refresh_token: &str,
        proxy: Option<String>,
    ) -> Result<TokenGrant>;

    /// Most recent messages of `folder`, newest first, at most `limit`
    async fn fetch_messages(
        &self,
        credentials: &Credentials,
        folder: Folder,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>>;

    /// Unread messages in the inbox
    async fn get_unread_count(&self, credentials: &Credentials) -> Result<u32>;
}

/// Bare RFC 5322 Message-ID, the id shared by Graph and IMAP fetches
pub(crate) fn normalize_message_id(raw: &str) -> Option<String> {
    let id = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    (!id.is_empty()).then(|| id.to_string())
}

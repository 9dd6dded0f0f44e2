//! Per-protocol transport strategies
//!
//! Each [`Transport`] reaches a mailbox one way and hands back the same
//! normalized result, so the fallback engine can iterate them without caring
//! which wire protocol is behind each one.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::models::{Account, FetchedMessage, Folder, Protocol};
use crate::provider::{Credentials, MailProvider};
use crate::token::TokenGate;

/// What one successful transport attempt produced
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchResult {
    pub messages: Vec<FetchedMessage>,
    pub unread_count: u32,
    /// Set when the token endpoint handed out a new refresh token
    pub rotated_refresh_token: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn fetch(&self, account: &Account, proxy: Option<&str>) -> Result<FetchResult>;
}

/// Which folders to read and how deep
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub folders: Vec<Folder>,
    pub limit: usize,
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self {
            folders: vec![Folder::Inbox],
            limit: 30,
        }
    }
}

async fn fetch_folders(
    provider: &dyn MailProvider,
    credentials: &Credentials,
    plan: &FetchPlan,
) -> Result<FetchResult> {
    let mut messages = Vec::new();
    for folder in &plan.folders {
        messages.extend(provider.fetch_messages(credentials, *folder, plan.limit).await?);
    }
    let unread_count = provider.get_unread_count(credentials).await?;

    Ok(FetchResult {
        messages,
        unread_count,
        rotated_refresh_token: None,
    })
}

/// Graph REST, using the access token the freshness gate maintains
pub struct GraphTransport {
    provider: Arc<dyn MailProvider>,
    plan: FetchPlan,
}

impl GraphTransport {
    pub fn new(provider: Arc<dyn MailProvider>, plan: FetchPlan) -> Self {
        Self { provider, plan }
    }
}

#[async_trait]
impl Transport for GraphTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Graph
    }

    async fn fetch(&self, account: &Account, proxy: Option<&str>) -> Result<FetchResult> {
        let access_token = account
            .access_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| SyncError::Protocol("no access token".to_string()))?;

        let credentials = Credentials::new(Protocol::Graph, &account.email, access_token, proxy);
        fetch_folders(self.provider.as_ref(), &credentials, &self.plan).await
    }
}

/// IMAP over XOAUTH2, one of the two server generations
///
/// The Graph token is not accepted by the IMAP servers, so every attempt
/// exchanges the refresh token at the variant's own endpoint first.
pub struct ImapTransport {
    protocol: Protocol,
    provider: Arc<dyn MailProvider>,
    gate: Arc<TokenGate>,
    plan: FetchPlan,
}

impl ImapTransport {
    pub fn new(
        protocol: Protocol,
        provider: Arc<dyn MailProvider>,
        gate: Arc<TokenGate>,
        plan: FetchPlan,
    ) -> Self {
        debug_assert!(protocol.is_imap());
        Self {
            protocol,
            provider,
            gate,
            plan,
        }
    }
}

#[async_trait]
impl Transport for ImapTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn fetch(&self, account: &Account, proxy: Option<&str>) -> Result<FetchResult> {
        // A rejected exchange only rules out this variant
        let grant = self
            .gate
            .exchange(self.protocol, account, proxy)
            .await
            .map_err(|e| match e {
                SyncError::TokenRefresh(message) => {
                    SyncError::Protocol(format!("token exchange failed: {}", message))
                }
                other => other,
            })?;

        let credentials = Credentials::new(self.protocol, &account.email, &grant.access_token, proxy);
        let mut result = fetch_folders(self.provider.as_ref(), &credentials, &self.plan).await?;

        if account.refresh_token.as_deref() != Some(grant.refresh_token.as_str()) {
            result.rotated_refresh_token = Some(grant.refresh_token);
        }
        Ok(result)
    }
}

/// The three transports in their default order
pub fn standard_transports(
    provider: Arc<dyn MailProvider>,
    gate: Arc<TokenGate>,
    plan: FetchPlan,
) -> Vec<Arc<dyn Transport>> {
    vec![
        Arc::new(GraphTransport::new(Arc::clone(&provider), plan.clone())),
        Arc::new(ImapTransport::new(
            Protocol::ImapNew,
            Arc::clone(&provider),
            Arc::clone(&gate),
            plan.clone(),
        )),
        Arc::new(ImapTransport::new(Protocol::ImapOld, provider, gate, plan)),
    ]
}

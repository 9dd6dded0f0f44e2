//! Protocol fallback engine
//!
//! Tries the account's transports in order until one succeeds. The order is
//! the default `[graph, imap_new, imap_old]` with the account's cached
//! affinity moved to the front. Per-protocol failures are collected rather than
//! raised so a total failure carries the full diagnostic picture, while a
//! broken proxy stops the chain at once since every protocol would fail the
//! same way behind it.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{truncate_chars, Result, SyncError};
use crate::models::{Account, FetchedMessage, Protocol};
use crate::transport::Transport;

/// Per-protocol error strings are cut to this many characters
pub const MAX_PROTOCOL_ERROR_LEN: usize = 200;

/// Outcome of a successful account sync
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub method: Protocol,
    pub messages: Vec<FetchedMessage>,
    pub unread_count: u32,
}

pub struct FallbackEngine {
    transports: Vec<Arc<dyn Transport>>,
}

/// Protocols to try: affinity first, then the default order without repeats
pub fn attempt_order(affinity: Option<Protocol>) -> Vec<Protocol> {
    let mut order = Vec::with_capacity(Protocol::DEFAULT_ORDER.len());
    if let Some(preferred) = affinity {
        order.push(preferred);
    }
    for protocol in Protocol::DEFAULT_ORDER {
        if !order.contains(&protocol) {
            order.push(protocol);
        }
    }
    order
}

impl FallbackEngine {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    fn transport_for(&self, protocol: Protocol) -> Option<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|transport| transport.protocol() == protocol)
    }

    /// Fetch messages and unread count for `account` over the first protocol that works
    ///
    /// Updates the account's affinity and capability flags, and stores a
    /// rotated refresh token if the winning transport obtained one.
    pub async fn sync_account(&self, account: &mut Account, proxy: Option<&str>) -> Result<SyncResult> {
        let mut errors = Vec::new();

        for protocol in attempt_order(account.sync_method) {
            let Some(transport) = self.transport_for(protocol) else {
                continue;
            };

            debug!("Trying {} for {}", protocol, account.email);
            match transport.fetch(account, proxy).await {
                Ok(result) => {
                    if !errors.is_empty() {
                        info!(
                            "{} reached via {} after {} failed protocol(s)",
                            account.email,
                            protocol,
                            errors.len()
                        );
                    }
                    account.mark_protocol_success(protocol);
                    if let Some(refresh_token) = result.rotated_refresh_token {
                        account.refresh_token = Some(refresh_token);
                    }
                    return Ok(SyncResult {
                        method: protocol,
                        messages: result.messages,
                        unread_count: result.unread_count,
                    });
                }
                Err(e) if e.is_proxy_failure() => {
                    debug!("Proxy failure on {} for {}, not falling back", protocol, account.email);
                    return Err(e);
                }
                Err(e) => {
                    debug!("{} failed for {}: {}", protocol, account.email, e);
                    errors.push(format!(
                        "{}: {}",
                        protocol,
                        truncate_chars(&e.to_string(), MAX_PROTOCOL_ERROR_LEN)
                    ));
                }
            }
        }

        account.reset_protocol_affinity();
        Err(SyncError::AllProtocolsFailed { errors })
    }
}

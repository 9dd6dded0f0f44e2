//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mailbox_sync::config::SchedulerConfig;
use mailbox_sync::error::{Result, SyncError};
use mailbox_sync::models::{
    Account, AccountId, FetchedMessage, Folder, Group, GroupId, Protocol, TokenGrant,
};
use mailbox_sync::provider::{Credentials, MailProvider};
use mailbox_sync::scheduler::Scheduler;
use mailbox_sync::store::{MemoryStore, Store};
use mailbox_sync::token::TokenGate;
use mailbox_sync::transport::{standard_transports, FetchPlan};
use mailbox_sync::fallback::FallbackEngine;
use mockall::mock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Create an auto-sync group with the given batch size
pub fn create_test_group(id: GroupId, batch_size: u32) -> Group {
    let mut group = Group::new(id, format!("group-{}", id));
    group.auto_sync = true;
    group.sync_batch_size = batch_size;
    group
}

/// Create a group member with a fresh Graph token and a refresh token `rt-{id}`
///
/// `created_at` is offset by the id so creation order equals id order.
pub fn create_test_account(id: AccountId, group_id: GroupId) -> Account {
    let mut account = Account::new(id, format!("user{}@outlook.com", id));
    account.group_id = Some(group_id);
    account.client_id = Some("test-client".to_string());
    account.refresh_token = Some(format!("rt-{}", id));
    account.access_token = Some(format!("at-{}", id));
    account.token_expires_at = Some(Utc::now() + Duration::hours(1));
    account.created_at = Utc::now() - Duration::days(1) + Duration::seconds(id);
    account
}

pub fn create_test_message(id: &str, subject: &str) -> FetchedMessage {
    FetchedMessage {
        id: Some(id.to_string()),
        subject: Some(subject.to_string()),
        sender_name: Some("Sender".to_string()),
        sender_address: Some("sender@example.com".to_string()),
        received_at: Some("2024-05-01T08:30:00Z".to_string()),
        is_read: false,
        preview: Some("Hello there".to_string()),
        folder: Folder::Inbox,
    }
}

/// Memory store holding one group and `count` members with ids `1..=count`
pub fn seeded_store(group: Group, count: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let group_id = group.id;
    store.add_group(group).unwrap();
    for id in 1..=count {
        store.add_account(create_test_account(id, group_id)).unwrap();
    }
    store
}

/// Scheduler over the standard transports of `provider`
pub fn build_scheduler(
    config: SchedulerConfig,
    store: Arc<MemoryStore>,
    provider: Arc<dyn MailProvider>,
) -> Scheduler {
    let gate = Arc::new(TokenGate::new(
        Arc::clone(&provider),
        None,
        config.token_refresh_margin_secs,
    ));
    let engine = FallbackEngine::new(standard_transports(
        provider,
        Arc::clone(&gate),
        FetchPlan::default(),
    ));
    Scheduler::with_parts(config, store as Arc<dyn Store>, gate, engine)
}

#[derive(Debug, Clone, Default)]
struct Mailbox {
    messages: Vec<FetchedMessage>,
    unread: u32,
}

#[derive(Debug, Default)]
struct FakeState {
    broken: HashSet<Protocol>,
    proxy_down: bool,
    rejected_refresh_tokens: HashSet<String>,
    mailboxes: HashMap<String, Mailbox>,
    refresh_calls: Vec<(Protocol, String)>,
    fetch_calls: Vec<(Protocol, String)>,
}

/// Scriptable in-process provider
///
/// Every protocol works and every mailbox is empty until told otherwise.
#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call on `protocol` fail with a protocol error
    pub fn break_protocol(&self, protocol: Protocol) {
        self.state.lock().unwrap().broken.insert(protocol);
    }

    /// Make every proxied call fail at the proxy
    pub fn set_proxy_down(&self, down: bool) {
        self.state.lock().unwrap().proxy_down = down;
    }

    pub fn reject_refresh_token(&self, refresh_token: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_refresh_tokens
            .insert(refresh_token.to_string());
    }

    pub fn set_mailbox(&self, email: &str, messages: Vec<FetchedMessage>, unread: u32) {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .insert(email.to_string(), Mailbox { messages, unread });
    }

    /// `(protocol, refresh token)` of every token exchange
    pub fn refresh_calls(&self) -> Vec<(Protocol, String)> {
        self.state.lock().unwrap().refresh_calls.clone()
    }

    /// `(protocol, email)` of every message fetch
    pub fn fetch_calls(&self) -> Vec<(Protocol, String)> {
        self.state.lock().unwrap().fetch_calls.clone()
    }

    /// Emails in the order their mailboxes were fetched
    pub fn fetched_emails(&self) -> Vec<String> {
        self.fetch_calls().into_iter().map(|(_, email)| email).collect()
    }

    fn check(&self, protocol: Protocol, proxy: Option<&str>) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.proxy_down && proxy.is_some() {
            return Err(SyncError::ProxyTransport("proxy refused connection".to_string()));
        }
        if state.broken.contains(&protocol) {
            return Err(SyncError::Protocol(format!("{} unavailable", protocol)));
        }
        Ok(())
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn refresh_token(
        &self,
        protocol: Protocol,
        _client_id: &str,
        refresh_token: &str,
        proxy: Option<String>,
    ) -> Result<TokenGrant> {
        self.state
            .lock()
            .unwrap()
            .refresh_calls
            .push((protocol, refresh_token.to_string()));

        if self.state.lock().unwrap().proxy_down && proxy.is_some() {
            return Err(SyncError::ProxyTransport("proxy refused connection".to_string()));
        }
        if self
            .state
            .lock()
            .unwrap()
            .rejected_refresh_tokens
            .contains(refresh_token)
        {
            return Err(SyncError::TokenRefresh("HTTP 400: invalid_grant".to_string()));
        }

        Ok(TokenGrant {
            access_token: format!("{}-access", protocol),
            refresh_token: refresh_token.to_string(),
            expires_in: 3600,
        })
    }

    async fn fetch_messages(
        &self,
        credentials: &Credentials,
        folder: Folder,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>> {
        self.state
            .lock()
            .unwrap()
            .fetch_calls
            .push((credentials.protocol, credentials.email.clone()));
        self.check(credentials.protocol, credentials.proxy.as_deref())?;

        let state = self.state.lock().unwrap();
        Ok(state
            .mailboxes
            .get(&credentials.email)
            .map(|mailbox| {
                mailbox
                    .messages
                    .iter()
                    .filter(|message| message.folder == folder)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_unread_count(&self, credentials: &Credentials) -> Result<u32> {
        self.check(credentials.protocol, credentials.proxy.as_deref())?;
        let state = self.state.lock().unwrap();
        Ok(state
            .mailboxes
            .get(&credentials.email)
            .map(|mailbox| mailbox.unread)
            .unwrap_or(0))
    }
}

// Mock implementation of MailProvider for expectation-style tests
mock! {
    pub MailProvider {}

    #[async_trait]
    impl MailProvider for MailProvider {
        async fn refresh_token(
            &self,
            protocol: Protocol,
            client_id: &str,
            refresh_token: &str,
            proxy: Option<String>,
        ) -> Result<TokenGrant>;
        async fn fetch_messages(
            &self,
            credentials: &Credentials,
            folder: Folder,
            limit: usize,
        ) -> Result<Vec<FetchedMessage>>;
        async fn get_unread_count(&self, credentials: &Credentials) -> Result<u32>;
    }
}

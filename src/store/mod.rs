//! Persistent store seam
//!
//! The scheduler reads groups and accounts through [`Store`] and writes back
//! one [`UnitOfWork`] per account attempt. A unit of work is committed on its
//! own, so one account's failure never rolls back another account's success
//! within the same batch.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::models::{Account, AccountId, Group, GroupId, RefreshRecord, StoredMessage};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Everything one account attempt wants persisted, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWork {
    pub account: Account,
    pub new_messages: Vec<StoredMessage>,
    pub refresh_records: Vec<RefreshRecord>,
}

impl UnitOfWork {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            new_messages: Vec::new(),
            refresh_records: Vec::new(),
        }
    }

    pub fn stage_refresh(&mut self, record: RefreshRecord) {
        self.refresh_records.push(record);
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Groups with `auto_sync` enabled
    async fn auto_sync_groups(&self) -> Result<Vec<Group>>;

    /// Groups with `auto_refresh_token` enabled
    async fn auto_refresh_groups(&self) -> Result<Vec<Group>>;

    async fn group(&self, id: GroupId) -> Result<Option<Group>>;

    async fn account(&self, id: AccountId) -> Result<Option<Account>>;

    /// Non-disabled members of a group in creation order
    async fn sync_candidates(&self, group_id: GroupId) -> Result<Vec<Account>>;

    /// Provider message ids already stored for an account
    async fn known_message_ids(&self, account_id: AccountId) -> Result<HashSet<String>>;

    /// Non-disabled accounts whose last explicit refresh failed
    async fn failed_refresh_accounts(&self) -> Result<Vec<Account>>;

    /// Persist a unit of work, returning how many messages were inserted
    ///
    /// A message whose `(account_id, message_id)` is already stored is left
    /// as it is, never updated.
    async fn commit(&self, work: UnitOfWork) -> Result<usize>;

    /// Most recent refresh records, newest first
    async fn refresh_history(&self, limit: usize) -> Result<Vec<RefreshRecord>>;
}

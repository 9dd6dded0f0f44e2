//! In-process store
//!
//! Used by the test suite and when the binary is built without SQLite. Data
//! lives for the lifetime of the process only.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{Store, UnitOfWork};
use crate::error::{Result, SyncError};
use crate::models::{
    Account, AccountId, AccountStatus, Group, GroupId, RefreshRecord, RefreshStatus, StoredMessage,
};

#[derive(Debug, Default)]
struct Inner {
    groups: BTreeMap<GroupId, Group>,
    accounts: BTreeMap<AccountId, Account>,
    messages: BTreeMap<(AccountId, String), StoredMessage>,
    refresh_log: Vec<RefreshRecord>,
    commits: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Store("memory store lock poisoned".to_string()))
    }

    pub fn add_group(&self, group: Group) -> Result<()> {
        self.lock()?.groups.insert(group.id, group);
        Ok(())
    }

    pub fn add_account(&self, account: Account) -> Result<()> {
        self.lock()?.accounts.insert(account.id, account);
        Ok(())
    }

    /// Stored messages of one account, ordered by message id
    pub fn messages(&self, account_id: AccountId) -> Result<Vec<StoredMessage>> {
        Ok(self
            .lock()?
            .messages
            .values()
            .filter(|message| message.account_id == account_id)
            .cloned()
            .collect())
    }

    /// Number of units of work committed so far
    pub fn commit_count(&self) -> Result<usize> {
        Ok(self.lock()?.commits)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn auto_sync_groups(&self) -> Result<Vec<Group>> {
        Ok(self
            .lock()?
            .groups
            .values()
            .filter(|group| group.auto_sync)
            .cloned()
            .collect())
    }

    async fn auto_refresh_groups(&self) -> Result<Vec<Group>> {
        Ok(self
            .lock()?
            .groups
            .values()
            .filter(|group| group.auto_refresh_token)
            .cloned()
            .collect())
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.lock()?.groups.get(&id).cloned())
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn sync_candidates(&self, group_id: GroupId) -> Result<Vec<Account>> {
        let inner = self.lock()?;
        let mut accounts: Vec<Account> = inner
            .accounts
            .values()
            .filter(|account| {
                account.group_id == Some(group_id) && account.status != AccountStatus::Disabled
            })
            .cloned()
            .collect();
        accounts.sort_by_key(|account| (account.created_at, account.id));
        Ok(accounts)
    }

    async fn known_message_ids(&self, account_id: AccountId) -> Result<HashSet<String>> {
        Ok(self
            .lock()?
            .messages
            .keys()
            .filter(|(owner, _)| *owner == account_id)
            .map(|(_, message_id)| message_id.clone())
            .collect())
    }

    async fn failed_refresh_accounts(&self) -> Result<Vec<Account>> {
        Ok(self
            .lock()?
            .accounts
            .values()
            .filter(|account| {
                account.refresh_status == RefreshStatus::Failed
                    && account.status != AccountStatus::Disabled
            })
            .cloned()
            .collect())
    }

    async fn commit(&self, work: UnitOfWork) -> Result<usize> {
        let mut inner = self.lock()?;

        let mut inserted = 0;
        for message in work.new_messages {
            let key = (message.account_id, message.message_id.clone());
            if !inner.messages.contains_key(&key) {
                inner.messages.insert(key, message);
                inserted += 1;
            }
        }
        inner.refresh_log.extend(work.refresh_records);
        inner.accounts.insert(work.account.id, work.account);
        inner.commits += 1;

        Ok(inserted)
    }

    async fn refresh_history(&self, limit: usize) -> Result<Vec<RefreshRecord>> {
        Ok(self
            .lock()?
            .refresh_log
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

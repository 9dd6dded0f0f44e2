//! Operator-facing activity tail and new-mail notifications
//!
//! Both structures are bounded, in-memory, and lost on restart. The log is a
//! ring buffer (newest first) that silently drops the oldest entry once full;
//! the event map holds at most one pending delta per account until the
//! notification endpoint drains it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::models::AccountId;

/// Placeholder for entries that are not about a single account
pub const NO_ACCOUNT: &str = "-";

pub const DEFAULT_LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: Severity,
    pub email: String,
    pub message: String,
}

#[derive(Debug)]
pub struct EventSink {
    capacity: usize,
    log: Mutex<VecDeque<LogEntry>>,
    new_mail: Mutex<HashMap<AccountId, u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // entries are plain data, a panic mid-push leaves nothing half-written
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            log: Mutex::new(VecDeque::with_capacity(capacity)),
            new_mail: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest when full
    pub fn record(&self, level: Severity, email: &str, message: impl Into<String>) {
        let entry = LogEntry {
            time: Utc::now(),
            level,
            email: if email.is_empty() { NO_ACCOUNT.to_string() } else { email.to_string() },
            message: message.into(),
        };

        let mut log = lock(&self.log);
        log.push_front(entry);
        log.truncate(self.capacity);
    }

    /// Entries, newest first
    pub fn recent(&self) -> Vec<LogEntry> {
        lock(&self.log).iter().cloned().collect()
    }

    /// Remember that `account_id` gained `delta` unread messages
    ///
    /// An undrained delta for the same account is overwritten, not summed.
    pub fn note_new_mail(&self, account_id: AccountId, delta: u32) {
        if delta == 0 {
            return;
        }
        lock(&self.new_mail).insert(account_id, delta);
    }

    /// Return all pending deltas and clear them in one step
    pub fn drain_events(&self) -> HashMap<AccountId, u32> {
        std::mem::take(&mut *lock(&self.new_mail))
    }

    pub fn pending_events(&self) -> usize {
        lock(&self.new_mail).len()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

//! SQLite-backed store
//!
//! A single connection guarded by a mutex; every call runs on the blocking
//! pool so the scheduler's event loop never waits on disk I/O. Timestamps are
//! stored as RFC 3339 text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{Store, UnitOfWork};
use crate::error::{Result, SyncError};
use crate::models::{
    Account, AccountId, AccountStatus, Group, GroupId, Protocol, RefreshKind,
    RefreshRecord, RefreshStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    auto_sync INTEGER NOT NULL DEFAULT 0,
    sync_interval_minutes INTEGER NOT NULL DEFAULT 0,
    sync_batch_size INTEGER NOT NULL DEFAULT 0,
    auto_refresh_token INTEGER NOT NULL DEFAULT 0,
    refresh_interval_hours INTEGER NOT NULL DEFAULT 0,
    proxy_url TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL,
    password TEXT NOT NULL DEFAULT '',
    client_id TEXT,
    refresh_token TEXT,
    access_token TEXT,
    token_expires_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    unread_count INTEGER NOT NULL DEFAULT 0,
    last_synced TEXT,
    last_error TEXT,
    sync_method TEXT,
    graph_enabled INTEGER,
    imap_enabled INTEGER,
    pop3_enabled INTEGER,
    refresh_status TEXT NOT NULL DEFAULT 'unknown',
    last_refresh_at TEXT,
    group_id INTEGER REFERENCES groups(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accounts_group ON accounts(group_id, status);

CREATE TABLE IF NOT EXISTS emails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    message_id TEXT NOT NULL,
    subject TEXT NOT NULL DEFAULT '',
    sender_name TEXT NOT NULL DEFAULT '',
    sender_address TEXT NOT NULL DEFAULT '',
    received_at TEXT,
    is_read INTEGER NOT NULL DEFAULT 0,
    body_preview TEXT NOT NULL DEFAULT '',
    folder TEXT NOT NULL DEFAULT 'inbox',
    UNIQUE (account_id, message_id)
);

CREATE TABLE IF NOT EXISTS refresh_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    email TEXT NOT NULL,
    refresh_type TEXT NOT NULL,
    success INTEGER NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);
"#;

const ACCOUNT_COLUMNS: &str = "id, email, password, client_id, refresh_token, access_token, \
    token_expires_at, status, unread_count, last_synced, last_error, sync_method, \
    graph_enabled, imap_enabled, pop3_enabled, refresh_status, last_refresh_at, group_id, created_at";

const GROUP_COLUMNS: &str = "id, name, auto_sync, sync_interval_minutes, sync_batch_size, \
    auto_refresh_token, refresh_interval_hours, proxy_url, created_at";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        info!("Opened SQLite store at {:?}", path);
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| SyncError::Store("SQLite connection lock poisoned".to_string()))?;
            job(&mut conn)
        })
        .await
        .map_err(|e| SyncError::Store(format!("SQLite worker failed: {}", e)))?
    }

    /// Insert or update a group record
    pub async fn save_group(&self, group: Group) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO groups ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(id) DO UPDATE SET {}",
                    GROUP_COLUMNS,
                    update_clause(GROUP_COLUMNS)
                ),
                params![
                    group.id,
                    group.name,
                    group.auto_sync,
                    group.sync_interval_minutes,
                    group.sync_batch_size,
                    group.auto_refresh_token,
                    group.refresh_interval_hours,
                    group.proxy_url,
                    group.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Insert or update an account record
    pub async fn save_account(&self, account: Account) -> Result<()> {
        self.run(move |conn| {
            upsert_account(conn, &account)?;
            Ok(())
        })
        .await
    }

    /// Stored `(message_id, subject)` pairs of one account
    pub async fn message_subjects(&self, account_id: AccountId) -> Result<Vec<(String, String)>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, subject FROM emails WHERE account_id = ?1 ORDER BY message_id",
            )?;
            let rows = stmt
                .query_map(params![account_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn query_groups(&self, filter: &'static str) -> Result<Vec<Group>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM groups WHERE {} = 1 ORDER BY id",
                GROUP_COLUMNS, filter
            ))?;
            let groups = stmt
                .query_map([], group_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(groups)
        })
        .await
    }
}

fn upsert_account(conn: &Connection, account: &Account) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO accounts ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
             ON CONFLICT(id) DO UPDATE SET {}",
            ACCOUNT_COLUMNS,
            update_clause(ACCOUNT_COLUMNS)
        ),
        params![
            account.id,
            account.email,
            account.password,
            account.client_id,
            account.refresh_token,
            account.access_token,
            account.token_expires_at.map(|at| at.to_rfc3339()),
            account.status.as_str(),
            account.unread_count,
            account.last_synced.map(|at| at.to_rfc3339()),
            account.last_error,
            account.sync_method.map(|method| method.as_str()),
            account.graph_enabled,
            account.imap_enabled,
            account.pop3_enabled,
            account.refresh_status.as_str(),
            account.last_refresh_at.map(|at| at.to_rfc3339()),
            account.group_id,
            account.created_at.to_rfc3339(),
        ],
    )
}

/// `col = excluded.col` for every non-key column, so an upsert never deletes
/// the row and its cascading children
fn update_clause(columns: &str) -> String {
    columns
        .split(',')
        .map(str::trim)
        .filter(|column| *column != "id")
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        auto_sync: row.get(2)?,
        sync_interval_minutes: row.get(3)?,
        sync_batch_size: row.get(4)?,
        auto_refresh_token: row.get(5)?,
        refresh_interval_hours: row.get(6)?,
        proxy_url: row.get(7)?,
        created_at: parse_time(row.get(8)?).unwrap_or_else(Utc::now),
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let status: String = row.get(7)?;
    let sync_method: Option<String> = row.get(11)?;
    let refresh_status: String = row.get(15)?;

    Ok(Account {
        id: row.get(0)?,
        email: row.get(1)?,
        password: row.get(2)?,
        client_id: row.get(3)?,
        refresh_token: row.get(4)?,
        access_token: row.get(5)?,
        token_expires_at: parse_time(row.get(6)?),
        status: AccountStatus::parse(&status).unwrap_or_default(),
        unread_count: row.get(8)?,
        last_synced: parse_time(row.get(9)?),
        last_error: row.get(10)?,
        sync_method: sync_method.as_deref().and_then(Protocol::parse),
        graph_enabled: row.get(12)?,
        imap_enabled: row.get(13)?,
        pop3_enabled: row.get(14)?,
        refresh_status: RefreshStatus::parse(&refresh_status),
        last_refresh_at: parse_time(row.get(16)?),
        group_id: row.get(17)?,
        created_at: parse_time(row.get(18)?).unwrap_or_else(Utc::now),
    })
}

fn refresh_record_from_row(row: &Row<'_>) -> rusqlite::Result<RefreshRecord> {
    let kind: String = row.get(2)?;
    Ok(RefreshRecord {
        account_id: row.get(0)?,
        email: row.get(1)?,
        kind: RefreshKind::parse(&kind).unwrap_or(RefreshKind::Manual),
        success: row.get(3)?,
        error: row.get(4)?,
        at: parse_time(row.get(5)?).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn auto_sync_groups(&self) -> Result<Vec<Group>> {
        self.query_groups("auto_sync").await
    }

    async fn auto_refresh_groups(&self) -> Result<Vec<Group>> {
        self.query_groups("auto_refresh_token").await
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>> {
        self.run(move |conn| {
            let group = conn
                .query_row(
                    &format!("SELECT {} FROM groups WHERE id = ?1", GROUP_COLUMNS),
                    params![id],
                    group_from_row,
                )
                .optional()?;
            Ok(group)
        })
        .await
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        self.run(move |conn| {
            let account = conn
                .query_row(
                    &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                    params![id],
                    account_from_row,
                )
                .optional()?;
            Ok(account)
        })
        .await
    }

    async fn sync_candidates(&self, group_id: GroupId) -> Result<Vec<Account>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM accounts WHERE group_id = ?1 AND status != 'disabled' \
                 ORDER BY created_at, id",
                ACCOUNT_COLUMNS
            ))?;
            let accounts = stmt
                .query_map(params![group_id], account_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
        .await
    }

    async fn known_message_ids(&self, account_id: AccountId) -> Result<HashSet<String>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT message_id FROM emails WHERE account_id = ?1")?;
            let ids = stmt
                .query_map(params![account_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn failed_refresh_accounts(&self) -> Result<Vec<Account>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM accounts WHERE refresh_status = 'failed' AND status != 'disabled' \
                 ORDER BY id",
                ACCOUNT_COLUMNS
            ))?;
            let accounts = stmt
                .query_map([], account_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
        .await
    }

    async fn commit(&self, work: UnitOfWork) -> Result<usize> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            upsert_account(&tx, &work.account)?;

            let mut inserted = 0;
            {
                let mut insert_message = tx.prepare(
                    "INSERT OR IGNORE INTO emails (account_id, message_id, subject, sender_name, \
                     sender_address, received_at, is_read, body_preview, folder) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for message in &work.new_messages {
                    inserted += insert_message.execute(params![
                        message.account_id,
                        message.message_id,
                        message.subject,
                        message.sender_name,
                        message.sender_address,
                        message.received_at.map(|at| at.to_rfc3339()),
                        message.is_read,
                        message.body_preview,
                        message.folder.as_str(),
                    ])?;
                }

                let mut insert_refresh = tx.prepare(
                    "INSERT INTO refresh_logs (account_id, email, refresh_type, success, error, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for record in &work.refresh_records {
                    insert_refresh.execute(params![
                        record.account_id,
                        record.email,
                        record.kind.as_str(),
                        record.success,
                        record.error,
                        record.at.to_rfc3339(),
                    ])?;
                }
            }

            tx.commit()?;

            debug!(
                "Committed account {} with {} new message(s)",
                work.account.id, inserted
            );
            Ok(inserted)
        })
        .await
    }

    async fn refresh_history(&self, limit: usize) -> Result<Vec<RefreshRecord>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, email, refresh_type, success, error, created_at \
                 FROM refresh_logs ORDER BY id DESC LIMIT ?1",
            )?;
            let records = stmt
                .query_map(params![limit as i64], refresh_record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

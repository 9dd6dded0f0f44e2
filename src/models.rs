use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AccountId = i64;
pub type GroupId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Syncing,
    Error,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Syncing => "syncing",
            AccountStatus::Error => "error",
            AccountStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AccountStatus::Active),
            "syncing" => Some(AccountStatus::Syncing),
            "error" => Some(AccountStatus::Error),
            "disabled" => Some(AccountStatus::Disabled),
            _ => None,
        }
    }
}

/// Wire protocol used to reach a mailbox
///
/// The two IMAP generations differ in server host and in the token endpoint
/// used to obtain an access token the server accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Graph,
    ImapNew,
    ImapOld,
}

impl Protocol {
    /// Default fallback order when no affinity is cached
    pub const DEFAULT_ORDER: [Protocol; 3] = [Protocol::Graph, Protocol::ImapNew, Protocol::ImapOld];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Graph => "graph",
            Protocol::ImapNew => "imap_new",
            Protocol::ImapOld => "imap_old",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "graph" => Some(Protocol::Graph),
            "imap_new" => Some(Protocol::ImapNew),
            "imap_old" => Some(Protocol::ImapOld),
            _ => None,
        }
    }

    pub fn is_imap(&self) -> bool {
        matches!(self, Protocol::ImapNew | Protocol::ImapOld)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The small fixed set of folders that are synchronized
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Folder {
    #[default]
    Inbox,
    Junk,
}

impl Folder {
    /// Well-known folder name in the Graph API
    pub fn graph_name(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Junk => "junkemail",
        }
    }

    /// Mailbox name on the IMAP server
    pub fn imap_name(&self) -> &'static str {
        match self {
            Folder::Inbox => "INBOX",
            Folder::Junk => "Junk",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Junk => "junk",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbox" => Some(Folder::Inbox),
            "junk" => Some(Folder::Junk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    #[default]
    Unknown,
    Success,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Unknown => "unknown",
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "success" => RefreshStatus::Success,
            "failed" => RefreshStatus::Failed,
            _ => RefreshStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub password: String,
    pub client_id: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: AccountStatus,
    pub unread_count: u32,
    pub last_synced: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Affinity hint: the protocol that last worked for this mailbox
    pub sync_method: Option<Protocol>,
    /// Capability flags: `None` means not yet known
    pub graph_enabled: Option<bool>,
    pub imap_enabled: Option<bool>,
    pub pop3_enabled: Option<bool>,
    pub refresh_status: RefreshStatus,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub group_id: Option<GroupId>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            password: String::new(),
            client_id: None,
            refresh_token: None,
            access_token: None,
            token_expires_at: None,
            status: AccountStatus::Active,
            unread_count: 0,
            last_synced: None,
            last_error: None,
            sync_method: None,
            graph_enabled: None,
            imap_enabled: None,
            pop3_enabled: None,
            refresh_status: RefreshStatus::Unknown,
            last_refresh_at: None,
            group_id: None,
            created_at: Utc::now(),
        }
    }

    /// Record which protocol answered, so the next sync tries it first
    pub fn mark_protocol_success(&mut self, protocol: Protocol) {
        self.sync_method = Some(protocol);
        match protocol {
            Protocol::Graph => self.graph_enabled = Some(true),
            Protocol::ImapNew | Protocol::ImapOld => self.imap_enabled = Some(true),
        }
    }

    /// Forget the affinity so the next round starts from the default order
    pub fn reset_protocol_affinity(&mut self) {
        self.sync_method = None;
        self.graph_enabled = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub auto_sync: bool,
    /// 0 means the scheduler default
    pub sync_interval_minutes: u32,
    /// 0 means the scheduler default
    pub sync_batch_size: u32,
    pub auto_refresh_token: bool,
    pub refresh_interval_hours: u32,
    pub proxy_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            auto_sync: false,
            sync_interval_minutes: 0,
            sync_batch_size: 0,
            auto_refresh_token: false,
            refresh_interval_hours: 0,
            proxy_url: None,
            created_at: Utc::now(),
        }
    }

    /// Proxy URL, ignoring blank values
    pub fn proxy(&self) -> Option<&str> {
        self.proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// A message as returned by any protocol, before ingestion
///
/// Every transport normalizes into this shape so ingestion never needs to
/// know which protocol produced it. `received_at` is left as the raw
/// provider timestamp; ingestion decides whether it parses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FetchedMessage {
    pub id: Option<String>,
    pub subject: Option<String>,
    pub sender_name: Option<String>,
    pub sender_address: Option<String>,
    pub received_at: Option<String>,
    pub is_read: bool,
    pub preview: Option<String>,
    pub folder: Folder,
}

/// A message as held by the local store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub account_id: AccountId,
    pub message_id: String,
    pub subject: String,
    pub sender_name: String,
    pub sender_address: String,
    pub received_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub body_preview: String,
    pub folder: Folder,
}

/// Result of a successful OAuth refresh-token exchange
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshKind {
    Auto,
    Manual,
    Retry,
}

impl RefreshKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshKind::Auto => "auto",
            RefreshKind::Manual => "manual",
            RefreshKind::Retry => "retry",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(RefreshKind::Auto),
            "manual" => Some(RefreshKind::Manual),
            "retry" => Some(RefreshKind::Retry),
            _ => None,
        }
    }
}

/// History entry for an explicit token refresh
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshRecord {
    pub account_id: AccountId,
    pub email: String,
    pub kind: RefreshKind,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

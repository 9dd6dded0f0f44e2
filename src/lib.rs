//! Mailbox Sync
//!
//! A scheduler that keeps a fleet of Outlook mailboxes synchronized without
//! hammering the provider: every group syncs a small rotating batch of its
//! accounts per timer firing, and each account is reached over whichever
//! protocol works for it.
//!
//! # Overview
//!
//! - **Rotation**: per-group round-robin batches with round tracking and cooldown
//! - **Token gate**: access tokens are only renewed close to expiry
//! - **Protocol fallback**: Graph REST, then two IMAP generations, with a cached
//!   per-account affinity
//! - **Ingest**: batch dedup of fetched messages against stored provider ids
//! - **Events**: bounded operator log and new-mail notifications
//!
//! # Example Usage
//!
//! ```no_run
//! use mailbox_sync::{cli, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let store = cli::open_store(&config)?;
//!     let scheduler = cli::build_scheduler(&config, store);
//!
//!     for report in scheduler.run_one_sync_cycle().await {
//!         println!("group {}: {} synced", report.group_id, report.synced);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`events`] - Operator log ring buffer and new-mail events
//! - [`fallback`] - Protocol fallback engine
//! - [`ingest`] - Message dedup and ingest
//! - [`models`] - Core data structures
//! - [`provider`] - Mail provider client (OAuth, Graph, IMAP)
//! - [`rate_limiter`] - Outbound request pacing
//! - [`rotation`] - Round-robin batch arithmetic
//! - [`scheduler`] - Per-group timers and batch execution
//! - [`store`] - Persistent store seam and implementations
//! - [`token`] - Token freshness gate
//! - [`transport`] - Per-protocol transport strategies
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod ingest;
pub mod models;
pub mod provider;
pub mod rate_limiter;
pub mod rotation;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod transport;

// Re-export commonly used types for convenience
pub use error::{Result, SyncError};

pub use models::{
    Account, AccountStatus, FetchedMessage, Folder, Group, Protocol, RefreshKind, RefreshRecord,
    StoredMessage,
};

pub use config::{Config, ProviderConfig, SchedulerConfig};

pub use events::{EventSink, LogEntry, Severity};
pub use fallback::{FallbackEngine, SyncResult};
pub use provider::{Credentials, MailProvider, OutlookProvider};
pub use scheduler::{BatchReport, RefreshSummary, Scheduler, SchedulerStatus};
pub use store::{MemoryStore, Store, UnitOfWork};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use token::TokenGate;
pub use transport::{FetchPlan, Transport};

pub use cli::{Cli, Commands};

//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{truncate_chars, Result};
use crate::models::RefreshRecord;
use crate::provider::OutlookProvider;
use crate::scheduler::{BatchReport, RefreshSummary, Scheduler};
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(name = "mailbox-sync")]
#[command(version = "0.1.0")]
#[command(about = "Staggered multi-protocol sync scheduler for Outlook mailboxes", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// Sync one batch of every auto-sync group and exit
    SyncOnce,

    /// Refresh the token of a single account
    Refresh {
        /// Account id
        account_id: i64,
    },

    /// Retry token refresh for every account whose last refresh failed
    RefreshFailed,

    /// Show recent token refresh attempts
    History {
        /// Number of records to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Generate an example configuration file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Open the configured store
///
/// Without the `sqlite` feature the store lives in memory and starts empty.
pub fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    #[cfg(feature = "sqlite")]
    {
        info!("Opening store at {:?}", config.store.path);
        let store = crate::store::SqliteStore::open(&config.store.path)?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        tracing::warn!(
            "Built without SQLite support, ignoring {:?} and using an empty in-memory store",
            config.store.path
        );
        Ok(Arc::new(crate::store::MemoryStore::new()))
    }
}

/// Scheduler wired to the production Outlook provider
pub fn build_scheduler(config: &Config, store: Arc<dyn Store>) -> Arc<Scheduler> {
    let provider = Arc::new(OutlookProvider::new(config.provider.clone()));
    Arc::new(Scheduler::new(config, store, provider))
}

/// Run jobs until ctrl-c
pub async fn run_scheduler(scheduler: &Arc<Scheduler>) -> Result<()> {
    scheduler.start().await?;
    println!("Scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    scheduler.stop().await;
    let events = scheduler.drain_new_mail_events();
    if !events.is_empty() {
        info!("{} account(s) had undelivered new-mail events at shutdown", events.len());
    }
    Ok(())
}

pub fn print_batch_reports(reports: &[BatchReport]) {
    if reports.is_empty() {
        println!("No auto-sync groups to sync.");
        return;
    }

    println!("\n========================================");
    println!("Sync Summary");
    println!("========================================");
    for report in reports {
        if report.in_cooldown {
            println!("Group {}: cooling down before round {}", report.group_id, report.round);
            continue;
        }
        println!(
            "Group {} (round {}): {} selected, {} synced, {} skipped, {} failed, {} new message(s){}",
            report.group_id,
            report.round,
            report.selected.len(),
            report.synced,
            report.skipped,
            report.failed,
            report.new_messages,
            if report.round_completed { ", round complete" } else { "" }
        );
    }
    println!("========================================");
}

pub fn print_refresh_summary(summary: &RefreshSummary) {
    println!(
        "Token refresh: {} succeeded, {} failed",
        summary.succeeded, summary.failed
    );
}

pub fn print_refresh_history(records: &[RefreshRecord]) {
    if records.is_empty() {
        println!("No token refresh attempts recorded.");
        return;
    }

    for record in records {
        println!(
            "{}  {:<7} {:<32} {}{}",
            record.at.format("%Y-%m-%d %H:%M:%S"),
            record.kind.as_str(),
            record.email,
            if record.success { "ok" } else { "FAILED" },
            record
                .error
                .as_deref()
                .map(|error| format!(": {}", truncate_chars(error, 80)))
                .unwrap_or_default()
        );
    }
}

use anyhow::Result;
use clap::Parser;
use mailbox_sync::cli::{self, Cli, Commands};
use mailbox_sync::config::Config;
use mailbox_sync::error::SyncError;
use mailbox_sync::store::Store;
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Exit with proper code on error
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: mailbox-sync --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // reqwest and the IMAP TLS stack both sit on rustls, pick one process-wide provider
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mailbox_sync=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailbox_sync=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    if let Commands::InitConfig { output, force } = &cli.command {
        if output.exists() && !force {
            return Err(SyncError::Config(format!(
                "Configuration file already exists at {:?}. Use --force to overwrite.",
                output
            ))
            .into());
        }

        Config::create_example(output).await?;

        println!("Created example configuration file at: {:?}", output);
        println!("\nKey settings to review:");
        println!("  - scheduler.default_interval_minutes: minutes between batches of a group");
        println!("  - scheduler.default_batch_size: accounts synced per batch");
        println!("  - scheduler.round_cooldown_minutes: pause after every full round");
        println!("  - provider.default_client_id: OAuth client for accounts without one");
        println!("  - store.path: SQLite database location");
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    let store = cli::open_store(&config)?;
    let scheduler = cli::build_scheduler(&config, store.clone());

    match cli.command {
        Commands::Run => {
            tracing::info!("Mailbox sync scheduler starting...");
            cli::run_scheduler(&scheduler).await?;
        }

        Commands::SyncOnce => {
            tracing::info!("Running one sync cycle");
            let reports = scheduler.run_one_sync_cycle().await;
            cli::print_batch_reports(&reports);
        }

        Commands::Refresh { account_id } => {
            let summary = scheduler.refresh_account(account_id).await?;
            cli::print_refresh_summary(&summary);
        }

        Commands::RefreshFailed => {
            let summary = scheduler.retry_failed_refreshes().await?;
            cli::print_refresh_summary(&summary);
        }

        Commands::History { limit } => {
            let records = store.refresh_history(limit).await?;
            cli::print_refresh_history(&records);
        }

        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

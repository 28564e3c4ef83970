//! # Mailwave — batch email campaign engine
//!
//! Delivers personalized campaigns from a spreadsheet recipient list under a
//! business-hours window with randomized spacing, via an at-least-once task
//! queue and an idempotent delivery worker.
//!
//! Usage:
//!   mailwave serve                       # Start gateway + delivery queue
//!   mailwave serve --config ./mw.toml    # Custom config file
//!   mailwave reset-stuck --max-age 30    # Recover campaigns stuck mid-dispatch

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mailwave_core::MailwaveConfig;
use mailwave_engine::{CampaignStore, DeliveryWorker, Dispatcher};
use mailwave_queue::{LocalQueue, TaskQueue, run_queue};
use mailwave_recipients::{RecipientSource, SheetsSource};
use mailwave_transport::{EmailTransport, MockTransport, SmtpMailer};

#[derive(Parser)]
#[command(name = "mailwave", version, about = "📬 Mailwave — batch email campaign engine")]
struct Cli {
    /// Path to config file (default: ~/.mailwave/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway and the delivery queue (default)
    Serve,
    /// Reset campaigns stuck in sending with nothing sent
    ResetStuck {
        /// Minutes a campaign may sit in sending before it counts as stuck
        #[arg(long, default_value_t = 30)]
        max_age: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "mailwave=debug,tower_http=debug"
    } else {
        "mailwave=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => MailwaveConfig::load_from(path)?,
        None => MailwaveConfig::load()?,
    };

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let store = Arc::new(CampaignStore::open(
        &config.storage.data_dir.join("campaigns.db"),
    )?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store).await,
        Command::ResetStuck { max_age } => {
            let reset = store.reset_stuck_older_than(max_age, chrono::Utc::now())?;
            if reset.is_empty() {
                tracing::info!("✅ No stuck campaigns found");
            } else {
                tracing::info!("🔧 Reset {} stuck campaign(s): {:?}", reset.len(), reset);
            }
            Ok(())
        }
    }
}

async fn serve(config: MailwaveConfig, store: Arc<CampaignStore>) -> Result<()> {
    let queue = Arc::new(LocalQueue::open(
        &config.storage.data_dir.join("queue.db"),
        &config.queue,
    )?);

    let transport: Arc<dyn EmailTransport> = if config.smtp.enabled {
        Arc::new(SmtpMailer::new(config.smtp.clone()))
    } else {
        tracing::warn!("⚠️ SMTP disabled — deliveries go to the mock transport (dry run)");
        Arc::new(MockTransport::new())
    };

    let source: Arc<dyn RecipientSource> = Arc::new(SheetsSource::new(config.sheets.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        source.clone(),
        queue.clone() as Arc<dyn TaskQueue>,
    ));
    let worker = Arc::new(DeliveryWorker::new(
        store.clone(),
        transport,
        source.clone(),
    ));

    // Delivery loop: survives restarts because tasks and rows are on disk
    let queue_for_loop = queue.clone();
    let tick = config.queue.tick_secs;
    tokio::spawn(async move {
        run_queue(queue_for_loop, worker, tick).await;
    });

    let state = mailwave_gateway::AppState {
        store,
        dispatcher,
        queue: queue as Arc<dyn TaskQueue>,
        start_time: std::time::Instant::now(),
    };
    mailwave_gateway::start(&config.gateway, state).await
}

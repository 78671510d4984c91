//! State notifier daemon

use clap::Parser;
use state_notifier::{
    Audience, Config, HttpStatusFetcher, JsonFileStore, LogSink, Notifier, NotificationSink,
    Result, SystemClock, WebhookSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "Polls watch-groups and announces status transitions")]
struct Cli {
    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Directory for persisted state (overrides DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();
    let cli = Cli::parse();

    info!("Starting state notifier v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Notifier configuration - Groups: {:?}, Interval: {}s, Thresholds: {}s/{}s, Data: {}",
        config.watch_groups,
        config.poll_interval.as_secs(),
        config.soft_threshold.as_secs(),
        config.hard_threshold.as_secs(),
        config.data_dir.display()
    );

    let clock = Arc::new(SystemClock);
    let fetcher = Arc::new(HttpStatusFetcher::new(
        config.status_base_url.clone(),
        config.http_timeout,
        config.discount_host_player,
        clock.clone(),
    )?);
    let sink: Arc<dyn NotificationSink> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(
            url.clone(),
            config.http_timeout,
            config.max_retries,
            config.retry_backoff_ms,
        )?),
        None => {
            info!("No WEBHOOK_URL set; notifications will be logged only");
            Arc::new(LogSink)
        }
    };
    let store = Arc::new(JsonFileStore::open(&config.data_dir)?);

    let notifier = Notifier::builder(fetcher, sink, store)
        .settings(config.notifier_settings())
        .clock(clock)
        .build()?;

    for key in &config.watch_groups {
        notifier
            .add_watch_group(key, Audience::Channel(config.status_audience.clone()))
            .await?;
    }

    if cli.once {
        let report = notifier.tick().await;
        info!(
            "Single cycle complete - Polled: {:?}, Failed: {:?}, Transitions: {}",
            report.polled, report.failed, report.transitions
        );
        return Ok(());
    }

    notifier.start(config.poll_interval);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    info!("Shutting down state notifier");
    notifier.shutdown().await;

    let stats = notifier.stats();
    info!(
        "Final metrics - Ticks: {}, Fetch success rate: {:.1}%, Transitions: {}, Notifications: {}",
        stats.ticks, stats.fetch_success_rate, stats.transitions, stats.notifications
    );

    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

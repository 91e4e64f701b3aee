use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stand_tracker::{
    FileStore, HttpCollector, ReconnectSignal, StandTracker, TrackerConfig,
    spawn_connectivity_monitor, spawn_replay_worker,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stand-tracker")]
#[command(about = "Track stand visits and report completion to the collector")]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    collector_url: Option<String>,
    /// Number of stands to collect
    #[arg(long, global = true)]
    stands: Option<u32>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a scanned code (a stand number or a URL with `?stand=`)
    Scan { code: String },
    /// Show progress and queued reports
    Status,
    /// Retry every pending report now
    Sync,
    /// Forget identity, visits and pending reports
    Reset,
    /// Replay pending reports whenever the collector becomes reachable
    Watch,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let store = Arc::new(
        FileStore::open(&config.data_dir)
            .with_context(|| format!("failed to open {}", config.data_dir.display()))?,
    );
    let collector = Arc::new(HttpCollector::new(&config).context("failed to build collector")?);
    let mut tracker = StandTracker::new(
        store,
        collector.clone(),
        config.stand_count,
        config.replay.clone(),
    )
    .context("failed to load tracker state")?;

    let ok = match cli.command {
        Command::Scan { code } => tracker.start_with_code(&code).await.is_ok(),
        Command::Status => tracker.start(None).await.is_ok(),
        Command::Sync => tracker.sync_now().await.is_ok(),
        Command::Reset => tracker.reset_all().is_ok(),
        Command::Watch => {
            watch(tracker, collector, &config).await?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    print_progress(&tracker)?;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stand_tracker=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<TrackerConfig> {
    let mut config = match &cli.config {
        Some(path) => TrackerConfig::from_file(path)
            .with_context(|| format!("failed to load config '{}'", path.display()))?,
        None => TrackerConfig::default(),
    };
    if let Some(url) = &cli.collector_url {
        config = config.collector_url(url);
    }
    if let Some(dir) = &cli.data_dir {
        config = config.data_dir(dir);
    }
    if let Some(stands) = cli.stands {
        config = config.stand_count(stands);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_progress(tracker: &StandTracker) -> Result<()> {
    let progress = tracker.progress().context("failed to read progress")?;
    let identity = progress
        .identity
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "(none)".to_string());

    println!("Anonymous ID: {}", identity);
    println!(
        "{} / {} stands visited",
        progress.unique_count, progress.stand_count
    );
    for (stand, visited) in &progress.stands {
        println!("  Stand {} {}", stand, if *visited { "[x]" } else { "[ ]" });
    }
    if progress.reported {
        println!("Completion reported.");
    }
    if progress.pending_reports > 0 {
        println!("Pending reports: {}", progress.pending_reports);
    }
    println!("Status: {}", tracker.status());
    Ok(())
}

async fn watch(
    tracker: StandTracker,
    collector: Arc<HttpCollector>,
    config: &TrackerConfig,
) -> Result<()> {
    let tracker = Arc::new(Mutex::new(tracker));
    let (signal, events) = ReconnectSignal::channel();

    let worker = spawn_replay_worker(tracker.clone(), events);
    let monitor = spawn_connectivity_monitor(collector, signal, config.probe_interval);
    info!(
        collector = %config.collector_url,
        interval_ms = config.probe_interval.as_millis() as u64,
        "watching for connectivity"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to install ctrl+c handler");
    }

    monitor.stop().await.context("failed to stop connectivity monitor")?;
    worker.stop().await.context("failed to stop replay worker")?;

    let guard = tracker.lock().await;
    print_progress(&guard)
}

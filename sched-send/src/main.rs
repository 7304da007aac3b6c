//! sched-send - Background daemon for scheduled posting
//!
//! Loads pending posts from the database, fires each one at its scheduled
//! time and records the result. Changes made by `sched-queue` while the
//! daemon runs are picked up by a periodic reconcile pass.

use chrono::Utc;
use clap::Parser;
use libschedcast::logging::LoggingConfig;
use libschedcast::platforms::dry_run::DryRunPublisher;
use libschedcast::{
    Config, Database, Event, PostScheduler, PublisherRegistry, RunOutcome, SchedcastError,
    SystemClock,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sched-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled posting")]
#[command(long_about = "\
sched-send - Background daemon for scheduled posting

DESCRIPTION:
    sched-send is a long-running daemon that fires scheduled posts at
    their scheduled time and records whether they were posted or failed.

    On startup it registers every pending post from the database. Posts
    whose time has already passed fire immediately. Every reconcile
    interval it re-reads the database so posts added, cancelled or
    rescheduled with sched-queue take effect without a restart.

USAGE:
    # Run in foreground (logs to stderr)
    sched-send

    # Wake at least every 5 seconds
    sched-send --poll-interval 5

    # Fire everything that is due, wait for it to finish, and exit
    sched-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight posts finish first)

CONFIGURATION:
    Configuration file: ~/.config/schedcast/config.toml
    Database location: ~/.local/share/schedcast/posts.db

    [scheduling]
    poll_interval = 1          # seconds, upper bound between due checks
    restore_on_startup = true  # register pending posts at startup; when false
                               # they are picked up by the first reconcile pass
    reconcile_interval = 30    # seconds between database re-reads

    [platforms]
    enabled = [\"twitter\", \"facebook\", \"instagram\"]

    Override with environment variables:
        SCHEDCAST_CONFIG     - Path to config file
        SCHEDCAST_DB_PATH    - Path to database file
        SCHEDCAST_LOG_FORMAT - text, json or pretty
        SCHEDCAST_LOG_LEVEL  - error, warn, info, debug, trace

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Fire every due post once, wait for the runs, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("sched-send failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<SchedcastError>()
        .map_or(1, SchedcastError::exit_code)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    let mut engine_config = config.scheduling.engine_config();
    if let Some(seconds) = cli.poll_interval {
        engine_config.poll_interval = Duration::from_secs(seconds.max(1));
    }
    info!("Poll interval: {}s", engine_config.poll_interval.as_secs());

    let publishers = build_publishers(&config.platforms.enabled);
    let scheduler = PostScheduler::new(Arc::new(db), publishers, Arc::new(SystemClock), engine_config);

    if cli.once {
        return run_once(&scheduler).await;
    }

    info!("sched-send daemon starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    if config.scheduling.restore_on_startup {
        scheduler.restore_pending().await?;
    }
    scheduler.start();

    run_daemon_loop(&scheduler, config.scheduling.reconcile_every(), shutdown).await;

    scheduler.shutdown().await;
    info!("sched-send daemon stopped");
    Ok(())
}

/// One dry-run publisher per enabled platform
fn build_publishers(enabled: &[String]) -> PublisherRegistry {
    let mut registry = PublisherRegistry::new();
    for platform in enabled {
        registry.register(DryRunPublisher::new(platform));
    }

    if registry.is_empty() {
        warn!("No platforms are enabled in configuration; every post will fail");
    } else {
        info!("Publishing to: {}", registry.names().join(", "));
    }
    registry
}

/// Restore, fire what is due now, drain, and print one line per run
async fn run_once(scheduler: &PostScheduler) -> anyhow::Result<()> {
    let mut events = scheduler.subscribe();

    scheduler.restore_pending().await?;
    let fired = scheduler.engine().fire_due(Utc::now());
    scheduler.engine().wait_idle().await;

    while let Ok(event) = events.try_recv() {
        if let Event::Completed { report } = event {
            println!("{}\t{}", report.post_id, describe(&report.outcome));
        }
    }

    info!("Processed {} due post(s) once, exiting", fired);
    Ok(())
}

fn describe(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Finished(status) => status.to_string(),
        RunOutcome::Skipped(status) => format!("skipped ({})", status),
        RunOutcome::Superseded(status) => format!("superseded ({})", status),
        RunOutcome::Rescheduled => "rescheduled".to_string(),
        RunOutcome::AlreadyClaimed => "already claimed".to_string(),
        RunOutcome::Vanished => "vanished".to_string(),
    }
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

/// Watch for shutdown and periodically reconcile the engine with the database
async fn run_daemon_loop(
    scheduler: &PostScheduler,
    reconcile_every: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let mut last_reconcile = Instant::now();

    loop {
        tick.tick().await;

        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        if last_reconcile.elapsed() >= reconcile_every {
            if let Err(e) = scheduler.reconcile().await {
                error!("Reconcile failed: {}", e);
            }
            last_reconcile = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libschedcast::PostStatus;

    #[test]
    fn test_exit_code_from_library_error() {
        let err = anyhow::Error::from(SchedcastError::InvalidInput("bad".to_string()));
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn test_describe_outcomes() {
        assert_eq!(describe(&RunOutcome::Finished(PostStatus::Posted)), "posted");
        assert_eq!(
            describe(&RunOutcome::Skipped(PostStatus::Cancelled)),
            "skipped (cancelled)"
        );
        assert_eq!(describe(&RunOutcome::Rescheduled), "rescheduled");
        assert_eq!(describe(&RunOutcome::AlreadyClaimed), "already claimed");
        assert_eq!(describe(&RunOutcome::Vanished), "vanished");
    }

    #[test]
    fn test_build_publishers_normalizes_names() {
        let registry = build_publishers(&["Twitter".to_string(), "facebook".to_string()]);
        assert_eq!(registry.names(), vec!["facebook", "twitter"]);
    }
}

//! telepolld - Telemetry polling daemon.
//!
//! Loads a project file, collects every enabled sensor on its own interval
//! and persists the values under the data directory. Notifications and
//! reports are spooled into an outbox directory.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use telepoll_core::pool::DEFAULT_POOL_SIZE;
use telepoll_core::{
    OutboxNotifier, Ports, Project, ProjectConfig, ProjectOptions, SeriesStore, StatsSnapshot,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Telemetry polling daemon.
#[derive(Parser)]
#[command(name = "telepolld", about = "Telemetry polling daemon", version)]
struct Args {
    /// Project file (JSON). A missing or unreadable file starts an empty project.
    #[arg(short, long, default_value = "./project.json")]
    project: PathBuf,

    /// Directory for collected series.
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Directory where notifications, reports and uploads are spooled.
    #[arg(long, default_value = "./outbox")]
    outbox: PathBuf,

    /// Maximum number of concurrent collections.
    #[arg(short, long, default_value_t = DEFAULT_POOL_SIZE)]
    workers: usize,

    /// Seconds to wait for in-flight collections on shutdown.
    #[arg(long, default_value = "10")]
    drain_timeout: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["telepolld", "telepoll_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// One-line summary of scheduler activity for the periodic status log.
fn describe_status(stats: &StatsSnapshot, in_flight: usize, sensors: usize) -> String {
    format!(
        "{} sensors, {} in flight, {} ticks, {} dispatched, {} deferred, {} collected, {} failed, {} not persisted",
        sensors,
        in_flight,
        stats.ticks,
        stats.dispatched,
        stats.deferred,
        stats.collected,
        stats.failed,
        stats.persist_failed
    )
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("telepolld {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: project={}, data={}, outbox={}, workers={}",
        args.project.display(),
        args.data_dir.display(),
        args.outbox.display(),
        args.workers
    );

    let store = match SeriesStore::open(args.data_dir.clone()) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open data directory {}: {}", args.data_dir.display(), e);
            std::process::exit(1);
        }
    };

    let config = ProjectConfig::load_or_default(&args.project);
    let notifier = OutboxNotifier::new(args.outbox.clone())
        .with_subject_template(config.settings.subject_template.clone());
    let ports = Ports::new(Arc::new(notifier), Arc::new(store));
    let options = ProjectOptions {
        pool_size: args.workers,
        ..ProjectOptions::default()
    };

    let project = match Project::from_config(config, ports, options) {
        Ok(project) => project,
        Err(e) => {
            error!("Failed to create project: {}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    if project.sensor_count() == 0 {
        warn!("Project has no sensors; nothing will be collected");
    }
    project.start();
    let started_at = Utc::now();
    let mut last_status = Instant::now();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(SHUTDOWN_POLL);

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            info!(
                "Status: {} (up {}s)",
                describe_status(&project.stats(), project.in_flight(), project.sensor_count()),
                (Utc::now() - started_at).num_seconds()
            );
        }
    }

    info!("Stopping collection");
    project.stop();
    if project.wait_idle(Duration::from_secs(args.drain_timeout)) {
        info!("All collections drained");
    } else {
        warn!(
            "{} collections still running after {}s, exiting anyway",
            project.in_flight(),
            args.drain_timeout
        );
    }

    info!(
        "Shutdown complete: {}",
        describe_status(&project.stats(), project.in_flight(), project.sensor_count())
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_status_lists_counters() {
        let stats = StatsSnapshot {
            ticks: 12,
            dispatched: 30,
            collected: 27,
            failed: 2,
            persist_failed: 1,
            deferred: 4,
            tick_errors: 0,
        };
        let desc = describe_status(&stats, 1, 5);
        assert!(desc.starts_with("5 sensors, 1 in flight"));
        assert!(desc.contains("27 collected"));
        assert!(desc.contains("2 failed"));
        assert!(desc.contains("4 deferred"));
        assert!(desc.contains("1 not persisted"));
    }

    #[test]
    fn args_defaults() {
        let args = Args::parse_from(["telepolld"]);
        assert_eq!(args.workers, DEFAULT_POOL_SIZE);
        assert_eq!(args.drain_timeout, 10);
        assert!(!args.quiet);

        let args = Args::parse_from(["telepolld", "-vv", "--workers", "4", "-p", "p.json"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.workers, 4);
        assert_eq!(args.project, PathBuf::from("p.json"));
    }
}

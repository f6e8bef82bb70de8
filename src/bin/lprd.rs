//! lprd - edge licence-plate recognition daemon
//!
//! This daemon:
//! 1. Loads the layered configuration (file, environment, validation)
//! 2. Runs the pipeline: ingest, condition, infer, telemetry
//! 3. Restarts the pipeline when the config file changes
//! 4. Stops cleanly on Ctrl-C or SIGTERM and prints the final stats

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use lpr_edge::config::CONFIG_ENV;
use lpr_edge::pipeline::{self, Pipeline, Stats};
use lpr_edge::{AppConfig, ConfigWatcher};

const CONFIG_POLL: Duration = Duration::from_secs(1);
const SUPERVISE_TICK: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Edge licence-plate recognition daemon")]
struct Args {
    /// JSON config file; reloaded when it changes.
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

enum Exit {
    Shutdown,
    Reload(Arc<AppConfig>),
    Fatal,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = Arc::new(AppConfig::load_from(args.config.as_deref())?);

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(cfg.as_ref())?);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Release);
    })
    .expect("error setting Ctrl-C handler");

    let (tx, rx) = mpsc::channel();
    let watcher = match &args.config {
        Some(path) => Some(ConfigWatcher::spawn(path.clone(), CONFIG_POLL, tx)?),
        None => None,
    };

    log::info!("lprd {} starting", env!("CARGO_PKG_VERSION"));
    let mut totals: Vec<Stats> = Vec::new();
    let build = |cfg: Arc<AppConfig>| Pipeline::new(cfg).with_shutdown_flag(Arc::clone(&shutdown));
    let mut pipeline = build(Arc::clone(&cfg));
    pipeline.start()?;
    let outcome = loop {
        if let Some(addr) = pipeline.telemetry_addr() {
            log::info!("telemetry listening on {}", addr);
        }

        let exit = supervise(&pipeline, &shutdown, &rx);
        totals.push(pipeline::shutdown(&mut pipeline));

        match exit {
            Exit::Reload(next) => {
                log::info!("restarting pipeline with reloaded config");
                match pipeline::restart_with(next, Arc::clone(&cfg), &build) {
                    Ok((restarted, running)) => {
                        pipeline = restarted;
                        cfg = running;
                    }
                    Err(err) => break Err(err),
                }
            }
            Exit::Shutdown => break Ok(()),
            Exit::Fatal => break Err(anyhow!("stream ingestor gave up; exiting")),
        }
    };

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    for (run, stats) in totals.iter().enumerate() {
        println!("run {}: {}", run + 1, serde_json::to_string(stats)?);
    }
    outcome
}

fn supervise(
    pipeline: &Pipeline,
    shutdown: &AtomicBool,
    reloads: &mpsc::Receiver<Arc<AppConfig>>,
) -> Exit {
    loop {
        if shutdown.load(Ordering::Acquire) || pipeline.stop_requested() {
            log::info!("shutdown signal received, stopping pipeline...");
            return Exit::Shutdown;
        }
        if pipeline.is_fatal() {
            return Exit::Fatal;
        }
        match reloads.recv_timeout(SUPERVISE_TICK) {
            Ok(next) => {
                // Collapse bursts of writes into the newest snapshot.
                let next = reloads.try_iter().last().unwrap_or(next);
                return Exit::Reload(next);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(SUPERVISE_TICK),
        }
    }
}

mod browser;
mod config;
mod download;
mod extract;
mod history;
mod http;
mod listing;
mod notify;
mod orchestrator;
mod probe;
mod variant;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::browser::ChromeSession;
use crate::config::Config;
use crate::download::HlsDownloader;
use crate::history::HistoryStore;
use crate::http::WebClient;
use crate::notify::{LogNotifier, Notifier, NullNotifier};
use crate::orchestrator::Orchestrator;
use crate::probe::ManifestProbe;

#[derive(Debug, Parser)]
#[command(name = "epgrab", version, about = "Download latest or missing episodes")]
struct Cli {
    /// Output directory for finished episodes
    #[arg(long, short = 'o')]
    output_dir: PathBuf,

    /// Work area for segment files before they are merged
    #[arg(long)]
    temp_dir: PathBuf,

    /// Config file path (defaults to the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Segment download workers
    #[arg(long, short = 'c')]
    concurrency: Option<usize>,

    /// Cap on simultaneous in-flight HTTP requests
    #[arg(long, default_value_t = 100)]
    limit_conn: usize,

    /// Take the run lock so overlapping scheduler invocations exit early
    #[arg(long)]
    lock: bool,

    /// Emit a notification per finished or failed episode (off by default)
    #[arg(long)]
    notify: bool,
}

/// Lock file in the system temp dir; removed when the run finishes.
struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn acquire(path: PathBuf) -> Result<RunLock> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create lock file {}", path.display()))?;
        Ok(RunLock { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("epgrab")
        .join("config.json")
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn init_logging(temp_dir: &Path) -> (PathBuf, tracing_appender::non_blocking::WorkerGuard) {
    let file_name = format!("ep_{}.log", chrono::Local::now().format("%Y%m%d"));
    let log_path = temp_dir.join(&file_name);
    let appender = tracing_appender::rolling::never(temp_dir, &file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    (log_path, guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    fs::create_dir_all(&cli.temp_dir).context("create temp dir")?;
    fs::create_dir_all(&cli.output_dir).context("create output dir")?;
    let (log_path, _log_guard) = init_logging(&cli.temp_dir);

    let lock_path = std::env::temp_dir().join("epgrab.lock");
    if lock_path.exists() {
        info!("another run holds the lock, exiting");
        return Ok(());
    }
    let _lock = if cli.lock {
        Some(RunLock::acquire(lock_path)?)
    } else {
        None
    };

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load(&config_path)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping at the next safe point");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let web = WebClient::new(&config.user_agents, cli.limit_conn)?;
    let history = HistoryStore::new(&config.history_path);
    let downloader = HlsDownloader::new(
        web.clone(),
        cli.concurrency.unwrap_or_else(default_concurrency),
    );
    let log_notifier = LogNotifier;
    let null_notifier = NullNotifier;
    let notifier: &dyn Notifier = if cli.notify {
        &log_notifier
    } else {
        &null_notifier
    };
    let probe = ManifestProbe::new(&web, &cli.temp_dir);

    info!("---------------------- start ----------------------");
    let started = Instant::now();
    let mut session = ChromeSession::launch().await.context("launch browser")?;
    let orchestrator = Orchestrator {
        config: &config,
        web: &web,
        probe: &probe,
        history: &history,
        downloader: &downloader,
        notifier,
        output_dir: cli.output_dir.clone(),
        temp_dir: cli.temp_dir.clone(),
        log_path,
        cancel,
    };
    let outcome = orchestrator.run(&mut session).await;
    session.close().await;
    if let Err(e) = outcome {
        error!("run failed: {e:#}");
    }
    info!(elapsed = ?started.elapsed(), "----------------------- end -----------------------");
    Ok(())
}

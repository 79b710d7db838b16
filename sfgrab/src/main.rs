use anyhow::{Context as _, Result};
use clap::Parser;
use sfgrab::config::PipelineConfig;
use sfgrab::coordinator::{Coordinator, HttpCoordinator};
use sfgrab::events::LoggingEventSink;
use sfgrab::observability::{init_tracing, LogFormat};
use sfgrab::pipeline::{default_pipeline, PipelineRunner, Worker};
use sfgrab::stages::{ConcurrencyLimiter, SystemResolver};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Claims items from the tracker and archives them.
#[derive(Debug, Parser)]
#[command(name = "sfgrab", version, about)]
struct Cli {
    /// JSON configuration file; missing settings use defaults. On Unix,
    /// SIGHUP re-reads `rsync_threads` from it unless `--rsync-threads` is
    /// given.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nickname reported to the tracker.
    #[arg(long)]
    downloader: Option<String>,

    /// Working and output directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Items processed at the same time.
    #[arg(long)]
    concurrent_items: Option<usize>,

    /// Concurrent uploads (1 to 4); pins the value for the whole run.
    #[arg(long)]
    rsync_threads: Option<i64>,

    /// Local address the fetcher binds to.
    #[arg(long)]
    bind_address: Option<IpAddr>,

    /// Stop after claiming this many items.
    #[arg(long)]
    max_items: Option<usize>,

    /// Log format: text or json.
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    /// Returns the config, the claim limit and the file to reload the
    /// upload limit from.
    fn into_config(self) -> Result<(PipelineConfig, Option<usize>, Option<PathBuf>)> {
        let reload_from = self.config.clone().filter(|_| self.rsync_threads.is_none());
        let mut config = match self.config {
            Some(ref path) => PipelineConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(downloader) = self.downloader {
            config.downloader = downloader;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(n) = self.concurrent_items {
            config.concurrent_items = n;
        }
        if let Some(n) = self.rsync_threads {
            config.rsync_threads.set(n)?;
        }
        if self.bind_address.is_some() {
            config.bind_address = self.bind_address;
        }
        config.validate()?;

        Ok((config, self.max_items, reload_from))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let (config, max_items, reload_from) = cli.into_config()?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    if let Some(addr) = config.bind_address {
        tracing::info!(%addr, "Fetcher will bind to address");
    }

    let config = Arc::new(config);
    let coordinator: Arc<dyn Coordinator> = Arc::new(HttpCoordinator::new(config.tracker_url())?);
    let limiter = ConcurrencyLimiter::new(config.rsync_threads.name.clone(), config.upload_slots())?;
    if let Some(path) = reload_from {
        reload_on_hangup(path, Arc::clone(&limiter))?;
    }
    let definition = Arc::new(default_pipeline(
        &config,
        &coordinator,
        &limiter,
        Arc::new(SystemResolver),
    ));
    tracing::info!(
        pipeline = %definition.name(),
        hash = %definition.definition_hash(),
        stages = ?definition.stage_names(),
        "Pipeline ready"
    );

    let events = Arc::new(LoggingEventSink::default());
    let runner = Arc::new(PipelineRunner::new(
        definition,
        Arc::clone(&coordinator),
        events.clone(),
        config.coordinator_retry.clone(),
    ));
    let mut worker = Worker::new(Arc::clone(&config), coordinator, runner, events);
    if let Some(n) = max_items {
        worker = worker.with_max_items(n);
    }

    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel("interrupted; finishing items in flight");
        }
    });

    let summary = worker.run().await?;
    tracing::info!(
        claimed = summary.claimed,
        completed = summary.completed,
        failed = summary.failed,
        "Done"
    );
    Ok(())
}

#[cfg(unix)]
fn reload_on_hangup(path: PathBuf, limiter: Arc<ConcurrencyLimiter>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match limiter.reload_capacity(&path) {
                Ok(capacity) => {
                    tracing::info!(capacity, path = %path.display(), "Reloaded upload limit");
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Could not reload upload limit");
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn reload_on_hangup(_path: PathBuf, _limiter: Arc<ConcurrencyLimiter>) -> Result<()> {
    Ok(())
}

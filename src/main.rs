use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use epiwatch::collector::{self, Collector};
use epiwatch::config::Config;
use epiwatch::export::bind_addr;
use epiwatch::export::health::HealthMetrics;
use epiwatch::privacy::LaplaceNoise;
use epiwatch::site::transport::HttpTransport;
use epiwatch::site::{self, Site};

/// Privacy-preserving clinic reporting and outbreak forecasting.
#[derive(Parser)]
#[command(name = "epiwatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a reporting site: accept observations and sync them upstream.
    Site,
    /// Run the collector: ingest, aggregate and forecast.
    Collector,
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        None | Some(Command::Version) => {
            println!("epiwatch {}", version::full());
            return Ok(());
        }
        Some(command) => command,
    };

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // The flag wins over the config file.
    let log_level = cli.log_level.unwrap_or_else(|| cfg.log_level.clone());
    let filter = EnvFilter::try_new(&log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting epiwatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match command {
            Command::Site => run_site(cfg).await,
            Command::Collector => run_collector(cfg).await,
            Command::Version => Ok(()),
        }
    })
}

/// Cancels `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        token.cancel();
    });

    Ok(())
}

async fn run_site(cfg: Config) -> Result<()> {
    cfg.site.validate_required().context("invalid site config")?;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    metrics.start().await.context("starting health server")?;

    let noise = Arc::new(LaplaceNoise::from_entropy());
    let site = Arc::new(Site::new(&cfg.site, noise, Arc::clone(&metrics)));

    let transport = HttpTransport::new(&cfg.site.collector_url, cfg.site.sync.request_timeout)
        .context("building collector transport")?;
    tracing::info!(
        site = %site.site_id(),
        endpoint = transport.endpoint(),
        "delivering records",
    );
    site.start(transport, token.child_token());

    let addr = bind_addr(&cfg.site.listen_addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;

    let served = site::http::serve(listener, Arc::clone(&site), token.clone()).await;

    token.cancel();
    site.stop().await;
    metrics.stop().await?;

    tracing::info!("epiwatch site stopped");

    served
}

async fn run_collector(cfg: Config) -> Result<()> {
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    metrics.start().await.context("starting health server")?;

    let collector = Arc::new(Collector::new(&cfg.collector, Arc::clone(&metrics)));

    let addr = bind_addr(&cfg.collector.listen_addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;

    let served = collector::http::serve(listener, collector, token.clone()).await;

    token.cancel();
    metrics.stop().await?;

    tracing::info!("epiwatch collector stopped");

    served
}

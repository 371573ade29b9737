use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tikagate::{
    api,
    config::{self, Config},
    gateway::GatewayService,
    logging,
};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(
    name = "tikagate",
    about = "Extract documents through a Tika worker and serve full-text search over them"
)]
struct Cli {
    /// Listen address (`host:port` or `:port`).
    #[arg(long, value_parser = parse_addr)]
    http: Option<SocketAddr>,
    /// Java executable used to launch the worker.
    #[arg(long)]
    java: Option<PathBuf>,
    /// Tika server archive.
    #[arg(long)]
    tika_jar: Option<PathBuf>,
    /// Port the worker binds on localhost.
    #[arg(long)]
    tika_port: Option<u16>,
    /// Search index directory.
    #[arg(long)]
    index: Option<PathBuf>,
    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,
    #[arg(long)]
    startup_grace_ms: Option<u64>,
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,
    /// Stop the worker after this many idle seconds (0 disables).
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.http {
            config.listen_addr = addr;
        }
        if let Some(java) = self.java {
            config.java_bin = java;
        }
        if let Some(jar) = self.tika_jar {
            config.tika_jar = jar;
        }
        if let Some(port) = self.tika_port {
            config.tika_port = port;
        }
        if let Some(index) = self.index {
            config.index_path = index;
        }
        config.verbose |= self.verbose;
        if let Some(ms) = self.startup_grace_ms {
            config.startup_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
    }
}

fn parse_addr(value: &str) -> Result<SocketAddr, String> {
    config::parse_listen_addr(value).ok_or_else(|| format!("invalid listen address `{value}`"))
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);
    logging::init_tracing(config.verbose);
    tracing::debug!(?config, "Configuration loaded");

    let service =
        Arc::new(GatewayService::from_config(&config).context("Failed to build gateway")?);
    let supervisor = service.supervisor().clone();

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    supervisor
        .ensure_running()
        .await
        .context("Failed to start extraction worker")?;

    let reaper = config
        .idle_timeout
        .map(|idle| supervisor.spawn_idle_reaper(idle));
    tracing::info!("Listening on http://{}", config.listen_addr);

    let served = axum::serve(listener, api::create_router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    supervisor.terminate().await;
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown requested");
}

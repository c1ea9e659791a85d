use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mirror_capture::HostProvider;
use mirror_core::config::Config;
use mirror_core::server::{Collaborators, ServerCore};
use mirror_core::state;

#[derive(Parser, Debug)]
#[command(name = "lan-mirror")]
#[command(about = "LAN screen-mirroring server")]
#[command(version)]
struct Cli {
    /// Path to the config file (JSON with a top-level "server" object)
    #[arg(long, env = "MIRROR_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the configured websocket port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MIRROR_LOG_LEVEL")]
    log_level: String,

    /// Disable the long-run file log next to the executable
    #[arg(long)]
    no_file_log: bool,
}

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Stdout plus a daily-rotated file log for long-run stability. The guard
/// must outlive the runtime so buffered lines are flushed on exit.
fn init_logging(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if cli.no_file_log {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let log_dir = exe_dir().join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let appender = tracing_appender::rolling::daily(log_dir, "lan-mirror.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Some(guard)
}

/// TLS is provisioned externally: a `certs/` directory next to the
/// executable with `cert.pem` and `key.pem`. Absent certs mean plain TCP.
fn load_tls() -> Option<tokio_native_tls::TlsAcceptor> {
    let certs_dir = exe_dir().join("certs");
    let cert = std::fs::read(certs_dir.join("cert.pem")).ok()?;
    let key = std::fs::read(certs_dir.join("key.pem")).ok()?;
    let identity = match native_tls::Identity::from_pkcs8(&cert, &key) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("ignoring unreadable TLS identity: {e}");
            return None;
        }
    };
    match native_tls::TlsAcceptor::new(identity) {
        Ok(acceptor) => {
            info!("TLS enabled via provided certificate");
            Some(tokio_native_tls::TlsAcceptor::from(acceptor))
        }
        Err(e) => {
            warn!("TLS acceptor setup failed, serving plain: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);

    info!(
        "lan-mirror v{} starting (os={}, arch={})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    );

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| exe_dir().join("config.json"));
    let mut config = if config_path.exists() {
        info!("loading config from {}", config_path.display());
        Config::load(&config_path)?
    } else {
        info!("no config found at {}, using defaults", config_path.display());
        Config::default()
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let tls = load_tls();
    if tls.is_none() {
        warn!("no TLS certificates found, serving plain websocket");
    }

    let core = ServerCore::new(
        config.server.clone(),
        Arc::new(HostProvider),
        Collaborators::default(),
        state::default_path(),
    );

    let (listener, port) = ServerCore::bind_with_seek(config.server.port)
        .await
        .context("startup failed: no available ports")?;
    info!(
        "serving tier {:?} / mode {:?} on port {port}",
        config.server.tier, config.server.mode
    );

    let serve = tokio::spawn(core.clone().serve(listener, tls, None));

    tokio::signal::ctrl_c().await.ok();
    info!("received Ctrl+C, shutting down");
    serve.abort();
    core.stop().await;
    Ok(())
}

//! Umbra - URL-rewriting web relay.
//!
//! Runs the relay HTTP server: proxied pages under the configured prefix,
//! the client config script, and the cookie event stream.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use umbra_core::{ProxyConfig, UrlCodec};
use umbra_server::{Server, ServerConfig};
use umbra_storage::Database;

/// Umbra - URL-rewriting web relay
#[derive(Parser, Debug)]
#[command(name = "umbra", version, about)]
struct Args {
    /// JSON relay configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Cookie database path (defaults to the app data directory)
    #[arg(long, conflicts_with = "in_memory")]
    db: Option<PathBuf>,

    /// Keep cookies in memory only
    #[arg(long)]
    in_memory: bool,

    /// Path prefix for proxied URLs
    #[arg(long)]
    prefix: Option<String>,

    /// Relay (Bare) endpoint; may be repeated
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// URL codec (none, plain, xor, base64)
    #[arg(long)]
    codec: Option<UrlCodec>,

    /// Client-facing origin, when the relay sits behind another proxy
    #[arg(long)]
    public_origin: Option<String>,

    /// Send cross-origin isolation headers
    #[arg(long)]
    cross_origin_isolated: bool,

    /// Seconds to wait for a relay response
    #[arg(long, default_value_t = umbra_proxy::DEFAULT_TIMEOUT.as_secs())]
    relay_timeout: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "umbra", "umbra").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "umbra={0},umbra_core={0},umbra_proxy={0},umbra_server={0},umbra_storage={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("umbra")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Builds the relay configuration: file first, then command-line overrides.
fn proxy_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_path(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?,
        None => ProxyConfig::default(),
    };

    if let Some(prefix) = &args.prefix {
        config = config.with_prefix(prefix.clone());
    }
    if !args.relays.is_empty() {
        config = config.with_relay_endpoints(args.relays.clone());
    }
    if let Some(codec) = args.codec {
        config = config.with_codec(codec);
    }
    if let Some(origin) = &args.public_origin {
        config = config.with_public_origin(origin.clone());
    }
    if args.cross_origin_isolated {
        config = config.with_cross_origin_isolation(true);
    }

    config.validate()?;
    Ok(config)
}

fn server_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let config = if args.in_memory {
        ServerConfig::in_memory()
    } else {
        let path = match &args.db {
            Some(path) => path.clone(),
            None => Database::default_db_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        ServerConfig::with_db_path(path.to_string_lossy())
    };

    Ok(config.with_relay_timeout(Duration::from_secs(args.relay_timeout)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Umbra...");
    tracing::debug!("Args: {:?}", args);

    let proxy = proxy_config(&args)?;
    tracing::info!(
        prefix = %proxy.prefix,
        codec = proxy.codec.name(),
        relays = ?proxy.relay_endpoints,
        "Relay configured"
    );

    let config = server_config(&args)?;
    match &config.db_path {
        Some(path) => tracing::info!("Cookie database at {}", path),
        None => tracing::info!("Cookies kept in memory"),
    }

    let server = Server::new(config, proxy).await?;
    server.run().await?;

    tracing::info!("Umbra shutting down");
    Ok(())
}

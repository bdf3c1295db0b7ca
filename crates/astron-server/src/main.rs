//! # astrond
//!
//! Astron message director: routes datagrams between cluster participants
//! by channel and channel range.
//!
//! ## Usage
//!
//! ```bash
//! # Root MD with default settings
//! astrond
//!
//! # Custom config, JSON logs
//! astrond --config /etc/astron/astrond.toml --json-logs
//!
//! # Downstream MD attached to a parent
//! ASTRON_UPSTREAM=10.0.0.1:7199 astrond --bind 0.0.0.0:7199
//! ```

mod cli;
mod config;
mod connection;
mod handlers;
mod metrics;
mod upstream;

use anyhow::{Context, Result};
use astron_core::{MessageDirector, UpstreamLink};
use astron_transport::{TcpConfig, TcpConnection};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::CliArgs::parse();

    let mut config = config::Config::load(args.config_path.as_deref())?;
    config.apply_cli(&args);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.messagedirector.bind,
        upstream = config.upstream().unwrap_or("none"),
        "Starting astrond"
    );

    metrics::init_metrics();

    let Some(parent) = config.upstream().map(str::to_owned) else {
        let director = MessageDirector::start(config.director_config(), None);
        return handlers::run_server(config, director).await;
    };

    let (link, outbound) = UpstreamLink::new();
    // Idle timeouts apply to participants only.
    let upstream_config = TcpConfig {
        read_timeout: None,
        ..config.tcp_config()
    };
    let conn = TcpConnection::connect(&parent, upstream_config)
        .await
        .with_context(|| format!("Failed to connect to upstream message director at {}", parent))?;
    let director = MessageDirector::start(config.director_config(), Some(link.clone()));
    upstream::spawn(conn, link.clone(), outbound, director.clone());

    tokio::select! {
        result = handlers::run_server(config, director) => result,
        () = link.lost() => {
            error!(parent = %parent, "Upstream message director unreachable; exiting");
            std::process::exit(1);
        }
    }
}

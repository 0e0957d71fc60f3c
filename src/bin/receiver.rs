//! topicwire receiver.
//!
//! Binds the host's network ingress and relays every inbound message to the
//! local topic sockets consumers attach to. Runs until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use topicwire::{RpcConfig, ZmqProxy, ZmqTransport};

const DEFAULT_LOG_LEVEL: &str = "topicwire=info";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (toml, json or yaml)
    #[arg(long, env = "TOPICWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Interface to bind; `*` for all
    #[arg(long)]
    bind_address: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Directory for the per-topic IPC sockets
    #[arg(long)]
    ipc_dir: Option<PathBuf>,

    /// Per-topic queue capacity
    #[arg(long)]
    topic_backlog: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut RpcConfig) {
        if let Some(bind_address) = self.bind_address {
            config.zmq.bind_address = bind_address;
        }
        if let Some(port) = self.port {
            config.zmq.port = port;
        }
        if let Some(ipc_dir) = self.ipc_dir {
            config.zmq.ipc_dir = ipc_dir;
        }
        if self.topic_backlog.is_some() {
            config.zmq.topic_backlog = self.topic_backlog;
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_owned()))
}

/// Console logging, or a daily rolling file under `TOPICWIRE_LOG_DIR`.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    match std::env::var("TOPICWIRE_LOG_DIR") {
        Ok(log_dir) => {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "topicwire.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(non_blocking)
                .init();
            info!("File logging enabled to {}/topicwire.log", log_dir);
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .init();
            None
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Keep the guard alive; dropping it stops the background writer
    let _log_guard = init_logging();

    let mut config = RpcConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config
        .validate()
        .context("Configuration validation failed")?;

    info!("topicwire receiver v{} starting up", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(ZmqTransport::new(config));
    let proxy = ZmqProxy::new(&transport);
    proxy
        .consume_in_thread()
        .context("Failed to start topic relay")?;

    let signal = shutdown_signal().await;

    proxy.close().await;
    transport.cleanup().await;
    info!("topicwire receiver stopped");
    signal
}

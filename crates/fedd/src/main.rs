//! Federation controller daemon (fedd).
//!
//! Keeps this cluster's view of its federation siblings coherent: loads
//! membership from the registration authority, maintains one persistent
//! link per sibling, synchronizes state over it and answers operator and
//! sibling requests.
//!
//! Usage:
//!   fedd --cluster-name NAME [OPTIONS]
//!
//! The daemon creates a tokio async runtime and runs:
//! 1. Client accept loop (operators and siblings)
//! 2. Membership event loop (starts/stops sibling workers)
//! 3. One worker per sibling (connect, sync, liveness)
//! 4. Inbox loop for envelopes received from siblings

mod config;
mod daemon;
mod registry;
mod request;
mod sibling;
mod source;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use fedmesh_core::net::create_listen_socket;
use fedmesh_core::notifier::NotifierConfig;
use fedmesh_proto::constants::{FED_AUTHORITY_PORT, FED_CONTROLLER_PORT};
use fedmesh_proto::defaults::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_LIVENESS_INTERVAL_SECS, DEFAULT_NOTIFY_AGGREGATION_SECS,
    DEFAULT_RETRY_COOLDOWN_SECS, DEFAULT_RPC_TIMEOUT_SECS, DEFAULT_SYNC_TIMEOUT_SECS,
};
use fedmesh_proto::FedError;

use crate::config::FedConfig;
use crate::daemon::{FedContext, InboxItem};
use crate::sibling::{membership_event_loop, SiblingManager, TcpConnector};
use crate::source::RpcSource;

/// Federation controller daemon
#[derive(Parser, Debug)]
#[command(name = "fedd", version, about = "Federation controller daemon")]
struct Args {
    /// Name of the local cluster
    #[arg(short = 'n', long)]
    cluster_name: String,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = FED_CONTROLLER_PORT)]
    port: u16,

    /// Registration authority host
    #[arg(long, default_value = "127.0.0.1")]
    authority: String,

    /// Backup registration authority host
    #[arg(long)]
    authority_backup: Option<String>,

    /// Registration authority port
    #[arg(long, default_value_t = FED_AUTHORITY_PORT)]
    authority_port: u16,

    /// Seconds between liveness probes on a sibling link
    #[arg(long, default_value_t = DEFAULT_LIVENESS_INTERVAL_SECS)]
    liveness_interval: u64,

    /// Minimum seconds between connect attempts to a failing sibling
    #[arg(long, default_value_t = DEFAULT_RETRY_COOLDOWN_SECS)]
    retry_cooldown: u64,

    /// Frequency overrides, e.g. "liveness=30,retry=60"
    #[arg(long, value_name = "LIST")]
    freq: Option<String>,

    /// Sibling connect timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,

    /// Sync handshake timeout in seconds
    #[arg(long, default_value_t = DEFAULT_SYNC_TIMEOUT_SECS)]
    sync_timeout: u64,

    /// Registration authority request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT_SECS)]
    rpc_timeout: u64,

    /// Directory for the persisted federation record
    #[arg(short = 'd', long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Event notification host
    #[arg(long, default_value = "127.0.0.1")]
    notify_host: String,

    /// Backup event notification host
    #[arg(long)]
    notify_backup: Option<String>,

    /// Event notification port (0 to disable)
    #[arg(long, default_value_t = 0)]
    notify_port: u16,

    /// Suppress event notifications within this many seconds of the last
    #[arg(long, default_value_t = DEFAULT_NOTIFY_AGGREGATION_SECS)]
    notify_window: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<FedConfig, FedError> {
        let mut cfg = FedConfig::new(self.cluster_name);
        cfg.bind_addr = self.bind_addr;
        cfg.port = self.port;
        cfg.authority_host = self.authority;
        cfg.authority_backup = self.authority_backup;
        cfg.authority_port = self.authority_port;
        cfg.liveness_interval = Duration::from_secs(self.liveness_interval);
        cfg.retry_cooldown = Duration::from_secs(self.retry_cooldown);
        cfg.connect_timeout = Duration::from_secs(self.connect_timeout);
        cfg.sync_timeout = Duration::from_secs(self.sync_timeout);
        cfg.rpc_timeout = Duration::from_secs(self.rpc_timeout);
        cfg.state_dir = self.state_dir;

        let mut notify = NotifierConfig::new(self.notify_host, self.notify_port);
        notify.backup_host = self.notify_backup;
        notify.aggregation = Duration::from_secs(self.notify_window);
        notify.connect_timeout = cfg.connect_timeout;
        cfg.notify = notify;

        if let Some(list) = &self.freq {
            cfg.apply_freq(list)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("fedd v{} starting", env!("CARGO_PKG_VERSION"));

    let cfg = match args.into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match create_listen_socket(&cfg.bind_addr, cfg.port).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to listen on {}:{}: {}", cfg.bind_addr, cfg.port, e);
            std::process::exit(1);
        }
    };

    let source = Arc::new(RpcSource::new(cfg.authority_addrs(), cfg.rpc_timeout));
    let (ctx, channels) = FedContext::new(cfg, source);
    let manager = SiblingManager::new(ctx.clone(), Arc::new(TcpConnector));

    // ---------------------------------------------------------------
    // Spawn membership and inbox loops
    // ---------------------------------------------------------------
    tokio::spawn(membership_event_loop(manager.clone(), channels.membership_rx));
    tokio::spawn(inbox_loop(channels.inbox_rx));

    // Initial membership
    match ctx.reload().await {
        Ok(()) => info!("federation membership loaded"),
        Err(FedError::RpcFailed) => {
            warn!("registration authority unreachable, trying saved state");
            match ctx.restore().await {
                Ok(true) => info!("restored saved federation state"),
                Ok(false) => info!("no saved federation state, running unfederated"),
                Err(e) => error!("failed to restore federation state: {}", e),
            }
        }
        Err(e) => error!("failed to load federation: {}", e),
    }

    let ctx_accept = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = request::accept_loop(ctx_accept, listener).await {
            error!("accept loop failed: {}", e);
        }
    });

    info!("fedd ready as cluster {}", ctx.local_name());

    tokio::select! {
        _ = ctx.shutdown_notify.notified() => {
            info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    // ---------------------------------------------------------------
    // Graceful shutdown
    // ---------------------------------------------------------------
    info!("fedd shutting down");
    ctx.shutdown_notify.notify_waiters();
    manager.shutdown();
    ctx.destroy().await;
    ctx.notifier.close().await;
    info!("fedd stopped");
}

/// Log envelopes received from siblings. The job layer consumes them here.
async fn inbox_loop(mut rx: mpsc::Receiver<InboxItem>) {
    while let Some((from, env)) = rx.recv().await {
        info!(
            "message from sibling {}: kind={} ({} bytes)",
            from,
            env.kind,
            env.payload.len()
        );
    }
}

//! Registration authority daemon (fedreg).
//!
//! Answers controllers' "current federation state" requests from a
//! federation defined on the command line. Without `--federation` every
//! controller is told it is not federated.
//!
//! Usage:
//!   fedreg [OPTIONS] --federation NAME --cluster NAME:HOST:PORT:ID ...

mod handler;

use clap::Parser;
use fedmesh_core::net::create_listen_socket;
use fedmesh_proto::constants::FED_AUTHORITY_PORT;
use tracing::{error, info};

/// Federation registration authority
#[derive(Parser, Debug)]
#[command(name = "fedreg", version, about = "Federation registration authority")]
struct Args {
    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = FED_AUTHORITY_PORT)]
    port: u16,

    /// Federation name
    #[arg(short = 'f', long)]
    federation: Option<String>,

    /// Member cluster: NAME:HOST:PORT:ID[:STATE[:FEATURES[:BACKUP_HOST]]]
    #[arg(short = 'c', long = "cluster", value_name = "CLUSTER")]
    clusters: Vec<String>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
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

    info!("fedreg v{} starting", env!("CARGO_PKG_VERSION"));

    let record = match handler::build_record(args.federation, &args.clusters) {
        Ok(r) => r,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    match &record {
        Some(r) => info!("serving federation {} ({} clusters)", r.name, r.clusters.len()),
        None => info!("no federation defined"),
    }

    let listener = match create_listen_socket(&args.bind_addr, args.port).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to listen on {}:{}: {}", args.bind_addr, args.port, e);
            std::process::exit(1);
        }
    };

    let authority = handler::Authority::new(record);

    tokio::select! {
        result = authority.run(listener) => {
            if let Err(e) = result {
                error!("authority error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    info!("fedreg stopped");
}

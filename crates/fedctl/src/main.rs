//! Federation CLI admin tool (fedctl).
//!
//! Talks to a federation controller (fedd) over TCP using the federation
//! protocol.
//!
//! # Usage
//!
//! ```text
//! fedctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   show      Show the federation as seen by the controller
//!   siblings  List siblings with their sync status
//!   reload    Reload membership from the registration authority
//!   suspend   Suspend sibling liveness probing
//!   resume    Resume sibling liveness probing
//!
//! Options:
//!   -a, --address <ADDRESS>  Controller address [default: 127.0.0.1]
//!   -p, --port <PORT>        Controller port [default: 6817]
//!   -v, --verbose            Enable debug logging
//! ```

mod common;
mod federation;

use clap::Parser;
use fedmesh_proto::constants::FED_CONTROLLER_PORT;
use tracing_subscriber::EnvFilter;

/// Federation admin tool.
#[derive(Parser)]
#[command(name = "fedctl", version, about = "Federation admin tool")]
struct Cli {
    /// Controller address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    address: String,

    /// Controller port
    #[arg(short = 'p', long, default_value_t = FED_CONTROLLER_PORT)]
    port: u16,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: federation::FedCommands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    federation::run(&cli.address, cli.port, cli.command).await;
}

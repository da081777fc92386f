//! Federation subcommands for the fedctl CLI.
//!
//! Shows the controller's federation view, lists siblings the way the
//! scheduler sees them and drives reload and liveness suspension.

use clap::Subcommand;
use tabled::{Table, Tabled};

use fedmesh_core::present::format_federation;
use fedmesh_proto::{FedRequest, ResponseResult, SiblingView};

use crate::common::{connect_to_controller, exit_error, print_success, send_request_ok, yes_no};

// ---------------------------------------------------------------------------
// CLI argument types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum FedCommands {
    /// Show the federation as seen by the controller
    Show {
        /// Render as this member instead of the controller's own cluster
        #[arg(short = 'c', long)]
        cluster: Option<String>,
    },
    /// List siblings with their sync status
    Siblings,
    /// Reload membership from the registration authority
    Reload,
    /// Suspend sibling liveness probing
    Suspend,
    /// Resume sibling liveness probing
    Resume,
}

// ---------------------------------------------------------------------------
// Table display types
// ---------------------------------------------------------------------------

#[derive(Tabled)]
struct SiblingRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "ID")]
    id: u32,
    #[tabled(rename = "FedState")]
    state: String,
    #[tabled(rename = "Synced")]
    synced: String,
}

impl From<&SiblingView> for SiblingRow {
    fn from(s: &SiblingView) -> Self {
        SiblingRow {
            name: s.name.clone(),
            host: s.host.clone().unwrap_or_else(|| "-".to_string()),
            port: s.port,
            id: s.fed_id,
            state: s.state.to_string(),
            synced: yes_no(s.sync_recvd).to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

/// Execute a federation subcommand.
pub async fn run(addr: &str, port: u16, cmd: FedCommands) {
    match cmd {
        FedCommands::Show { cluster } => fed_show(addr, port, cluster).await,
        FedCommands::Siblings => fed_siblings(addr, port).await,
        FedCommands::Reload => {
            simple_op(addr, port, FedRequest::Reload, "Federation reloaded.").await
        }
        FedCommands::Suspend => {
            simple_op(addr, port, FedRequest::Suspend, "Liveness probing suspended.").await
        }
        FedCommands::Resume => {
            simple_op(addr, port, FedRequest::Resume, "Liveness probing resumed.").await
        }
    }
}

async fn fed_show(addr: &str, port: u16, cluster: Option<String>) {
    let mut stream = match connect_to_controller(addr, port).await {
        Ok(s) => s,
        Err(_) => exit_error("Failed to connect to federation controller"),
    };

    let local = match cluster {
        Some(name) => name,
        None => match send_request_ok(&mut stream, FedRequest::ControllerInfo).await {
            Ok(ResponseResult::Controller(info)) => info.cluster_name,
            Ok(_) => exit_error("Unexpected response."),
            Err(e) => exit_error(&format!("Failed to get controller info: {}", e)),
        },
    };

    match send_request_ok(&mut stream, FedRequest::FedInfo).await {
        Ok(ResponseResult::FedInfo(fed)) => {
            print!("{}", format_federation(fed.as_ref(), &local));
        }
        Ok(_) => exit_error("Unexpected response."),
        Err(e) => exit_error(&format!("Failed to get federation: {}", e)),
    }
}

async fn fed_siblings(addr: &str, port: u16) {
    let mut stream = match connect_to_controller(addr, port).await {
        Ok(s) => s,
        Err(_) => exit_error("Failed to connect to federation controller"),
    };

    match send_request_ok(&mut stream, FedRequest::Siblings).await {
        Ok(ResponseResult::Siblings(siblings)) => {
            if siblings.is_empty() {
                println!("No siblings.");
                return;
            }
            let rows: Vec<SiblingRow> = siblings.iter().map(SiblingRow::from).collect();
            println!("{}", Table::new(&rows));
            println!();
            let synced = siblings.iter().filter(|s| s.sync_recvd).count();
            println!("Total {} sibling(s), {} synced", siblings.len(), synced);
        }
        Ok(_) => exit_error("Unexpected response."),
        Err(e) => exit_error(&format!("Failed to list siblings: {}", e)),
    }
}

async fn simple_op(addr: &str, port: u16, req: FedRequest, done: &str) {
    let mut stream = match connect_to_controller(addr, port).await {
        Ok(s) => s,
        Err(_) => exit_error("Failed to connect to federation controller"),
    };

    match send_request_ok(&mut stream, req).await {
        Ok(_) => print_success(done),
        Err(e) => exit_error(&e.to_string()),
    }
}

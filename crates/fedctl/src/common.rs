//! Shared utilities for the fedctl CLI tool.
//!
//! Connection helpers and response checking used by every subcommand.

use std::time::Duration;

use fedmesh_core::net::{connect_to, send_request};
use fedmesh_proto::defaults::DEFAULT_CONNECT_TIMEOUT_SECS;
use fedmesh_proto::{FedError, FedRequest, FedResult, ResponseResult};
use tokio::net::TcpStream;
use tracing::debug;

/// Connect to a federation controller at the given address and port.
pub async fn connect_to_controller(addr: &str, port: u16) -> FedResult<TcpStream> {
    connect_to(addr, port, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
        .await
        .map_err(|e| {
            eprintln!("Failed to connect to {}:{}: {}", addr, port, e);
            e
        })
}

/// Send a request and check for success, returning the ResponseResult.
pub async fn send_request_ok(stream: &mut TcpStream, req: FedRequest) -> FedResult<ResponseResult> {
    debug!("sending {:?}", req);
    let resp = send_request(stream, 1, &req).await?;
    debug!("received {:?}", resp.result);
    check_result(resp.result)
}

/// Turn error-carrying results into `Err`.
pub fn check_result(result: ResponseResult) -> FedResult<ResponseResult> {
    match result {
        ResponseResult::Error(e) => Err(e),
        ResponseResult::Rc(0) => Ok(ResponseResult::Success),
        ResponseResult::Rc(code) => Err(FedError::from_code(code).unwrap_or(FedError::Unknown)),
        other => Ok(other),
    }
}

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{}", msg);
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

pub fn yes_no(b: bool) -> &'static str {
    if b {
        "Yes"
    } else {
        "No"
    }
}

//! Registration authority request handling.
//!
//! Serves the federation definition given on the command line to any
//! controller that asks for it. The record is fixed for the lifetime of
//! the process.

use std::sync::Arc;

use fedmesh_core::net::{read_request, write_response};
use fedmesh_proto::constants::FED_PROTO_VER;
use fedmesh_proto::federation::{ClusterRecord, FedRecord};
use fedmesh_proto::{FedError, FedRequest, FedResponse, FedResult, FedState, ResponseResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Registration authority: one federation, served read-only.
pub struct Authority {
    record: Option<FedRecord>,
}

impl Authority {
    pub fn new(record: Option<FedRecord>) -> Arc<Self> {
        Arc::new(Self { record })
    }

    /// Accept loop; runs until the task is dropped.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> FedResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("authority accepting connections on {}", addr);
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("connection from {}", peer);
                    let auth = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = auth.handle_connection(stream).await {
                            debug!("connection {} error: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> FedResult<()> {
        while let Some((header, req)) = read_request(&mut stream).await? {
            if req.is_one_way() {
                continue;
            }
            let result = if header.proto_ver != FED_PROTO_VER {
                warn!("unsupported protocol version {}", header.proto_ver);
                ResponseResult::Rc(FedError::NoSupport.to_code())
            } else {
                self.answer(&req)
            };
            write_response(&mut stream, &FedResponse::new(header.id, result)).await?;
        }
        Ok(())
    }

    /// Response to a single request.
    pub fn answer(&self, req: &FedRequest) -> ResponseResult {
        match req {
            FedRequest::FedInfo => match &self.record {
                Some(rec) => ResponseResult::FedRecord(Some(rec.clone())),
                None => ResponseResult::Rc(0),
            },
            other => {
                debug!("unsupported request {:?}", other);
                ResponseResult::Rc(FedError::NoSupport.to_code())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command-line federation definition
// ---------------------------------------------------------------------------

/// Parse `NAME:HOST:PORT:ID[:STATE[:FEATURES[:BACKUP_HOST]]]`.
pub fn parse_cluster_arg(arg: &str) -> Result<ClusterRecord, String> {
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() < 4 || parts.len() > 7 {
        return Err(format!(
            "invalid cluster '{}': expected NAME:HOST:PORT:ID[:STATE[:FEATURES[:BACKUP_HOST]]]",
            arg
        ));
    }

    let port: u16 = parts[2]
        .parse()
        .map_err(|e| format!("invalid port '{}': {}", parts[2], e))?;
    let fed_id: u32 = parts[3]
        .parse()
        .map_err(|e| format!("invalid id '{}': {}", parts[3], e))?;

    let state = match parts.get(4) {
        Some(s) if !s.is_empty() => s
            .parse::<FedState>()
            .map_err(|_| format!("invalid state '{}'", s))?,
        _ => FedState::Active,
    };

    Ok(ClusterRecord {
        name: parts[0].to_string(),
        control_host: parts[1].to_string(),
        backup_host: parts.get(6).map(|s| s.to_string()).unwrap_or_default(),
        control_port: port,
        fed_id,
        fed_state: state.as_str().to_string(),
        features: parts.get(5).map(|s| s.to_string()).unwrap_or_default(),
    })
}

/// Build the served record, checking it the way a controller will.
pub fn build_record(name: Option<String>, args: &[String]) -> Result<Option<FedRecord>, String> {
    let Some(name) = name else {
        if !args.is_empty() {
            return Err("--cluster given without --federation".to_string());
        }
        return Ok(None);
    };

    let clusters = args
        .iter()
        .map(|s| parse_cluster_arg(s))
        .collect::<Result<Vec<_>, _>>()?;
    let record = FedRecord { name, clusters };

    record
        .clone()
        .into_federation()
        .map_err(|e| format!("invalid federation: {}", e))?;
    Ok(Some(record))
}

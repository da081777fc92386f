//! Registration authority client.
//!
//! `load` asks the authority for the current federation and validates the
//! answer. It never touches the live registry; installing the result is
//! the caller's job, so a failed load leaves prior state intact.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fedmesh_core::net::{connect_with_fallback, send_request};
use fedmesh_proto::{FedError, FedRequest, FedResponse, FedResult, Federation, ResponseResult};
use tracing::{debug, error, warn};

/// Where federation membership comes from.
#[async_trait]
pub trait RegistrationSource: Send + Sync {
    /// One "current federation state" round trip. Transport failures
    /// surface as `RpcFailed`.
    async fn fetch(&self) -> FedResult<FedResponse>;
}

/// Authority reached over the framed TCP protocol.
pub struct RpcSource {
    addrs: Vec<(String, u16)>,
    timeout: Duration,
    next_id: AtomicU32,
}

impl RpcSource {
    pub fn new(addrs: Vec<(String, u16)>, timeout: Duration) -> Self {
        Self {
            addrs,
            timeout,
            next_id: AtomicU32::new(1),
        }
    }

    async fn round_trip(&self, id: u32) -> FedResult<FedResponse> {
        let (mut stream, _) = connect_with_fallback(&self.addrs, self.timeout).await?;
        send_request(&mut stream, id, &FedRequest::FedInfo).await
    }
}

#[async_trait]
impl RegistrationSource for RpcSource {
    async fn fetch(&self) -> FedResult<FedResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.timeout, self.round_trip(id)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(FedError::UnexpectedResponse)) => Err(FedError::UnexpectedResponse),
            Ok(Err(e)) => {
                warn!("federation info request failed: {}", e);
                Err(FedError::RpcFailed)
            }
            Err(_) => {
                warn!("federation info request timed out after {:?}", self.timeout);
                Err(FedError::RpcFailed)
            }
        }
    }
}

/// Fetch and validate the current federation.
///
/// `Ok(None)` means the authority reports no federation (or an empty
/// one): the controller is unfederated.
pub async fn load(source: &dyn RegistrationSource) -> FedResult<Option<Federation>> {
    let resp = source.fetch().await?;
    match resp.result {
        ResponseResult::FedRecord(Some(rec)) => {
            let fed = rec.into_federation().map_err(|e| {
                error!("rejecting federation record: {}", e);
                e
            })?;
            debug!(
                "loaded federation {:?} with {} clusters",
                fed.as_ref().map(|f| f.name.as_str()),
                fed.as_ref().map_or(0, |f| f.clusters.len())
            );
            Ok(fed)
        }
        ResponseResult::FedRecord(None) | ResponseResult::Rc(0) => Ok(None),
        ResponseResult::Rc(rc) => {
            let err = FedError::from_code(rc).unwrap_or(FedError::Unknown);
            warn!("authority returned status {}: {}", rc, err);
            Err(err)
        }
        ResponseResult::Error(e) => {
            warn!("authority returned error: {}", e);
            Err(e)
        }
        other => {
            error!("unexpected response to federation info request: {:?}", other);
            Err(FedError::UnexpectedResponse)
        }
    }
}

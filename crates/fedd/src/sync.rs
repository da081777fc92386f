//! Sibling state synchronization.
//!
//! On every new outbound connection the initiator identifies itself with
//! `Hello`, then sends `Sync` carrying its own federation state, features
//! and the first frame's worth of queued envelopes. The sibling applies them and answers with
//! `SyncAck` describing itself. Only after the answer is applied does the
//! link become trusted (`sync_recvd`), and only for the connection epoch
//! the handshake ran on.

use fedmesh_core::net::{encode_request, send_request, write_frame};
use fedmesh_proto::{FedEnvelope, FedError, FedRequest, FedResult, FedState, ResponseResult};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::daemon::FedContext;
use crate::registry::Registry;

/// The local cluster's own state and features, as told to siblings.
fn own_state(reg: &Registry) -> (FedState, Vec<String>) {
    reg.local()
        .map(|c| (c.state, c.features.iter().cloned().collect()))
        .unwrap_or((FedState::Active, Vec::new()))
}

/// Run the handshake on a fresh link to `name`.
///
/// Returns `Ok(true)` when this handshake flipped the link to synced,
/// `Ok(false)` when it was already synced or the link moved on meanwhile.
pub async fn handshake(
    ctx: &FedContext,
    name: &str,
    inc: u64,
    epoch: u64,
    stream: &mut TcpStream,
) -> FedResult<bool> {
    let (state, features, messages) = {
        let mut reg = ctx.registry.write().await;
        let (state, features) = own_state(&reg);
        (state, features, reg.drain_outbox(name, inc))
    };

    let local = ctx.local_name().to_string();
    let hello = encode_request(0, &FedRequest::Hello {
        cluster: local.clone(),
    })?;
    let sync = FedRequest::Sync {
        cluster: local,
        epoch,
        state,
        features,
        messages: messages.clone(),
    };

    let exchange = async {
        write_frame(&mut *stream, &hello).await?;
        send_request(&mut *stream, 1, &sync).await
    };
    let resp = match tokio::time::timeout(ctx.config.sync_timeout, exchange).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            ctx.registry.write().await.requeue(name, inc, messages);
            return Err(e);
        }
        Err(_) => {
            ctx.registry.write().await.requeue(name, inc, messages);
            return Err(FedError::Timeout);
        }
    };

    match resp.result {
        ResponseResult::SyncAck {
            cluster,
            state,
            features,
        } => {
            if cluster != name {
                warn!("sibling {}: sync answered by cluster {}", name, cluster);
                return Err(FedError::UnexpectedResponse);
            }
            let mut reg = ctx.registry.write().await;
            if reg.apply_remote(name, state, features.into_iter().collect()).is_err() {
                return Ok(false);
            }
            Ok(reg.mark_synced(name, inc, epoch))
        }
        ResponseResult::Error(e) => {
            ctx.registry.write().await.requeue(name, inc, messages);
            Err(e)
        }
        other => {
            warn!("sibling {}: unexpected sync response {:?}", name, other);
            ctx.registry.write().await.requeue(name, inc, messages);
            Err(FedError::UnexpectedResponse)
        }
    }
}

/// A sibling identified itself on inbound connection `conn`.
pub async fn note_inbound(ctx: &FedContext, cluster: &str, conn: u64) -> FedResult<()> {
    ctx.registry.write().await.mark_recv(cluster, conn)
}

/// Inbound connection `conn` from `cluster` ended.
pub async fn inbound_closed(ctx: &FedContext, cluster: &str, conn: u64) {
    ctx.registry.write().await.clear_recv(cluster, conn);
}

/// Hand envelopes received from a sibling to the job layer.
pub async fn deliver_inbox(ctx: &FedContext, cluster: &str, messages: Vec<FedEnvelope>) {
    if messages.is_empty() {
        return;
    }
    debug!("sibling {}: {} messages received", cluster, messages.len());
    for env in messages {
        if ctx.inbox_tx.send((cluster.to_string(), env)).await.is_err() {
            warn!("inbox closed, dropping messages from {}", cluster);
            return;
        }
    }
}

/// Answer a sibling's `Sync` on inbound connection `conn`.
pub async fn handle_sync(
    ctx: &FedContext,
    conn: u64,
    cluster: String,
    epoch: u64,
    state: FedState,
    features: Vec<String>,
    messages: Vec<FedEnvelope>,
) -> ResponseResult {
    let (own, own_features) = {
        let mut reg = ctx.registry.write().await;
        if !reg.is_federated() {
            return ResponseResult::Error(FedError::NoFederation);
        }
        if let Err(e) = reg.mark_recv(&cluster, conn) {
            warn!("sync from unknown cluster {}", cluster);
            return ResponseResult::Error(e);
        }
        if let Err(e) = reg.apply_remote(&cluster, state, features.into_iter().collect()) {
            return ResponseResult::Error(e);
        }
        own_state(&reg)
    };

    info!("sibling {}: sync received (remote epoch {})", cluster, epoch);
    deliver_inbox(ctx, &cluster, messages).await;

    ResponseResult::SyncAck {
        cluster: ctx.local_name().to_string(),
        state: own,
        features: own_features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FedConfig;
    use crate::source::tests::{record, StaticSource};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_handle_sync_applies_remote_state() {
        let src = Arc::new(StaticSource::new(Ok(ResponseResult::FedRecord(Some(record(
            "fedA",
            &[("east", 1, 1), ("west", 2, 2)],
        ))))));
        let (ctx, mut ch) = FedContext::new(FedConfig::new("east"), src);
        ctx.reload().await.unwrap();

        let env = FedEnvelope {
            kind: "job".to_string(),
            payload: vec![1, 2, 3],
        };
        let resp = handle_sync(
            &ctx,
            9,
            "west".to_string(),
            1,
            FedState::Drain,
            vec!["gpu".to_string()],
            vec![env.clone()],
        )
        .await;

        match resp {
            ResponseResult::SyncAck { cluster, state, .. } => {
                assert_eq!(cluster, "east");
                assert_eq!(state, FedState::Active);
            }
            other => panic!("unexpected {:?}", other),
        }
        let reg = ctx.registry.read().await;
        assert!(reg.link("west").unwrap().recv_connected);
        let snap = reg.snapshot().unwrap();
        let west = snap.cluster("west").unwrap();
        assert_eq!(west.state, FedState::Drain);
        assert!(west.features.contains("gpu"));
        drop(reg);

        assert_eq!(ch.inbox_rx.recv().await, Some(("west".to_string(), env)));

        inbound_closed(&ctx, "west", 9).await;
        assert!(!ctx.registry.read().await.link("west").unwrap().recv_connected);
    }

    #[tokio::test]
    async fn test_handle_sync_rejects_unknown() {
        let src = Arc::new(StaticSource::new(Ok(ResponseResult::FedRecord(Some(record(
            "fedA",
            &[("east", 1, 1), ("west", 2, 2)],
        ))))));
        let (ctx, _ch) = FedContext::new(FedConfig::new("east"), src);

        let resp = handle_sync(&ctx, 1, "west".to_string(), 1, FedState::Active, vec![], vec![]).await;
        assert!(matches!(resp, ResponseResult::Error(FedError::NoFederation)));

        ctx.reload().await.unwrap();
        let resp = handle_sync(&ctx, 1, "north".to_string(), 1, FedState::Active, vec![], vec![]).await;
        assert!(matches!(resp, ResponseResult::Error(FedError::NotFound)));
    }
}

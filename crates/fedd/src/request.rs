//! Request pipeline: accept, read, dispatch, respond.
//!
//! One task per accepted connection. Operators, the CLI and sibling
//! controllers share the listener; sibling links are recognized by their
//! `Hello`/`Ping`/`Sync` frames and tracked for `recv_connected` until
//! the connection ends.

use fedmesh_core::net::{read_request, write_response};
use fedmesh_proto::constants::FED_PROTO_VER;
use fedmesh_proto::request::ControllerInfo;
use fedmesh_proto::{FedError, FedRequest, FedResponse, FedResult, ResponseResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::daemon::{FedContext, SharedCtx};
use crate::sync;

/// Accept loop: listen for incoming connections and spawn handlers.
pub async fn accept_loop(ctx: SharedCtx, listener: TcpListener) -> FedResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }
    let shutdown_notify = ctx.shutdown_notify.clone();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(ctx, stream).await {
                                debug!("client {} disconnected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                info!("accept loop shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Serve one connection until the peer goes away.
async fn handle_client(ctx: SharedCtx, mut stream: TcpStream) -> FedResult<()> {
    let conn = ctx.next_conn_id();
    let mut sibling: Option<String> = None;

    let result = serve(&ctx, conn, &mut sibling, &mut stream).await;

    if let Some(name) = sibling {
        sync::inbound_closed(&ctx, &name, conn).await;
    }
    result
}

async fn serve(
    ctx: &FedContext,
    conn: u64,
    sibling: &mut Option<String>,
    stream: &mut TcpStream,
) -> FedResult<()> {
    loop {
        let Some((header, req)) = read_request(stream).await? else {
            return Ok(());
        };

        if header.proto_ver != FED_PROTO_VER {
            warn!("unsupported protocol version {}", header.proto_ver);
            if req.is_one_way() {
                continue;
            }
            write_response(stream, &FedResponse::error(header.id, FedError::NoSupport)).await?;
            continue;
        }

        if req.is_one_way() {
            handle_one_way(ctx, conn, sibling, req).await;
            continue;
        }

        let result = dispatch(ctx, conn, sibling, req).await;
        write_response(stream, &FedResponse::new(header.id, result)).await?;
    }
}

/// Sibling traffic that gets no answer.
async fn handle_one_way(ctx: &FedContext, conn: u64, sibling: &mut Option<String>, req: FedRequest) {
    match req {
        FedRequest::Hello { cluster } | FedRequest::Ping { cluster } => {
            match sync::note_inbound(ctx, &cluster, conn).await {
                Ok(()) => *sibling = Some(cluster),
                Err(_) => debug!("ignoring identification from unknown cluster {}", cluster),
            }
        }
        FedRequest::Deliver { cluster, messages } => {
            if sibling.as_deref() != Some(cluster.as_str()) {
                warn!("messages from unidentified cluster {}", cluster);
            }
            sync::deliver_inbox(ctx, &cluster, messages).await;
        }
        other => debug!("unexpected one-way request {:?}", other),
    }
}

/// Dispatch a request that expects a response.
pub(crate) async fn dispatch(
    ctx: &FedContext,
    conn: u64,
    sibling: &mut Option<String>,
    req: FedRequest,
) -> ResponseResult {
    match req {
        FedRequest::FedInfo => ResponseResult::FedInfo(ctx.registry.read().await.snapshot()),
        FedRequest::ControllerInfo => {
            let generation = ctx.registry.read().await.generation();
            ResponseResult::Controller(ControllerInfo {
                cluster_name: ctx.local_name().to_string(),
                generation,
                suspended: ctx.is_suspended().await,
            })
        }
        FedRequest::Siblings => ResponseResult::Siblings(ctx.registry.read().await.siblings()),
        FedRequest::Reload => match ctx.reload().await {
            Ok(()) => ResponseResult::Success,
            Err(e) => ResponseResult::Error(e),
        },
        FedRequest::Suspend => {
            ctx.set_suspended(true).await;
            ResponseResult::Success
        }
        FedRequest::Resume => {
            ctx.set_suspended(false).await;
            ResponseResult::Success
        }
        FedRequest::Sync {
            cluster,
            epoch,
            state,
            features,
            messages,
        } => {
            let name = cluster.clone();
            let result = sync::handle_sync(ctx, conn, cluster, epoch, state, features, messages).await;
            if matches!(result, ResponseResult::SyncAck { .. }) {
                *sibling = Some(name);
            }
            result
        }
        FedRequest::Hello { .. } | FedRequest::Ping { .. } | FedRequest::Deliver { .. } => {
            ResponseResult::Error(FedError::InvalidParms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FedConfig;
    use crate::source::tests::{record, StaticSource};
    use fedmesh_core::net::{connect_to, create_listen_socket, encode_request, send_request, write_frame};
    use std::sync::Arc;
    use std::time::Duration;

    async fn served(local: &str, result: FedResult<ResponseResult>) -> (SharedCtx, u16) {
        let src = Arc::new(StaticSource::new(result));
        let (ctx, _ch) = FedContext::new(FedConfig::new(local), src);
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(accept_loop(ctx.clone(), listener));
        (ctx, port)
    }

    #[tokio::test]
    async fn test_operator_requests() {
        let rec = record("fedA", &[("east", 1, 1), ("west", 2, 2)]);
        let (ctx, port) = served("east", Ok(ResponseResult::FedRecord(Some(rec)))).await;
        let mut s = connect_to("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();

        let resp = send_request(&mut s, 1, &FedRequest::FedInfo).await.unwrap();
        assert!(matches!(resp.result, ResponseResult::FedInfo(None)));

        let resp = send_request(&mut s, 2, &FedRequest::Reload).await.unwrap();
        assert!(matches!(resp.result, ResponseResult::Success));

        let resp = send_request(&mut s, 3, &FedRequest::Siblings).await.unwrap();
        match resp.result {
            ResponseResult::Siblings(v) => {
                assert_eq!(v.len(), 1);
                assert_eq!(v[0].name, "west");
                assert!(!v[0].sync_recvd);
            }
            other => panic!("unexpected {:?}", other),
        }

        send_request(&mut s, 4, &FedRequest::Suspend).await.unwrap();
        let resp = send_request(&mut s, 5, &FedRequest::ControllerInfo).await.unwrap();
        assert_eq!(resp.id, 5);
        match resp.result {
            ResponseResult::Controller(info) => {
                assert_eq!(info.cluster_name, "east");
                assert_eq!(info.generation, 1);
                assert!(info.suspended);
            }
            other => panic!("unexpected {:?}", other),
        }
        send_request(&mut s, 6, &FedRequest::Resume).await.unwrap();
        assert!(!ctx.is_suspended().await);
        ctx.shutdown_notify.notify_waiters();
    }

    #[tokio::test]
    async fn test_reload_error_is_reported() {
        let (ctx, port) = served("east", Err(FedError::RpcFailed)).await;
        let mut s = connect_to("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();
        let resp = send_request(&mut s, 1, &FedRequest::Reload).await.unwrap();
        assert!(matches!(resp.result, ResponseResult::Error(FedError::RpcFailed)));
        assert!(!resp.is_success());
        ctx.shutdown_notify.notify_waiters();
    }

    #[tokio::test]
    async fn test_hello_tracks_inbound_link() {
        let rec = record("fedA", &[("east", 1, 1), ("west", 2, 2)]);
        let (ctx, port) = served("east", Ok(ResponseResult::FedRecord(Some(rec)))).await;
        ctx.reload().await.unwrap();

        let mut s = connect_to("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();
        let hello = encode_request(0, &FedRequest::Hello {
            cluster: "west".to_string(),
        })
        .unwrap();
        write_frame(&mut s, &hello).await.unwrap();
        // A request/response round trip orders us after the Hello.
        send_request(&mut s, 1, &FedRequest::ControllerInfo).await.unwrap();
        assert!(ctx.registry.read().await.link("west").unwrap().recv_connected);

        drop(s);
        let mut cleared = false;
        for _ in 0..50 {
            if !ctx.registry.read().await.link("west").unwrap().recv_connected {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cleared);
        ctx.shutdown_notify.notify_waiters();
    }
}

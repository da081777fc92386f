//! Async TCP I/O for federation controllers.
//!
//! Every message is a frame: a 4-byte big-endian length followed by the
//! bincode encoding of `(RequestHeader, FedRequest)` for requests or of
//! `FedResponse` for responses.

use std::time::Duration;

use fedmesh_proto::constants::FED_PROTO_VER;
use fedmesh_proto::defaults::{DEFAULT_FRAME_HEADROOM, DEFAULT_MAX_FRAME_SIZE};
use fedmesh_proto::request::{FedRequest, FedResponse, RequestHeader};
use fedmesh_proto::{FedEnvelope, FedError, FedResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

/// Connect to a controller by host and port, bounded by `timeout`.
pub async fn connect_to(host: &str, port: u16, timeout: Duration) -> FedResult<TcpStream> {
    let target = format!("{}:{}", host, port);
    debug!("connecting to {}", target);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!("connect to {} failed: {}", target, e);
            return Err(FedError::ConnectFailed);
        }
        Err(_) => {
            debug!("connect to {} timed out after {:?}", target, timeout);
            return Err(FedError::ConnectFailed);
        }
    };

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Connect to the first reachable address of a primary/backup list.
///
/// The backup is only tried when the primary attempt fails outright.
/// Returns the stream and the index of the address that answered.
pub async fn connect_with_fallback(
    addrs: &[(String, u16)],
    timeout: Duration,
) -> FedResult<(TcpStream, usize)> {
    for (idx, (host, port)) in addrs.iter().enumerate() {
        match connect_to(host, *port, timeout).await {
            Ok(stream) => return Ok((stream, idx)),
            Err(e) => {
                let which = if idx == 0 { "primary" } else { "backup" };
                warn!("unable to open {} address {}:{}: {}", which, host, port, e);
            }
        }
    }
    Err(FedError::ConnectFailed)
}

/// Create a TCP listener on the given address and port.
pub async fn create_listen_socket(bind_addr: &str, port: u16) -> FedResult<TcpListener> {
    let addr = format!("{}:{}", bind_addr, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        FedError::LocalError
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}

/// Build a complete request frame (length prefix included).
pub fn encode_request(id: u32, req: &FedRequest) -> FedResult<Vec<u8>> {
    let header = RequestHeader {
        proto_ver: FED_PROTO_VER,
        id,
    };
    let payload = bincode::serialize(&(&header, req)).map_err(|_| FedError::LocalError)?;
    frame(payload)
}

/// Build a complete response frame (length prefix included).
pub fn encode_response(resp: &FedResponse) -> FedResult<Vec<u8>> {
    let payload = bincode::serialize(resp).map_err(|_| FedError::LocalError)?;
    frame(payload)
}

/// Envelope bytes one `Sync` or `Deliver` frame can carry.
pub const MAX_BATCH_BYTES: u64 = (DEFAULT_MAX_FRAME_SIZE - DEFAULT_FRAME_HEADROOM) as u64;

/// Encoded size of an envelope inside a request.
pub fn envelope_size(env: &FedEnvelope) -> u64 {
    bincode::serialized_size(env).unwrap_or(u64::MAX)
}

/// Prefix a payload with its length. Payloads the peer would refuse to
/// read are rejected here instead.
fn frame(payload: Vec<u8>) -> FedResult<Vec<u8>> {
    if payload.len() > DEFAULT_MAX_FRAME_SIZE as usize {
        error!("refusing to send frame of {} bytes", payload.len());
        return Err(FedError::InvalidParms);
    }
    let mut buf = Vec::with_capacity(payload.len() + 4);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Read one frame body. `Ok(None)` when the peer closed cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> FedResult<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(FedError::NetworkError),
    };

    if len > DEFAULT_MAX_FRAME_SIZE {
        error!("frame too large: {} bytes", len);
        return Err(FedError::InvalidParms);
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|_| FedError::NetworkError)?;
    Ok(Some(buf))
}

/// Read and decode one request. `Ok(None)` on clean disconnect.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> FedResult<Option<(RequestHeader, FedRequest)>> {
    let Some(buf) = read_frame(reader).await? else {
        return Ok(None);
    };
    let decoded = bincode::deserialize(&buf).map_err(|_| {
        error!("failed to deserialize request");
        FedError::InvalidParms
    })?;
    Ok(Some(decoded))
}

/// Read and decode one response.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> FedResult<FedResponse> {
    let buf = read_frame(reader).await?.ok_or(FedError::NetworkError)?;
    bincode::deserialize(&buf).map_err(|_| {
        error!("failed to deserialize response");
        FedError::UnexpectedResponse
    })
}

/// Write a pre-encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> FedResult<()> {
    writer
        .write_all(frame)
        .await
        .map_err(|_| FedError::NetworkError)?;
    writer.flush().await.map_err(|_| FedError::NetworkError)
}

/// Encode and write one response.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &FedResponse,
) -> FedResult<()> {
    let buf = encode_response(resp)?;
    write_frame(writer, &buf).await
}

/// Send one request and wait for its response.
pub async fn send_request(stream: &mut TcpStream, id: u32, req: &FedRequest) -> FedResult<FedResponse> {
    let buf = encode_request(id, req)?;
    write_frame(stream, &buf).await?;
    read_response(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedmesh_proto::request::ResponseResult;

    #[tokio::test]
    async fn test_request_response_over_loopback() {
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (header, req) = read_request(&mut stream).await.unwrap().unwrap();
            assert!(matches!(req, FedRequest::ControllerInfo));
            let resp = FedResponse::new(header.id, ResponseResult::Rc(0));
            write_response(&mut stream, &resp).await.unwrap();
            // Clean close between frames reads as None.
            assert!(read_request(&mut stream).await.unwrap().is_none());
        });

        let mut stream = connect_to("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap();
        let resp = send_request(&mut stream, 7, &FedRequest::ControllerInfo)
            .await
            .unwrap();
        assert_eq!(resp.id, 7);
        assert!(resp.is_success());
        drop(stream);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fallback_to_backup() {
        // A bound-then-dropped port is refused on loopback.
        let dead = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let live = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let live_port = live.local_addr().unwrap().port();

        let addrs = vec![
            ("127.0.0.1".to_string(), dead_port),
            ("127.0.0.1".to_string(), live_port),
        ];
        let (_stream, idx) = connect_with_fallback(&addrs, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(idx, 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut data: &[u8] = &(DEFAULT_MAX_FRAME_SIZE + 1).to_be_bytes();
        assert_eq!(read_frame(&mut data).await, Err(FedError::InvalidParms));
    }

    #[test]
    fn test_oversized_frame_not_encoded() {
        let big = FedEnvelope {
            kind: "job".to_string(),
            payload: vec![0u8; 9 * 1024 * 1024],
        };
        let req = FedRequest::Deliver {
            cluster: "east".to_string(),
            messages: vec![big],
        };
        assert_eq!(encode_request(1, &req), Err(FedError::InvalidParms));
    }

    #[tokio::test]
    async fn test_full_batch_fits_in_frame() {
        // Largest batch the outbox hands out, as a single envelope.
        let env = FedEnvelope {
            kind: "job".to_string(),
            payload: Vec::new(),
        };
        let overhead = envelope_size(&env);
        let env = FedEnvelope {
            payload: vec![7u8; (MAX_BATCH_BYTES - overhead) as usize],
            ..env
        };
        assert_eq!(envelope_size(&env), MAX_BATCH_BYTES);
        let req = FedRequest::Deliver {
            cluster: "a".repeat(64),
            messages: vec![env],
        };
        let buf = encode_request(1, &req).unwrap();
        let mut data: &[u8] = &buf;
        let (_, back) = read_request(&mut data).await.unwrap().unwrap();
        assert!(matches!(back, FedRequest::Deliver { messages, .. } if messages.len() == 1));
    }
}

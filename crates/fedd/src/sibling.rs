//! Sibling connection manager.
//!
//! Each sibling gets one worker task that owns its outbound socket and
//! drives the link through `DISCONNECTED -> CONNECTING -> CONNECTED` and
//! back. The worker:
//!
//! 1. asks the registry for permission to connect (retry cool-down),
//! 2. connects outside the lock, primary address first, backup second,
//! 3. records the outcome under the lock, discarding it if the sibling
//!    was removed or replaced while connecting,
//! 4. runs the sync handshake,
//! 5. probes liveness and flushes queued envelopes with non-blocking
//!    writes until a fatal error, then tears the link down and starts over.
//!
//! Workers are started and stopped from membership events. A removal is
//! only honoured once the registry no longer holds the sibling, and a
//! stopped worker is aborted along with its handle.

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fedmesh_core::net::{connect_with_fallback, encode_request};
use fedmesh_core::send::{is_transient, try_send, SendOutcome, TryWrite};
use fedmesh_proto::{FedRequest, FedResult};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::daemon::SharedCtx;
use crate::registry::{ConnectGate, MembershipEvent, SiblingLink};
use crate::sync;

/// Opens outbound sibling connections.
#[async_trait]
pub trait SiblingConnector: Send + Sync {
    /// Connect to the first reachable address, in order.
    async fn connect(&self, addrs: &[(String, u16)], timeout: Duration) -> FedResult<TcpStream>;
}

/// Plain TCP connector.
pub struct TcpConnector;

#[async_trait]
impl SiblingConnector for TcpConnector {
    async fn connect(&self, addrs: &[(String, u16)], timeout: Duration) -> FedResult<TcpStream> {
        let (stream, idx) = connect_with_fallback(addrs, timeout).await?;
        if idx > 0 {
            info!("connected via backup address {}:{}", addrs[idx].0, addrs[idx].1);
        }
        Ok(stream)
    }
}

/// Result of one [`SiblingManager::try_connect`] call.
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected { stream: TcpStream, epoch: u64 },
    /// The attempt was made and failed.
    Failed,
    /// No attempt was made; retry after the delay if given.
    Skipped(Option<Duration>),
    /// The sibling is no longer in the registry under this incarnation.
    Gone,
}

/// Writes whole frames over a non-blocking socket.
///
/// A partial write counts as sent; the unsent tail is kept and goes out
/// before the next frame so the stream stays aligned.
#[derive(Default)]
struct LinkWriter {
    pending: Vec<u8>,
}

impl LinkWriter {
    fn send<W: TryWrite + ?Sized>(&mut self, w: &W, frame: &[u8], retries: u32) -> SendOutcome {
        if !self.pending.is_empty() {
            match try_send(w, &self.pending, retries) {
                SendOutcome::Sent { written, .. } => {
                    self.pending.drain(..written);
                }
                other => return other,
            }
            if !self.pending.is_empty() {
                return SendOutcome::Deferred;
            }
        }
        let outcome = try_send(w, frame, retries);
        if let SendOutcome::Sent { written, .. } = outcome {
            if outcome.is_partial() {
                self.pending.extend_from_slice(&frame[written..]);
            }
        }
        outcome
    }
}

/// An established outbound link as seen by its worker.
#[derive(Clone, Copy)]
struct LiveLink<'a> {
    name: &'a str,
    inc: u64,
    epoch: u64,
    local: &'a str,
    stream: &'a TcpStream,
    ping: &'a [u8],
}

struct WorkerHandle {
    incarnation: u64,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct SiblingManager {
    ctx: SharedCtx,
    connector: Arc<dyn SiblingConnector>,
    workers: DashMap<String, WorkerHandle>,
}

impl SiblingManager {
    pub fn new(ctx: SharedCtx, connector: Arc<dyn SiblingConnector>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            connector,
            workers: DashMap::new(),
        })
    }

    /// React to one membership change.
    pub async fn apply(self: &Arc<Self>, ev: MembershipEvent) {
        debug!("sibling {}: membership event {:?}", ev.name(), ev);
        match ev {
            MembershipEvent::Added(name) | MembershipEvent::Changed(name) => {
                self.start_worker(name).await
            }
            MembershipEvent::Removed(name) => {
                // A removal published before a newer install may arrive late.
                if self.ctx.registry.read().await.link(&name).is_some() {
                    debug!("sibling {}: ignoring stale removal, sibling still present", name);
                    return;
                }
                self.stop_worker(&name)
            }
        }
    }

    async fn start_worker(self: &Arc<Self>, name: String) {
        let found = {
            let reg = self.ctx.registry.read().await;
            reg.link(&name).map(|l| (l.incarnation, l.wake.clone()))
        };
        let Some((inc, wake)) = found else {
            debug!("sibling {}: no link, not starting worker", name);
            return;
        };
        if self.workers.get(&name).is_some_and(|w| w.incarnation == inc) {
            return;
        }
        self.stop_worker(&name);

        let mgr = self.clone();
        let worker_name = name.clone();
        let worker_wake = wake.clone();
        let task = tokio::spawn(async move {
            mgr.run_worker(worker_name, inc, worker_wake).await;
        });
        self.workers.insert(
            name,
            WorkerHandle {
                incarnation: inc,
                wake,
                task,
            },
        );
    }

    fn stop_worker(&self, name: &str) {
        if let Some((_, w)) = self.workers.remove(name) {
            debug!("sibling {}: stopping worker (incarnation {})", name, w.incarnation);
            w.wake.notify_one();
            w.task.abort();
        }
    }

    /// Stop every worker, closing its socket and retry timer.
    pub fn shutdown(&self) {
        info!("stopping {} sibling workers", self.workers.len());
        for w in self.workers.iter() {
            w.task.abort();
        }
        self.workers.clear();
    }

    /// One gated connect attempt.
    pub async fn try_connect(&self, name: &str, inc: u64) -> ConnectOutcome {
        let cooldown = self.ctx.config.retry_cooldown;
        let gate = self
            .ctx
            .registry
            .write()
            .await
            .begin_connect(name, inc, Instant::now(), cooldown);
        let addrs = match gate {
            ConnectGate::Proceed(addrs) => addrs,
            ConnectGate::Cooldown(wait) => return ConnectOutcome::Skipped(Some(wait)),
            ConnectGate::Busy => return ConnectOutcome::Skipped(None),
            ConnectGate::NoAddress => {
                debug!("sibling {}: no control address registered", name);
                return ConnectOutcome::Skipped(Some(cooldown));
            }
            ConnectGate::Gone => return ConnectOutcome::Gone,
        };

        debug!("sibling {}: connecting", name);
        let result = self.connector.connect(&addrs, self.ctx.config.connect_timeout).await;

        let mut reg = self.ctx.registry.write().await;
        match result {
            Ok(stream) => match reg.mark_connected(name, inc, stream.as_raw_fd()) {
                Ok(epoch) => ConnectOutcome::Connected { stream, epoch },
                Err(_) => {
                    info!("sibling {}: discarding connection, sibling was removed", name);
                    ConnectOutcome::Gone
                }
            },
            Err(e) => {
                warn!("sibling {}: connect failed: {}", name, e);
                match reg.mark_connect_failed(name, inc) {
                    Ok(()) => ConnectOutcome::Failed,
                    Err(_) => ConnectOutcome::Gone,
                }
            }
        }
    }

    async fn run_worker(self: Arc<Self>, name: String, inc: u64, wake: Arc<Notify>) {
        debug!("sibling {}: worker started (incarnation {})", name, inc);
        loop {
            match self.try_connect(&name, inc).await {
                ConnectOutcome::Gone => break,
                ConnectOutcome::Connected { stream, epoch } => {
                    self.serve_link(&name, inc, epoch, stream, &wake).await
                }
                ConnectOutcome::Failed => {}
                ConnectOutcome::Skipped(delay) => {
                    let delay = delay.unwrap_or(self.ctx.config.liveness_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wake.notified() => {}
                    }
                }
            }
        }
        debug!("sibling {}: worker exiting", name);
    }

    async fn teardown(&self, name: &str, inc: u64, epoch: u64, penalize: bool) {
        let mut reg = self.ctx.registry.write().await;
        if reg.mark_disconnected(name, inc, epoch, penalize) {
            let pending = reg.link(name).map_or(0, SiblingLink::outbox_len);
            info!(
                "sibling {}: link torn down, reconnect scheduled ({} messages pending)",
                name, pending
            );
        }
    }

    /// Send queued envelopes, one `Deliver` frame per batch, until the
    /// outbox is empty or the socket is busy. Returns `false` on a fatal
    /// send error.
    async fn flush_outbox(
        &self,
        name: &str,
        inc: u64,
        local: &str,
        stream: &TcpStream,
        writer: &mut LinkWriter,
    ) -> bool {
        loop {
            let messages = self.ctx.registry.write().await.drain_outbox(name, inc);
            if messages.is_empty() {
                return true;
            }
            let count = messages.len();
            let deliver = FedRequest::Deliver {
                cluster: local.to_string(),
                messages: messages.clone(),
            };
            let frame = match encode_request(0, &deliver) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("sibling {}: dropping {} unencodable messages: {}", name, count, e);
                    continue;
                }
            };
            match writer.send(stream, &frame, self.ctx.config.send_retries) {
                SendOutcome::Sent { .. } => {
                    debug!("sibling {}: delivered {} messages", name, count);
                }
                SendOutcome::Deferred => {
                    debug!("sibling {}: socket busy, requeueing messages", name);
                    self.ctx.registry.write().await.requeue(name, inc, messages);
                    return true;
                }
                SendOutcome::Failed(kind) => {
                    warn!("sibling {}: send failed: {:?}", name, kind);
                    self.ctx.registry.write().await.requeue(name, inc, messages);
                    return false;
                }
            }
        }
    }

    /// Flush the outbox and, when `probe` is set, send a liveness ping.
    /// Returns `false` once the link is over; a failed link is torn down
    /// before returning.
    async fn upkeep(&self, link: &LiveLink<'_>, writer: &mut LinkWriter, probe: bool) -> bool {
        let LiveLink {
            name,
            inc,
            epoch,
            local,
            stream,
            ping,
        } = *link;
        if !self.ctx.registry.read().await.is_current(name, inc, epoch) {
            debug!("sibling {}: link superseded", name);
            return false;
        }

        if !self.flush_outbox(name, inc, local, stream, writer).await {
            self.teardown(name, inc, epoch, false).await;
            return false;
        }

        if probe && !self.ctx.is_suspended().await {
            match writer.send(stream, ping, self.ctx.config.send_retries) {
                SendOutcome::Deferred => {
                    warn!("sibling {}: liveness probe deferred, socket busy", name)
                }
                SendOutcome::Failed(kind) => {
                    warn!("sibling {}: liveness probe failed: {:?}", name, kind);
                    self.teardown(name, inc, epoch, false).await;
                    return false;
                }
                sent @ SendOutcome::Sent { written, len } => {
                    if sent.is_partial() {
                        debug!("sibling {}: partial liveness write {}/{}", name, written, len)
                    }
                }
            }
        }
        true
    }

    /// Drive an established link until it fails or is superseded.
    async fn serve_link(&self, name: &str, inc: u64, epoch: u64, mut stream: TcpStream, wake: &Notify) {
        match sync::handshake(&self.ctx, name, inc, epoch, &mut stream).await {
            Ok(true) => {
                if let Err(e) = self.ctx.notifier.notify("sibling synchronized").await {
                    warn!("sync notification failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!("sibling {}: sync handshake failed: {}", name, e);
                self.teardown(name, inc, epoch, true).await;
                return;
            }
        }

        let local = self.ctx.local_name().to_string();
        let ping = match encode_request(0, &FedRequest::Ping { cluster: local.clone() }) {
            Ok(frame) => frame,
            Err(e) => {
                error!("sibling {}: cannot encode liveness probe: {}", name, e);
                self.teardown(name, inc, epoch, true).await;
                return;
            }
        };
        let link = LiveLink {
            name,
            inc,
            epoch,
            local: &local,
            stream: &stream,
            ping: &ping,
        };
        let mut writer = LinkWriter::default();
        let mut ticker = tokio::time::interval(self.ctx.config.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut scratch = [0u8; 256];

        // Whatever did not fit in the sync frame goes out now.
        if !self.upkeep(&link, &mut writer, false).await {
            return;
        }

        loop {
            let mut probe = false;
            tokio::select! {
                _ = ticker.tick() => probe = true,
                _ = wake.notified() => {}
                ready = stream.readable() => {
                    if ready.is_err() {
                        self.teardown(name, inc, epoch, false).await;
                        return;
                    }
                    match stream.try_read(&mut scratch) {
                        Ok(0) => {
                            info!("sibling {}: peer closed the link", name);
                            self.teardown(name, inc, epoch, false).await;
                            return;
                        }
                        Ok(n) => debug!("sibling {}: ignoring {} unsolicited bytes", name, n),
                        Err(e) if is_transient(e.kind()) => {}
                        Err(e) => {
                            warn!("sibling {}: read error: {}", name, e);
                            self.teardown(name, inc, epoch, false).await;
                            return;
                        }
                    }
                }
            }

            if !self.upkeep(&link, &mut writer, probe).await {
                return;
            }
        }
    }
}

/// Feed membership changes to the manager until the channel closes.
pub async fn membership_event_loop(mgr: Arc<SiblingManager>, mut rx: mpsc::Receiver<MembershipEvent>) {
    info!("membership event loop started");
    while let Some(ev) = rx.recv().await {
        mgr.apply(ev).await;
    }
    info!("membership event loop ending");
}

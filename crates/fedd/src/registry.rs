//! Federation registry: the authoritative in-memory membership table.
//!
//! One coarse lock guards the registry together with every sibling's
//! connection fields. Callers hold it only for state transitions and
//! snapshots, never across a network call.
//!
//! A reload is an atomic swap of the cluster table. It produces diff
//! events for the sibling manager instead of letting workers poll. A
//! sibling whose name and control addresses did not change keeps its
//! live link across the swap.
//!
//! Each link carries two counters:
//! - `incarnation` identifies one registry life of a sibling. Workers
//!   and in-flight connect attempts present it on every transition, so a
//!   sibling removed (or re-added) by a reload cannot be touched by a
//!   stale completion.
//! - `epoch` identifies one established outbound connection. Sync can
//!   only be marked for the epoch that is still connected.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use fedmesh_core::net::{envelope_size, MAX_BATCH_BYTES};
use fedmesh_proto::{
    ClusterRec, FedEnvelope, FedError, FedResult, FedState, Federation, LinkStatus, SiblingView,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Membership change emitted by a reload, consumed by the sibling manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A sibling appeared.
    Added(String),
    /// A sibling vanished (or became the local cluster).
    Removed(String),
    /// A sibling's control addresses changed; its old link is gone.
    Changed(String),
}

impl MembershipEvent {
    pub fn name(&self) -> &str {
        match self {
            MembershipEvent::Added(n) | MembershipEvent::Removed(n) | MembershipEvent::Changed(n) => n,
        }
    }
}

/// Connection state machine of one sibling link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-sibling connection record.
#[derive(Debug)]
pub struct SiblingLink {
    pub state: LinkState,
    pub send_connected: bool,
    pub recv_connected: bool,
    pub sync_recvd: bool,
    pub last_attempt_time: Option<Instant>,
    /// Consecutive failed attempts; gates the retry cool-down.
    pub failures: u32,
    /// Socket handle of the outbound connection, owned by the worker.
    pub fd: Option<RawFd>,
    pub incarnation: u64,
    pub epoch: u64,
    /// Inbound connection that last identified itself as this sibling.
    recv_conn: Option<u64>,
    outbox: VecDeque<FedEnvelope>,
    /// Wakes the link's worker (queued messages, removal).
    pub wake: Arc<Notify>,
}

impl SiblingLink {
    fn new(incarnation: u64) -> Self {
        Self {
            state: LinkState::Disconnected,
            send_connected: false,
            recv_connected: false,
            sync_recvd: false,
            last_attempt_time: None,
            failures: 0,
            fd: None,
            incarnation,
            epoch: 0,
            recv_conn: None,
            outbox: VecDeque::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            send_connected: self.send_connected,
            recv_connected: self.recv_connected,
            sync_recvd: self.sync_recvd,
        }
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }
}

/// One federation member. `link` is `None` for the local cluster.
#[derive(Debug)]
pub struct ClusterEntry {
    pub rec: ClusterRec,
    pub link: Option<SiblingLink>,
}

/// Outcome of asking to start a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectGate {
    /// Go ahead; the link is now `Connecting`.
    Proceed(Vec<(String, u16)>),
    /// Inside the retry cool-down; try again after the given delay.
    Cooldown(Duration),
    /// Already connecting or connected.
    Busy,
    /// The sibling has no usable control address.
    NoAddress,
    /// The link no longer exists in this incarnation.
    Gone,
}

/// The live federation table.
#[derive(Debug)]
pub struct Registry {
    local_name: String,
    fed_name: Option<String>,
    clusters: BTreeMap<String, ClusterEntry>,
    generation: u64,
    next_incarnation: u64,
    outbox_capacity: usize,
}

impl Registry {
    pub fn new(local_name: impl Into<String>, outbox_capacity: usize) -> Self {
        Self {
            local_name: local_name.into(),
            fed_name: None,
            clusters: BTreeMap::new(),
            generation: 0,
            next_incarnation: 1,
            outbox_capacity,
        }
    }

    /// Bumped on every install, including clears.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_federated(&self) -> bool {
        self.fed_name.is_some()
    }

    fn alloc_link(&mut self) -> SiblingLink {
        let inc = self.next_incarnation;
        self.next_incarnation += 1;
        SiblingLink::new(inc)
    }

    /// Atomically replace the membership table and report what changed.
    pub fn install(&mut self, fed: Option<Federation>) -> Vec<MembershipEvent> {
        let mut old = std::mem::take(&mut self.clusters);
        let mut events = Vec::new();

        let (fed_name, recs) = match fed.filter(|f| !f.is_empty()) {
            Some(f) => (Some(f.name), f.clusters),
            None => (None, Vec::new()),
        };

        for mut rec in recs {
            rec.link = None;
            let name = rec.name.clone();
            let prev = old.remove(&name);

            let link = if name == self.local_name {
                if prev.as_ref().is_some_and(|p| p.link.is_some()) {
                    events.push(MembershipEvent::Removed(name.clone()));
                }
                None
            } else {
                match prev {
                    Some(ClusterEntry {
                        rec: prev_rec,
                        link: Some(link),
                    }) if prev_rec.same_endpoints(&rec) => Some(link),
                    Some(ClusterEntry { link: Some(_), .. }) => {
                        events.push(MembershipEvent::Changed(name.clone()));
                        Some(self.alloc_link())
                    }
                    _ => {
                        events.push(MembershipEvent::Added(name.clone()));
                        Some(self.alloc_link())
                    }
                }
            };
            self.clusters.insert(name, ClusterEntry { rec, link });
        }

        for (name, entry) in old {
            if entry.link.is_some() {
                events.push(MembershipEvent::Removed(name));
            }
        }

        self.fed_name = fed_name;
        self.generation += 1;
        info!(
            "federation registry installed: generation={}, clusters={}, changes={}",
            self.generation,
            self.clusters.len(),
            events.len()
        );
        events
    }

    /// Drop the whole table. Idempotent.
    pub fn clear(&mut self) -> Vec<MembershipEvent> {
        if self.fed_name.is_none() && self.clusters.is_empty() {
            return Vec::new();
        }
        self.install(None)
    }

    /// Consistent point-in-time copy, with live link flags on siblings.
    pub fn snapshot(&self) -> Option<Federation> {
        let name = self.fed_name.clone()?;
        let clusters = self
            .clusters
            .values()
            .map(|e| {
                let mut rec = e.rec.clone();
                rec.link = e.link.as_ref().map(SiblingLink::status);
                rec
            })
            .collect();
        Some(Federation { name, clusters })
    }

    /// Scheduler-facing view of every sibling.
    pub fn siblings(&self) -> Vec<SiblingView> {
        self.clusters
            .values()
            .filter_map(|e| {
                let link = e.link.as_ref()?;
                Some(SiblingView {
                    name: e.rec.name.clone(),
                    host: e.rec.control_host.clone(),
                    port: e.rec.control_port,
                    fed_id: e.rec.fed_id,
                    state: e.rec.state,
                    sync_recvd: link.sync_recvd,
                })
            })
            .collect()
    }

    /// The local cluster's own record, if it is a member.
    pub fn local(&self) -> Option<&ClusterRec> {
        self.clusters.get(&self.local_name).map(|e| &e.rec)
    }

    pub fn link(&self, name: &str) -> Option<&SiblingLink> {
        self.clusters.get(name)?.link.as_ref()
    }

    fn link_mut(&mut self, name: &str) -> Option<&mut SiblingLink> {
        self.clusters.get_mut(name)?.link.as_mut()
    }

    fn live_link_mut(&mut self, name: &str, inc: u64) -> Option<&mut SiblingLink> {
        self.link_mut(name).filter(|l| l.incarnation == inc)
    }

    // ---- Connection state machine ----

    /// `DISCONNECTED -> CONNECTING`, subject to the retry cool-down.
    pub fn begin_connect(&mut self, name: &str, inc: u64, now: Instant, cooldown: Duration) -> ConnectGate {
        let Some(entry) = self.clusters.get_mut(name) else {
            return ConnectGate::Gone;
        };
        let addrs = entry.rec.control_addrs();
        let Some(link) = entry.link.as_mut().filter(|l| l.incarnation == inc) else {
            return ConnectGate::Gone;
        };
        if link.state != LinkState::Disconnected {
            return ConnectGate::Busy;
        }
        if link.failures > 0 {
            if let Some(last) = link.last_attempt_time {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < cooldown {
                    return ConnectGate::Cooldown(cooldown - elapsed);
                }
            }
        }
        if addrs.is_empty() {
            return ConnectGate::NoAddress;
        }
        link.state = LinkState::Connecting;
        link.last_attempt_time = Some(now);
        ConnectGate::Proceed(addrs)
    }

    /// `CONNECTING -> CONNECTED`. Returns the new connection epoch.
    ///
    /// Fails with `NotFound` when the link was removed while connecting;
    /// the caller must then discard its socket.
    pub fn mark_connected(&mut self, name: &str, inc: u64, fd: RawFd) -> FedResult<u64> {
        let link = self.live_link_mut(name, inc).ok_or(FedError::NotFound)?;
        if link.state != LinkState::Connecting {
            warn!("sibling {}: connect completed in state {:?}", name, link.state);
            return Err(FedError::NotFound);
        }
        link.state = LinkState::Connected;
        link.send_connected = true;
        link.sync_recvd = false;
        link.fd = Some(fd);
        link.failures = 0;
        link.epoch += 1;
        info!("sibling {}: connected (epoch {})", name, link.epoch);
        Ok(link.epoch)
    }

    /// `CONNECTING -> DISCONNECTED` after a failed attempt.
    pub fn mark_connect_failed(&mut self, name: &str, inc: u64) -> FedResult<()> {
        let link = self.live_link_mut(name, inc).ok_or(FedError::NotFound)?;
        if link.state == LinkState::Connecting {
            link.state = LinkState::Disconnected;
            link.failures = link.failures.saturating_add(1);
        }
        Ok(())
    }

    /// `CONNECTED -> DISCONNECTED`. Clears every trust flag in one update.
    ///
    /// `penalize` counts the teardown as a failed attempt so the next
    /// connect waits out the cool-down. Returns whether anything changed.
    pub fn mark_disconnected(&mut self, name: &str, inc: u64, epoch: u64, penalize: bool) -> bool {
        let Some(link) = self.live_link_mut(name, inc) else {
            return false;
        };
        if link.epoch != epoch || link.state != LinkState::Connected {
            return false;
        }
        link.state = LinkState::Disconnected;
        link.send_connected = false;
        link.recv_connected = false;
        link.sync_recvd = false;
        link.recv_conn = None;
        link.fd = None;
        if penalize {
            link.failures = link.failures.saturating_add(1);
        }
        info!("sibling {}: disconnected (epoch {})", name, epoch);
        true
    }

    /// Record a completed sync handshake.
    ///
    /// Only the still-connected epoch can be marked. Returns `true` when
    /// the flag flipped; re-marking an already synced link is a no-op.
    pub fn mark_synced(&mut self, name: &str, inc: u64, epoch: u64) -> bool {
        let Some(link) = self.live_link_mut(name, inc) else {
            return false;
        };
        if link.state != LinkState::Connected || !link.send_connected || link.epoch != epoch {
            debug!("sibling {}: ignoring sync for stale epoch {}", name, epoch);
            return false;
        }
        if link.sync_recvd {
            return false;
        }
        link.sync_recvd = true;
        info!("sibling {}: synchronized (epoch {})", name, epoch);
        true
    }

    /// Whether `(inc, epoch)` is still the live connected link.
    pub fn is_current(&self, name: &str, inc: u64, epoch: u64) -> bool {
        self.link(name).is_some_and(|l| {
            l.incarnation == inc && l.epoch == epoch && l.state == LinkState::Connected
        })
    }

    /// The sibling identified itself on inbound connection `conn`.
    pub fn mark_recv(&mut self, name: &str, conn: u64) -> FedResult<()> {
        let link = self.link_mut(name).ok_or(FedError::NotFound)?;
        if !link.recv_connected {
            info!("sibling {}: inbound link established", name);
        }
        link.recv_connected = true;
        link.recv_conn = Some(conn);
        Ok(())
    }

    /// Inbound connection `conn` closed.
    pub fn clear_recv(&mut self, name: &str, conn: u64) {
        if let Some(link) = self.link_mut(name) {
            if link.recv_conn == Some(conn) {
                link.recv_connected = false;
                link.recv_conn = None;
                info!("sibling {}: inbound link closed", name);
            }
        }
    }

    /// Record the state and features a sibling reported about itself.
    pub fn apply_remote(&mut self, name: &str, state: FedState, features: BTreeSet<String>) -> FedResult<()> {
        let entry = self.clusters.get_mut(name).ok_or(FedError::NotFound)?;
        if entry.link.is_none() {
            return Err(FedError::NotFound);
        }
        if entry.rec.state != state {
            info!("sibling {}: state {} -> {}", name, entry.rec.state, state);
        }
        entry.rec.state = state;
        entry.rec.features = features;
        Ok(())
    }

    // ---- Outbox ----

    /// Queue an envelope for a sibling, dropping the oldest on overflow.
    /// An envelope too large for any frame is refused.
    pub fn queue_message(&mut self, name: &str, env: FedEnvelope) -> FedResult<()> {
        let capacity = self.outbox_capacity;
        let link = self.link_mut(name).ok_or(FedError::NotFound)?;
        let size = envelope_size(&env);
        if size > MAX_BATCH_BYTES {
            warn!("sibling {}: refusing {}-byte {} message", name, size, env.kind);
            return Err(FedError::InvalidParms);
        }
        if link.outbox.len() >= capacity {
            warn!("sibling {}: outbox full, dropping oldest message", name);
            link.outbox.pop_front();
        }
        link.outbox.push_back(env);
        link.wake.notify_one();
        Ok(())
    }

    /// Take envelopes from the front, as many as fit in one frame.
    pub fn drain_outbox(&mut self, name: &str, inc: u64) -> Vec<FedEnvelope> {
        let Some(link) = self.live_link_mut(name, inc) else {
            return Vec::new();
        };
        let mut batch = Vec::new();
        let mut bytes = 0u64;
        while let Some(next) = link.outbox.front() {
            let size = envelope_size(next);
            if !batch.is_empty() && bytes.saturating_add(size) > MAX_BATCH_BYTES {
                break;
            }
            bytes = bytes.saturating_add(size);
            if let Some(env) = link.outbox.pop_front() {
                batch.push(env);
            }
        }
        if !link.outbox.is_empty() {
            debug!("sibling {}: {} messages left for the next frame", name, link.outbox.len());
        }
        batch
    }

    /// Put back messages that could not be sent, ahead of newer ones.
    pub fn requeue(&mut self, name: &str, inc: u64, msgs: Vec<FedEnvelope>) {
        let capacity = self.outbox_capacity;
        if let Some(link) = self.live_link_mut(name, inc) {
            for env in msgs.into_iter().rev() {
                link.outbox.push_front(env);
            }
            if link.outbox.len() > capacity {
                let excess = link.outbox.len() - capacity;
                warn!("sibling {}: outbox full, dropping {} oldest messages", name, excess);
                link.outbox.drain(..excess);
            }
        }
    }
}

//! Controller-wide federation context.
//!
//! Everything the RPC handlers and sibling workers share lives in one
//! explicitly constructed [`FedContext`], passed around as an `Arc`.
//! Locks are split by concern: the registry (membership plus every
//! link's connection fields) has one coarse lock, the liveness suspend
//! flag has its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fedmesh_core::notifier::EventNotifier;
use fedmesh_proto::defaults::{DEFAULT_INBOX_CHANNEL_SIZE, DEFAULT_MEMBERSHIP_CHANNEL_SIZE};
use fedmesh_proto::{FedEnvelope, FedError, FedRecord, FedResult, Federation};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{error, info, warn};

use crate::config::{self, FedConfig};
use crate::registry::{MembershipEvent, Registry};
use crate::source::{self, RegistrationSource};

/// Shared controller context.
pub type SharedCtx = Arc<FedContext>;

/// Envelope received from a sibling, tagged with its origin.
pub type InboxItem = (String, FedEnvelope);

/// Receiving ends handed to the daemon's consumer loops.
pub struct FedChannels {
    pub membership_rx: mpsc::Receiver<MembershipEvent>,
    pub inbox_rx: mpsc::Receiver<InboxItem>,
}

pub struct FedContext {
    pub config: FedConfig,

    /// Federation registry and all sibling link state.
    pub registry: RwLock<Registry>,

    /// Liveness probing suspended by the operator.
    suspended: Mutex<bool>,

    source: Arc<dyn RegistrationSource>,

    /// One-shot wake-up for the external scheduler.
    pub notifier: EventNotifier,

    membership_tx: mpsc::Sender<MembershipEvent>,
    /// Held from registry swap to the last published event so diffs from
    /// concurrent reloads reach the manager in install order.
    publish_lock: Mutex<()>,
    pub inbox_tx: mpsc::Sender<InboxItem>,

    /// Notify channel for shutdown.
    pub shutdown_notify: Arc<Notify>,

    next_conn_id: AtomicU64,
}

impl FedContext {
    pub fn new(config: FedConfig, source: Arc<dyn RegistrationSource>) -> (SharedCtx, FedChannels) {
        let (membership_tx, membership_rx) = mpsc::channel(DEFAULT_MEMBERSHIP_CHANNEL_SIZE);
        let (inbox_tx, inbox_rx) = mpsc::channel(DEFAULT_INBOX_CHANNEL_SIZE);
        let ctx = Arc::new(Self {
            registry: RwLock::new(Registry::new(&config.cluster_name, config.outbox_capacity)),
            suspended: Mutex::new(false),
            source,
            notifier: EventNotifier::new(config.notify.clone()),
            membership_tx,
            publish_lock: Mutex::new(()),
            inbox_tx,
            shutdown_notify: Arc::new(Notify::new()),
            next_conn_id: AtomicU64::new(1),
            config,
        });
        (
            ctx,
            FedChannels {
                membership_rx,
                inbox_rx,
            },
        )
    }

    pub fn local_name(&self) -> &str {
        &self.config.cluster_name
    }

    /// Id for a newly accepted inbound connection.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn is_suspended(&self) -> bool {
        *self.suspended.lock().await
    }

    pub async fn set_suspended(&self, on: bool) {
        let mut flag = self.suspended.lock().await;
        if *flag != on {
            info!("liveness probing {}", if on { "suspended" } else { "resumed" });
        }
        *flag = on;
    }

    /// Swap in a new membership table and hand the diff to the manager.
    pub async fn install(&self, fed: Option<Federation>) {
        let order = self.publish_lock.lock().await;
        let events = self.registry.write().await.install(fed);
        let changed = !events.is_empty();
        self.publish(events).await;
        drop(order);
        if changed {
            if let Err(e) = self.notifier.notify("federation membership changed").await {
                warn!("membership notification failed: {}", e);
            }
        }
    }

    async fn publish(&self, events: Vec<MembershipEvent>) {
        for ev in events {
            if self.membership_tx.send(ev).await.is_err() {
                warn!("membership channel closed");
                break;
            }
        }
    }

    /// Reload membership from the registration authority.
    ///
    /// On any error the registry keeps its prior state.
    pub async fn reload(&self) -> FedResult<()> {
        let fed = source::load(self.source.as_ref()).await?;
        if let Some(dir) = &self.config.state_dir {
            let rec = fed.as_ref().map(FedRecord::from);
            if let Err(e) = config::save_fed_state(dir, rec.as_ref()).await {
                error!("failed to persist federation state: {}", e);
            }
        }
        self.install(fed).await;
        Ok(())
    }

    /// Restore the last persisted federation, used when the authority is
    /// unreachable at startup.
    pub async fn restore(&self) -> FedResult<bool> {
        let Some(dir) = &self.config.state_dir else {
            return Ok(false);
        };
        let Some(rec) = config::load_fed_state(dir).await? else {
            return Ok(false);
        };
        let fed = rec.into_federation()?;
        let found = fed.is_some();
        self.install(fed).await;
        Ok(found)
    }

    /// Tear the registry down. Idempotent.
    pub async fn destroy(&self) {
        let _order = self.publish_lock.lock().await;
        let events = self.registry.write().await.clear();
        self.publish(events).await;
    }

    /// Queue a cross-cluster envelope for a sibling.
    pub async fn queue_message(&self, sibling: &str, env: FedEnvelope) -> FedResult<()> {
        let mut reg = self.registry.write().await;
        if !reg.is_federated() {
            return Err(FedError::NoFederation);
        }
        reg.queue_message(sibling, env)
    }
}

//! Tunable operational defaults for the federation substrate.
//!
//! Protocol-level constants (ports, limits, payloads) remain in
//! [`crate::constants`]. This module centralizes the configurable
//! defaults that can be overridden via CLI flags.

// ─── Sibling Connections ────────────────────────────────────────────────────

/// Interval between liveness probes on an established sibling link (seconds).
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 30;

/// Minimum spacing between two connect attempts to the same sibling (seconds).
pub const DEFAULT_RETRY_COOLDOWN_SECS: u64 = 60;

/// Upper bound on a single sibling connect attempt (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Upper bound on the sync handshake round trip (seconds).
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 10;

/// In-place retries for would-block / interrupted sends before the send is
/// reported as deferred.
pub const DEFAULT_TRANSIENT_SEND_RETRIES: u32 = 2;

/// Maximum queued cross-cluster envelopes per sibling.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

// ─── Registration Authority ─────────────────────────────────────────────────

/// Upper bound on a federation-info round trip to the authority (seconds).
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;

// ─── Wire ───────────────────────────────────────────────────────────────────

/// Maximum size of a single framed message (bytes). 8 MB.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Share of each frame kept free for the request header and the fields of a
/// `Sync` or `Deliver` that are not envelopes (bytes). 64 KB.
pub const DEFAULT_FRAME_HEADROOM: u32 = 64 * 1024;

/// Channel buffer size for membership change events.
pub const DEFAULT_MEMBERSHIP_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for envelopes received from siblings.
pub const DEFAULT_INBOX_CHANNEL_SIZE: usize = 1024;

// ─── Event Notifier ─────────────────────────────────────────────────────────

/// Notifications within this window of the previous one are suppressed
/// (seconds, 0 disables aggregation).
pub const DEFAULT_NOTIFY_AGGREGATION_SECS: u64 = 0;

/// After failing to open the notify socket, stay quiet this long (seconds).
pub const DEFAULT_NOTIFY_OPEN_FAILURE_BACKOFF_SECS: u64 = 600;

/// Write attempts per notification.
pub const DEFAULT_NOTIFY_RETRIES: u32 = 2;

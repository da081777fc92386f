/// Federation protocol and system constants.

/// Protocol version carried in every request header
pub const FED_PROTO_VER: u8 = 0x01;

/// Default listen port for a federation controller
pub const FED_CONTROLLER_PORT: u16 = 6817;
/// Default listen port for the registration authority
pub const FED_AUTHORITY_PORT: u16 = 6819;

/// Maximum cluster name length
pub const FED_MAX_CLUSTER_NAME_LEN: usize = 64;
/// Maximum federation name length
pub const FED_MAX_FED_NAME_LEN: usize = 64;
/// Maximum number of clusters in one federation
pub const FED_MAX_CLUSTERS: usize = 63;

/// Fixed wake-up payload written by the one-shot event notifier.
/// Only some of it has to reach the peer.
pub const FED_NOTIFY_PAYLOAD: &[u8] = b"1234\0";

/// File name of the persisted federation record inside the state directory.
pub const FED_STATE_FILE: &str = "fed_state";

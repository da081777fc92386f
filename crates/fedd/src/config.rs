//! Controller configuration and federation state persistence.
//!
//! Configuration is assembled from command-line flags and validated once
//! at startup; bad values are rejected, never coerced. The last federation
//! record fetched from the authority can be saved to disk so that a
//! restarting controller finds its siblings while the authority is down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fedmesh_core::notifier::NotifierConfig;
use fedmesh_proto::constants::{FED_AUTHORITY_PORT, FED_CONTROLLER_PORT, FED_MAX_CLUSTER_NAME_LEN, FED_STATE_FILE};
use fedmesh_proto::defaults::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_LIVENESS_INTERVAL_SECS, DEFAULT_OUTBOX_CAPACITY,
    DEFAULT_RETRY_COOLDOWN_SECS, DEFAULT_RPC_TIMEOUT_SECS, DEFAULT_SYNC_TIMEOUT_SECS,
    DEFAULT_TRANSIENT_SEND_RETRIES,
};
use fedmesh_proto::{FedError, FedRecord, FedResult};
use tokio::fs;
use tracing::{debug, error};

/// Validated controller configuration.
#[derive(Debug, Clone)]
pub struct FedConfig {
    /// Name of the local cluster; selects the "self" entry of the federation.
    pub cluster_name: String,
    pub bind_addr: String,
    pub port: u16,

    pub authority_host: String,
    pub authority_backup: Option<String>,
    pub authority_port: u16,

    pub liveness_interval: Duration,
    pub retry_cooldown: Duration,
    pub connect_timeout: Duration,
    pub sync_timeout: Duration,
    pub rpc_timeout: Duration,
    pub send_retries: u32,
    pub outbox_capacity: usize,

    pub state_dir: Option<PathBuf>,
    pub notify: NotifierConfig,
}

impl FedConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            bind_addr: "0.0.0.0".to_string(),
            port: FED_CONTROLLER_PORT,
            authority_host: "127.0.0.1".to_string(),
            authority_backup: None,
            authority_port: FED_AUTHORITY_PORT,
            liveness_interval: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS),
            retry_cooldown: Duration::from_secs(DEFAULT_RETRY_COOLDOWN_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            sync_timeout: Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            send_retries: DEFAULT_TRANSIENT_SEND_RETRIES,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            state_dir: None,
            notify: NotifierConfig::new("", 0),
        }
    }

    pub fn validate(&self) -> FedResult<()> {
        if self.cluster_name.is_empty() || self.cluster_name.len() > FED_MAX_CLUSTER_NAME_LEN {
            error!("invalid cluster name '{}'", self.cluster_name);
            return Err(FedError::InvalidParms);
        }
        if self.authority_host.is_empty() || self.authority_port == 0 {
            error!("registration authority address is not set");
            return Err(FedError::InvalidParms);
        }
        if self.outbox_capacity == 0 {
            error!("outbox capacity must be positive");
            return Err(FedError::InvalidParms);
        }
        for (what, d) in [
            ("liveness interval", self.liveness_interval),
            ("retry cool-down", self.retry_cooldown),
            ("connect timeout", self.connect_timeout),
            ("sync timeout", self.sync_timeout),
            ("rpc timeout", self.rpc_timeout),
        ] {
            if d.is_zero() {
                error!("{} must be positive", what);
                return Err(FedError::InvalidFrequency);
            }
        }
        Ok(())
    }

    /// Authority addresses in the order they should be tried.
    pub fn authority_addrs(&self) -> Vec<(String, u16)> {
        std::iter::once(&self.authority_host)
            .chain(self.authority_backup.iter())
            .map(|h| (h.clone(), self.authority_port))
            .collect()
    }

    /// Apply a `--freq` string on top of the current intervals.
    pub fn apply_freq(&mut self, list: &str) -> FedResult<()> {
        let freq = parse_freq(list)?;
        if let Some(s) = freq.liveness_secs {
            self.liveness_interval = Duration::from_secs(s);
        }
        if let Some(s) = freq.retry_secs {
            self.retry_cooldown = Duration::from_secs(s);
        }
        Ok(())
    }
}

/// Parsed `--freq` overrides.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Frequency {
    pub liveness_secs: Option<u64>,
    pub retry_secs: Option<u64>,
}

/// Parse `"liveness=N,retry=N"` (seconds, either key optional).
///
/// Unknown keys, missing `=`, non-numeric and zero values are rejected.
pub fn parse_freq(list: &str) -> FedResult<Frequency> {
    let mut freq = Frequency::default();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = item.split_once('=').ok_or(FedError::InvalidFrequency)?;
        let secs: u64 = value.trim().parse().map_err(|_| {
            error!("invalid frequency value '{}'", value);
            FedError::InvalidFrequency
        })?;
        if secs == 0 {
            error!("frequency '{}' must be positive", key);
            return Err(FedError::InvalidFrequency);
        }
        match key.trim() {
            "liveness" => freq.liveness_secs = Some(secs),
            "retry" => freq.retry_secs = Some(secs),
            other => {
                error!("unknown frequency key '{}'", other);
                return Err(FedError::InvalidFrequency);
            }
        }
    }
    Ok(freq)
}

fn state_path(dir: &Path) -> PathBuf {
    dir.join(FED_STATE_FILE)
}

/// Save the last fetched federation record (`None` when unfederated).
pub async fn save_fed_state(dir: &Path, record: Option<&FedRecord>) -> FedResult<()> {
    fs::create_dir_all(dir).await.map_err(|e| {
        error!("failed to create state dir {}: {}", dir.display(), e);
        FedError::LocalError
    })?;
    let path = state_path(dir);
    let data = bincode::serialize(&record).map_err(|_| FedError::LocalError)?;
    fs::write(&path, &data).await.map_err(|e| {
        error!("failed to write federation state to {}: {}", path.display(), e);
        FedError::LocalError
    })?;
    debug!("saved federation state to {}", path.display());
    Ok(())
}

/// Load the saved federation record. A missing file reads as `None`.
pub async fn load_fed_state(dir: &Path) -> FedResult<Option<FedRecord>> {
    let path = state_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(&path).await.map_err(|e| {
        error!("failed to read federation state from {}: {}", path.display(), e);
        FedError::LocalError
    })?;
    bincode::deserialize(&data).map_err(|_| {
        error!("corrupt federation state file: {}", path.display());
        FedError::LocalError
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedmesh_proto::federation::ClusterRecord;

    #[test]
    fn test_parse_freq() {
        assert_eq!(
            parse_freq("liveness=5, retry=120").unwrap(),
            Frequency {
                liveness_secs: Some(5),
                retry_secs: Some(120)
            }
        );
        assert_eq!(parse_freq("retry=9").unwrap().liveness_secs, None);
        assert_eq!(parse_freq("").unwrap(), Frequency::default());
    }

    #[test]
    fn test_parse_freq_rejects() {
        for bad in ["liveness=0", "liveness=x", "liveness", "bogus=3", "retry=-1"] {
            assert_eq!(parse_freq(bad), Err(FedError::InvalidFrequency), "{}", bad);
        }
    }

    #[test]
    fn test_validate() {
        let mut cfg = FedConfig::new("east");
        assert!(cfg.validate().is_ok());

        cfg.retry_cooldown = Duration::ZERO;
        assert_eq!(cfg.validate(), Err(FedError::InvalidFrequency));

        let cfg = FedConfig::new("");
        assert_eq!(cfg.validate(), Err(FedError::InvalidParms));
    }

    #[test]
    fn test_apply_freq() {
        let mut cfg = FedConfig::new("east");
        cfg.apply_freq("liveness=7").unwrap();
        assert_eq!(cfg.liveness_interval, Duration::from_secs(7));
        assert_eq!(cfg.retry_cooldown, Duration::from_secs(DEFAULT_RETRY_COOLDOWN_SECS));
        assert!(cfg.apply_freq("retry=0").is_err());
    }

    #[tokio::test]
    async fn test_fed_state_persistence() {
        let dir = std::env::temp_dir().join("fedd_test_fed_state");
        let _ = std::fs::remove_dir_all(&dir);

        assert_eq!(load_fed_state(&dir).await.unwrap(), None);

        let rec = FedRecord {
            name: "fedA".to_string(),
            clusters: vec![ClusterRecord {
                name: "east".to_string(),
                control_host: "10.0.0.1".to_string(),
                backup_host: String::new(),
                control_port: 6817,
                fed_id: 1,
                fed_state: "ACTIVE".to_string(),
                features: "gpu".to_string(),
            }],
        };
        save_fed_state(&dir, Some(&rec)).await.unwrap();
        assert_eq!(load_fed_state(&dir).await.unwrap(), Some(rec));

        save_fed_state(&dir, None).await.unwrap();
        assert_eq!(load_fed_state(&dir).await.unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

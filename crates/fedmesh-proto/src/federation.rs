/// Federation and member-cluster types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::constants::{FED_MAX_CLUSTERS, FED_MAX_CLUSTER_NAME_LEN, FED_MAX_FED_NAME_LEN};
use crate::error::{FedError, FedResult};

/// Federation state of a member cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FedState {
    Active,
    Inactive,
    /// Accepts no new federated work, still finishing existing work.
    Drain,
    /// Drained: no federated work left.
    Drained,
}

impl FedState {
    /// String code used by the registration authority and in displays.
    pub fn as_str(self) -> &'static str {
        match self {
            FedState::Active => "ACTIVE",
            FedState::Inactive => "INACTIVE",
            FedState::Drain => "DRAIN",
            FedState::Drained => "DRAINED",
        }
    }
}

impl fmt::Display for FedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FedState {
    type Err = FedError;

    fn from_str(s: &str) -> FedResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(FedState::Active),
            "INACTIVE" => Ok(FedState::Inactive),
            "DRAIN" => Ok(FedState::Drain),
            "DRAINED" => Ok(FedState::Drained),
            _ => Err(FedError::InvalidFedState),
        }
    }
}

/// Split a comma-joined capability string into a feature set.
pub fn parse_features(s: &str) -> BTreeSet<String> {
    s.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect()
}

/// Join a feature set back into its comma-joined form (lexically sorted).
pub fn features_str(features: &BTreeSet<String>) -> String {
    features.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Observed connection flags of a sibling, as published to readers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Outbound link to the sibling is established.
    pub send_connected: bool,
    /// The sibling has an established link to us.
    pub recv_connected: bool,
    /// A full sync handshake completed on the current outbound link.
    pub sync_recvd: bool,
}

/// One member of a federation, including the local cluster itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRec {
    pub name: String,
    /// Primary controller host; `None` when not yet registered.
    pub control_host: Option<String>,
    /// Backup controller host, tried only when the primary is unreachable.
    pub backup_host: Option<String>,
    pub control_port: u16,
    /// Federation-unique id, assigned by the registration authority.
    pub fed_id: u32,
    pub state: FedState,
    pub features: BTreeSet<String>,
    /// Connection flags; only present on siblings of a live registry snapshot.
    pub link: Option<LinkStatus>,
}

impl ClusterRec {
    pub fn new(name: impl Into<String>, fed_id: u32) -> Self {
        Self {
            name: name.into(),
            control_host: None,
            backup_host: None,
            control_port: 0,
            fed_id,
            state: FedState::Active,
            features: BTreeSet::new(),
            link: None,
        }
    }

    /// Builder-style helper to set the primary address.
    pub fn with_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.control_host = Some(host.into());
        self.control_port = port;
        self
    }

    /// Control addresses in the order they should be tried.
    pub fn control_addrs(&self) -> Vec<(String, u16)> {
        if self.control_port == 0 {
            return Vec::new();
        }
        self.control_host
            .iter()
            .chain(self.backup_host.iter())
            .map(|h| (h.clone(), self.control_port))
            .collect()
    }

    /// Whether both records point at the same controller endpoints.
    pub fn same_endpoints(&self, other: &ClusterRec) -> bool {
        self.control_host == other.control_host
            && self.backup_host == other.backup_host
            && self.control_port == other.control_port
    }
}

/// A named group of cooperating clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Federation {
    pub name: String,
    pub clusters: Vec<ClusterRec>,
}

impl Federation {
    /// Build a federation, rejecting duplicate names or federation ids.
    pub fn new(name: impl Into<String>, clusters: Vec<ClusterRec>) -> FedResult<Self> {
        let fed = Self {
            name: name.into(),
            clusters,
        };
        fed.validate()?;
        Ok(fed)
    }

    /// Check the federation name and the per-federation uniqueness invariants.
    pub fn validate(&self) -> FedResult<()> {
        if self.name.is_empty() || self.name.len() > FED_MAX_FED_NAME_LEN {
            return Err(FedError::InvalidParms);
        }
        if self.clusters.len() > FED_MAX_CLUSTERS {
            return Err(FedError::InvalidParms);
        }
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for c in &self.clusters {
            if c.name.is_empty() || c.name.len() > FED_MAX_CLUSTER_NAME_LEN || c.fed_id == 0 {
                return Err(FedError::InvalidParms);
            }
            if !names.insert(c.name.as_str()) {
                return Err(FedError::DuplicateCluster);
            }
            if !ids.insert(c.fed_id) {
                return Err(FedError::DuplicateFedId);
            }
        }
        Ok(())
    }

    /// A federation without members is the same as no federation.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterRec> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Per-sibling tuple published to the scheduler/job layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingView {
    pub name: String,
    pub host: Option<String>,
    pub port: u16,
    pub fed_id: u32,
    pub state: FedState,
    pub sync_recvd: bool,
}

/// Opaque cross-cluster message queued for a sibling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FedEnvelope {
    pub kind: String,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Registration authority wire form
// ---------------------------------------------------------------------------

/// Cluster entry as sent by the registration authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub name: String,
    /// Empty when unknown.
    pub control_host: String,
    /// Empty when there is no backup controller.
    pub backup_host: String,
    pub control_port: u16,
    pub fed_id: u32,
    /// One of `ACTIVE`, `INACTIVE`, `DRAIN`, `DRAINED`.
    pub fed_state: String,
    /// Comma-joined capability tags.
    pub features: String,
}

/// Federation record as sent by the registration authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FedRecord {
    pub name: String,
    pub clusters: Vec<ClusterRecord>,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl TryFrom<&ClusterRecord> for ClusterRec {
    type Error = FedError;

    fn try_from(r: &ClusterRecord) -> FedResult<Self> {
        Ok(ClusterRec {
            name: r.name.clone(),
            control_host: non_empty(&r.control_host),
            backup_host: non_empty(&r.backup_host),
            control_port: r.control_port,
            fed_id: r.fed_id,
            state: r.fed_state.parse()?,
            features: parse_features(&r.features),
            link: None,
        })
    }
}

impl From<&ClusterRec> for ClusterRecord {
    fn from(c: &ClusterRec) -> Self {
        ClusterRecord {
            name: c.name.clone(),
            control_host: c.control_host.clone().unwrap_or_default(),
            backup_host: c.backup_host.clone().unwrap_or_default(),
            control_port: c.control_port,
            fed_id: c.fed_id,
            fed_state: c.state.as_str().to_string(),
            features: features_str(&c.features),
        }
    }
}

impl FedRecord {
    /// Validate into a domain federation. `Ok(None)` for an empty federation.
    pub fn into_federation(self) -> FedResult<Option<Federation>> {
        if self.clusters.is_empty() {
            return Ok(None);
        }
        let clusters = self
            .clusters
            .iter()
            .map(ClusterRec::try_from)
            .collect::<FedResult<Vec<_>>>()?;
        Federation::new(self.name, clusters).map(Some)
    }
}

impl From<&Federation> for FedRecord {
    fn from(f: &Federation) -> Self {
        FedRecord {
            name: f.name.clone(),
            clusters: f.clusters.iter().map(ClusterRecord::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, id: u32, state: &str) -> ClusterRecord {
        ClusterRecord {
            name: name.to_string(),
            control_host: "10.0.0.1".to_string(),
            backup_host: String::new(),
            control_port: 6817,
            fed_id: id,
            fed_state: state.to_string(),
            features: "highmem, gpu,,".to_string(),
        }
    }

    #[test]
    fn test_fed_state_codes() {
        assert_eq!("active".parse::<FedState>().unwrap(), FedState::Active);
        assert_eq!("DRAINED".parse::<FedState>().unwrap(), FedState::Drained);
        assert_eq!("bogus".parse::<FedState>(), Err(FedError::InvalidFedState));
        assert_eq!(FedState::Drain.to_string(), "DRAIN");
    }

    #[test]
    fn test_features_sorted() {
        let f = parse_features("zeta,gpu, alpha ,");
        assert_eq!(features_str(&f), "alpha,gpu,zeta");
        assert!(parse_features("").is_empty());
    }

    #[test]
    fn test_record_into_federation() {
        let rec = FedRecord {
            name: "fedA".to_string(),
            clusters: vec![record("east", 1, "ACTIVE"), record("west", 2, "DRAIN")],
        };
        let fed = rec.into_federation().unwrap().unwrap();
        assert_eq!(fed.clusters.len(), 2);
        let west = fed.cluster("west").unwrap();
        assert_eq!(west.state, FedState::Drain);
        assert_eq!(west.backup_host, None);
        assert_eq!(features_str(&west.features), "gpu,highmem");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let rec = FedRecord {
            name: "fedA".to_string(),
            clusters: vec![record("east", 1, "ACTIVE"), record("west", 1, "ACTIVE")],
        };
        assert_eq!(rec.into_federation(), Err(FedError::DuplicateFedId));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let rec = FedRecord {
            name: "fedA".to_string(),
            clusters: vec![record("east", 1, "ACTIVE"), record("east", 2, "ACTIVE")],
        };
        assert_eq!(rec.into_federation(), Err(FedError::DuplicateCluster));
    }

    #[test]
    fn test_bad_state_rejected() {
        let rec = FedRecord {
            name: "fedA".to_string(),
            clusters: vec![record("east", 1, "SLEEPY")],
        };
        assert_eq!(rec.into_federation(), Err(FedError::InvalidFedState));
    }

    #[test]
    fn test_federation_name_checked() {
        for name in [String::new(), "f".repeat(FED_MAX_FED_NAME_LEN + 1)] {
            let rec = FedRecord {
                name,
                clusters: vec![record("east", 1, "ACTIVE")],
            };
            assert_eq!(rec.into_federation(), Err(FedError::InvalidParms));
        }
        let rec = FedRecord {
            name: "f".repeat(FED_MAX_FED_NAME_LEN),
            clusters: vec![record("east", 1, "ACTIVE")],
        };
        assert!(rec.into_federation().unwrap().is_some());
    }

    #[test]
    fn test_empty_record_is_no_federation() {
        let rec = FedRecord {
            name: "fedA".to_string(),
            clusters: Vec::new(),
        };
        assert_eq!(rec.into_federation(), Ok(None));
    }

    #[test]
    fn test_control_addrs_order() {
        let mut c = ClusterRec::new("east", 1).with_addr("primary", 6817);
        c.backup_host = Some("backup".to_string());
        assert_eq!(
            c.control_addrs(),
            vec![("primary".to_string(), 6817), ("backup".to_string(), 6817)]
        );
        c.control_port = 0;
        assert!(c.control_addrs().is_empty());
    }
}

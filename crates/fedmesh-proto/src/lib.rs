//! # fedmesh-proto
//!
//! Protocol types, constants, and data structures for the federation
//! substrate: the federation/cluster data model, the framed request and
//! response enums, and the error taxonomy shared by every component.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod federation;
pub mod request;

// Re-export commonly used types at the crate root
pub use error::{FedError, FedResult};
pub use federation::{
    ClusterRec, FedEnvelope, FedRecord, FedState, Federation, LinkStatus, SiblingView,
};
pub use request::{FedRequest, FedResponse, RequestHeader, ResponseResult};

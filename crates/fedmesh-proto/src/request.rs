/// Request and response types for the federation protocol.
///
/// Operators, sibling controllers and controllers querying the
/// registration authority all speak the same framed protocol. Sibling
/// traffic is mostly one-way; only `Sync` expects an answer.

use serde::{Deserialize, Serialize};

use crate::error::FedError;
use crate::federation::{FedEnvelope, FedRecord, FedState, Federation, SiblingView};

/// Common header for all requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Protocol version
    pub proto_ver: u8,
    /// Request ID (for matching responses)
    pub id: u32,
}

/// Operator, sibling and authority request types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FedRequest {
    // ---- Registration authority ----
    /// Current federation membership. The authority answers with the
    /// record form, a controller with its live snapshot.
    FedInfo,

    // ---- Operator / administrative ----
    ControllerInfo,
    Siblings,
    Reload,
    Suspend,
    Resume,

    // ---- Sibling controller traffic ----
    /// First frame on a sibling link; identifies the sender. No reply.
    Hello {
        cluster: String,
    },
    /// Liveness probe. No reply.
    Ping {
        cluster: String,
    },
    /// State reconciliation; answered with `ResponseResult::SyncAck`.
    Sync {
        cluster: String,
        epoch: u64,
        state: FedState,
        features: Vec<String>,
        messages: Vec<FedEnvelope>,
    },
    /// Queued envelopes flushed while the link is synced. No reply.
    Deliver {
        cluster: String,
        messages: Vec<FedEnvelope>,
    },
}

impl FedRequest {
    /// Requests the receiver must not answer.
    pub fn is_one_way(&self) -> bool {
        matches!(
            self,
            FedRequest::Hello { .. } | FedRequest::Ping { .. } | FedRequest::Deliver { .. }
        )
    }
}

/// Response from a federation operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FedResponse {
    /// Protocol version
    pub proto_ver: u8,
    /// Request ID this responds to
    pub id: u32,
    /// Response result
    pub result: ResponseResult,
}

/// Controller identity, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub cluster_name: String,
    /// Bumped on every registry reload.
    pub generation: u64,
    pub suspended: bool,
}

/// Response payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseResult {
    /// Success with no additional data
    Success,
    /// Plain status code; zero means success without data
    Rc(u32),
    /// Error
    Error(FedError),
    /// Federation record from the registration authority
    FedRecord(Option<FedRecord>),
    /// Live federation snapshot from a controller
    FedInfo(Option<Federation>),
    Controller(ControllerInfo),
    Siblings(Vec<SiblingView>),
    /// Answer to a sibling `Sync`: the responder's own state
    SyncAck {
        cluster: String,
        state: FedState,
        features: Vec<String>,
    },
}

impl FedResponse {
    /// Create a response with the given result.
    pub fn new(id: u32, result: ResponseResult) -> Self {
        Self {
            proto_ver: crate::constants::FED_PROTO_VER,
            id,
            result,
        }
    }

    /// Create an error response.
    pub fn error(id: u32, err: FedError) -> Self {
        Self::new(id, ResponseResult::Error(err))
    }

    /// Check if this response indicates success.
    pub fn is_success(&self) -> bool {
        match self.result {
            ResponseResult::Error(_) => false,
            ResponseResult::Rc(rc) => rc == 0,
            _ => true,
        }
    }
}

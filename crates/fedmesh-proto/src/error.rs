/// Federation error types.
///
/// Every error carries a stable numeric code so that a controller or the
/// registration authority can report it across the wire as a plain status.

use serde::{Deserialize, Serialize};

/// Unified error type for all federation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum FedError {
    #[error("unknown error")]
    Unknown,
    #[error("RPC to registration authority failed")]
    RpcFailed,
    #[error("unexpected response message")]
    UnexpectedResponse,
    #[error("local error")]
    LocalError,
    #[error("sibling connect failed")]
    ConnectFailed,
    #[error("sibling send failed")]
    SendFailed,
    #[error("invalid frequency")]
    InvalidFrequency,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("duplicate federation id")]
    DuplicateFedId,
    #[error("duplicate cluster name")]
    DuplicateCluster,
    #[error("invalid federation state")]
    InvalidFedState,
    #[error("cluster not found")]
    NotFound,
    #[error("no federation configured")]
    NoFederation,
    #[error("operation not supported")]
    NoSupport,
    #[error("controller is shutting down")]
    Shutdown,
    #[error("network error")]
    NetworkError,
    #[error("operation timed out")]
    Timeout,
}

impl FedError {
    /// Convert from a raw status code to FedError. Zero means success.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None,
            0x01 => Some(Self::Unknown),
            0x02 => Some(Self::RpcFailed),
            0x03 => Some(Self::UnexpectedResponse),
            0x04 => Some(Self::LocalError),
            0x05 => Some(Self::ConnectFailed),
            0x06 => Some(Self::SendFailed),
            0x07 => Some(Self::InvalidFrequency),
            0x08 => Some(Self::InvalidParms),
            0x09 => Some(Self::DuplicateFedId),
            0x0A => Some(Self::DuplicateCluster),
            0x0B => Some(Self::InvalidFedState),
            0x0C => Some(Self::NotFound),
            0x0D => Some(Self::NoFederation),
            0x0E => Some(Self::NoSupport),
            0x0F => Some(Self::Shutdown),
            0x10 => Some(Self::NetworkError),
            0x11 => Some(Self::Timeout),
            _ => Some(Self::Unknown),
        }
    }

    /// Convert to raw status code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::RpcFailed => 0x02,
            Self::UnexpectedResponse => 0x03,
            Self::LocalError => 0x04,
            Self::ConnectFailed => 0x05,
            Self::SendFailed => 0x06,
            Self::InvalidFrequency => 0x07,
            Self::InvalidParms => 0x08,
            Self::DuplicateFedId => 0x09,
            Self::DuplicateCluster => 0x0A,
            Self::InvalidFedState => 0x0B,
            Self::NotFound => 0x0C,
            Self::NoFederation => 0x0D,
            Self::NoSupport => 0x0E,
            Self::Shutdown => 0x0F,
            Self::NetworkError => 0x10,
            Self::Timeout => 0x11,
        }
    }
}

/// Result type alias for federation operations.
pub type FedResult<T> = Result<T, FedError>;

impl From<std::io::Error> for FedError {
    fn from(_: std::io::Error) -> Self {
        FedError::NetworkError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        let all = [
            FedError::Unknown,
            FedError::RpcFailed,
            FedError::UnexpectedResponse,
            FedError::LocalError,
            FedError::ConnectFailed,
            FedError::SendFailed,
            FedError::InvalidFrequency,
            FedError::InvalidParms,
            FedError::DuplicateFedId,
            FedError::DuplicateCluster,
            FedError::InvalidFedState,
            FedError::NotFound,
            FedError::NoFederation,
            FedError::NoSupport,
            FedError::Shutdown,
            FedError::NetworkError,
            FedError::Timeout,
        ];
        for e in all {
            assert_eq!(FedError::from_code(e.to_code()), Some(e));
        }
        assert_eq!(FedError::from_code(0), None);
        assert_eq!(FedError::from_code(0xFFFF), Some(FedError::Unknown));
    }
}

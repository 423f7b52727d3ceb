/// Flock error types.
///
/// Join-rejection reasons carry stable numeric codes (0x81-0x8B) so that a
/// rejecting senior and a candidate on a different build agree on the
/// meaning. Operational errors use the 0x01-0x1F range and never cross the
/// wire.

use serde::{Deserialize, Serialize};

/// Closed set of reasons a senior may reject a join request, in the order
/// the checks are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum RejectReason {
    #[error("protocol version mismatch")]
    Version,
    #[error("cluster name mismatch")]
    ClusterName,
    #[error("maximum packet size mismatch")]
    PacketSize,
    #[error("well-known-address mode mismatch")]
    Wka,
    #[error("license mode rejected")]
    License,
    #[error("edition mismatch")]
    Edition,
    #[error("operational mode mismatch")]
    Mode,
    #[error("cluster is full")]
    ClusterFull,
    #[error("senior is not authorized to admit members")]
    SeniorNotAuthorized,
    #[error("admission denied by quorum policy")]
    QuorumDenied,
    #[error("restart requested")]
    RestartRequested,
}

impl RejectReason {
    /// Convert to the wire code.
    pub fn to_code(self) -> u8 {
        match self {
            Self::Version => 0x81,
            Self::ClusterName => 0x82,
            Self::PacketSize => 0x83,
            Self::Wka => 0x84,
            Self::License => 0x85,
            Self::Edition => 0x86,
            Self::Mode => 0x87,
            Self::ClusterFull => 0x88,
            Self::SeniorNotAuthorized => 0x89,
            Self::QuorumDenied => 0x8A,
            Self::RestartRequested => 0x8B,
        }
    }

    /// Convert from a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x81 => Some(Self::Version),
            0x82 => Some(Self::ClusterName),
            0x83 => Some(Self::PacketSize),
            0x84 => Some(Self::Wka),
            0x85 => Some(Self::License),
            0x86 => Some(Self::Edition),
            0x87 => Some(Self::Mode),
            0x88 => Some(Self::ClusterFull),
            0x89 => Some(Self::SeniorNotAuthorized),
            0x8A => Some(Self::QuorumDenied),
            0x8B => Some(Self::RestartRequested),
            _ => None,
        }
    }

    /// A hard rejection terminates the candidate; a soft one restarts the
    /// join attempt from announce.
    pub fn is_hard(self) -> bool {
        !matches!(self, Self::QuorumDenied | Self::RestartRequested | Self::ClusterFull)
    }
}

/// Unified error type for all flock operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlockError {
    #[error("join rejected: {0}")]
    Rejected(RejectReason),
    #[error("join attempt timed out")]
    JoinTimeout,
    #[error("not a cluster member")]
    NotJoined,
    #[error("service is suspended")]
    ServiceSuspended,
    #[error("security token rejected")]
    TokenRejected,
    #[error("poll is closed")]
    PollClosed,
    #[error("member is shutting down")]
    ShuttingDown,
    #[error("protocol engine has terminated")]
    Terminated,
    #[error("network error")]
    Network,
    #[error("codec error: {0}")]
    Codec(String),
    #[error("frame exceeds maximum packet size")]
    FrameTooLarge,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for flock operations.
pub type FlockResult<T> = Result<T, FlockError>;

impl From<RejectReason> for FlockError {
    fn from(reason: RejectReason) -> Self {
        FlockError::Rejected(reason)
    }
}

impl From<std::io::Error> for FlockError {
    fn from(_: std::io::Error) -> Self {
        FlockError::Network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes_round_trip() {
        for reason in [
            RejectReason::Version,
            RejectReason::ClusterName,
            RejectReason::PacketSize,
            RejectReason::Wka,
            RejectReason::License,
            RejectReason::Edition,
            RejectReason::Mode,
            RejectReason::ClusterFull,
            RejectReason::SeniorNotAuthorized,
            RejectReason::QuorumDenied,
            RejectReason::RestartRequested,
        ] {
            assert_eq!(RejectReason::from_code(reason.to_code()), Some(reason));
        }
        assert_eq!(RejectReason::from_code(0x00), None);
    }

    #[test]
    fn soft_rejections() {
        assert!(!RejectReason::QuorumDenied.is_hard());
        assert!(!RejectReason::RestartRequested.is_hard());
        assert!(!RejectReason::ClusterFull.is_hard());
        assert!(RejectReason::Version.is_hard());
        assert!(RejectReason::ClusterName.is_hard());
    }
}

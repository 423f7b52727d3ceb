//! Events delivered from the membership engine to the hosting service
//! framework.

use flock_proto::error::RejectReason;
use flock_proto::member::{Member, MemberId};

/// Why the local member stopped participating in the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// Graceful departure after the leave grace period.
    Left,
    /// A kill directive from a senior was honored.
    Killed,
    /// The senior rejected our join with a hard reason.
    Rejected(RejectReason),
    /// Split-brain comparison showed we were silently expelled.
    Expelled,
    /// Our island lost the split-brain comparison.
    SplitBrainLoser,
    /// We conceded a slow-member priority arbitration.
    Conceded,
    /// Quorum control convicted the local member.
    SelfConvicted,
    /// Unrecoverable error during message processing.
    Fatal(String),
}

/// Notifications consumed by the hosting framework.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    MemberJoined(Member),
    MemberLeaving(MemberId),
    MemberLeft(Member),
    ServiceJoining { service_id: u16, member: MemberId },
    ServiceJoined { service_id: u16, member: MemberId },
    ServiceLeaving { service_id: u16, member: MemberId },
    ServiceLeft { service_id: u16, member: MemberId },
    /// Members currently selected for disconnection; consumed by the
    /// disconnection policy hook.
    MembersTimedOut(Vec<MemberId>),
    /// The local member stopped participating.
    SelfTerminated(HaltReason),
}

//! Injected capabilities: license/token validation and the disconnection
//! policy gate. The membership core never inspects these decisions, it
//! only honors them.

use std::collections::BTreeSet;

use flock_proto::member::MemberId;

/// License/edition validation, modeled as an opaque accept/reject
/// capability. The real validator lives outside the membership core.
pub trait LicenseValidator: Send + Sync {
    fn validate(&self, license_mode: u8) -> bool;
}

/// Security-token validation interposed between a service-join
/// notification and its response.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: Option<&[u8]>) -> bool;
}

/// Admission and disconnection policy consulted by quorum control.
pub trait DisconnectPolicy: Send + Sync {
    /// May a new member be admitted given the current live count?
    fn allow_join(&self, live: usize) -> bool;

    /// May the convicted set be disconnected right now?
    fn allow_disconnect(&self, convicted: &BTreeSet<MemberId>, live: usize) -> bool;
}

/// Accepts every license mode.
pub struct AcceptAllLicenses;

impl LicenseValidator for AcceptAllLicenses {
    fn validate(&self, _license_mode: u8) -> bool {
        true
    }
}

/// Accepts every token, including none.
pub struct AcceptAllTokens;

impl TokenValidator for AcceptAllTokens {
    fn validate(&self, _token: Option<&[u8]>) -> bool {
        true
    }
}

/// Default gate: never disconnect half or more of the cluster at once.
/// Suspicion that widespread is more likely a local partition than a mass
/// death, so it is routed through a roll-call instead.
pub struct MajorityPolicy;

impl DisconnectPolicy for MajorityPolicy {
    fn allow_join(&self, _live: usize) -> bool {
        true
    }

    fn allow_disconnect(&self, convicted: &BTreeSet<MemberId>, live: usize) -> bool {
        convicted.len() * 2 < live.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_policy_blocks_half_the_cluster() {
        let policy = MajorityPolicy;
        let one: BTreeSet<MemberId> = [2].into();
        let two: BTreeSet<MemberId> = [2, 3].into();
        assert!(policy.allow_disconnect(&one, 4));
        assert!(!policy.allow_disconnect(&two, 4));
        assert!(!policy.allow_disconnect(&one, 2));
    }
}

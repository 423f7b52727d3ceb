/// Logical sub-service membership types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::member::MemberId;

/// Lifecycle of one member inside one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServicePhase {
    /// Join notification is being flooded; peers may not act on it yet.
    Joining,
    Joined,
    Leaving,
}

/// Per-member state within a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMemberState {
    /// Senior-assigned join time, strictly increasing per service.
    pub join_time: u64,
    pub phase: ServicePhase,
    /// Service implementation version announced at join.
    pub version: u32,
}

/// A logical sub-service running atop the cluster. Created on first
/// announcement and never destroyed; a stale entry detected by identity
/// mismatch is recreated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: u16,
    pub name: String,
    pub service_type: String,
    /// Relative importance, used for slow-member arbitration.
    pub priority: u8,
    /// Suspended services reject new joins until resumed.
    pub suspended: bool,
    pub members: BTreeMap<MemberId, ServiceMemberState>,
}

impl ServiceInfo {
    pub fn new(id: u16, name: String, service_type: String, priority: u8) -> Self {
        Self {
            id,
            name,
            service_type,
            priority,
            suspended: false,
            members: BTreeMap::new(),
        }
    }

    /// Highest join time handed out so far, 0 if the service is empty.
    pub fn max_join_time(&self) -> u64 {
        self.members.values().map(|m| m.join_time).max().unwrap_or(0)
    }

    pub fn insert_member(&mut self, id: MemberId, state: ServiceMemberState) {
        self.members.insert(id, state);
    }

    pub fn remove_member(&mut self, id: MemberId) -> Option<ServiceMemberState> {
        self.members.remove(&id)
    }

    pub fn has_member(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service {} '{}' ({}, {} members)",
            self.id,
            self.name,
            self.service_type,
            self.members.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_time_is_strictly_monotonic_per_service() {
        let mut svc = ServiceInfo::new(1, "cache".into(), "partitioned".into(), 5);
        assert_eq!(svc.max_join_time(), 0);

        svc.insert_member(1, ServiceMemberState { join_time: 7, phase: ServicePhase::Joined, version: 1 });
        svc.insert_member(2, ServiceMemberState { join_time: 9, phase: ServicePhase::Joined, version: 1 });
        assert_eq!(svc.max_join_time(), 9);

        let next = svc.max_join_time() + 1;
        assert!(next > svc.max_join_time());
    }
}

//! Auxiliary low-latency liveness ring.
//!
//! Each member keeps dedicated connections to one or two "buddy" peers,
//! chosen in uid order while avoiding same-machine and same-role
//! collocation where the membership allows it. Loss of a buddy connection
//! is treated as near-instant death: the departure goes straight to the
//! registry with no quorum gate. The connections themselves live at the
//! transport boundary; the engine only consumes ring-down inputs.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use tracing::{info, warn};

use flock_proto::error::FlockResult;
use flock_proto::member::MemberId;

use crate::engine::{ClusterCore, JoinState, Work};
use crate::registry::Registry;

/// Pick the local member's ring buddies: the next one or two live peers in
/// uid order, preferring peers on another machine and with another role.
/// Falls back to plain successors when the membership is too uniform.
pub(crate) fn select_buddies(registry: &Registry, me: MemberId) -> Vec<MemberId> {
    let Some(local) = registry.get(me) else {
        return Vec::new();
    };
    let mut ordered: Vec<_> = registry.live_members().filter(|m| m.id != me).collect();
    if ordered.is_empty() {
        return Vec::new();
    }
    ordered.sort_by_key(|m| m.uid);

    // Rotate so the scan starts just past our own uid position.
    let start = ordered.iter().position(|m| m.uid > local.uid).unwrap_or(0);
    ordered.rotate_left(start);

    let want = ordered.len().min(2);
    let mut buddies: Vec<MemberId> = ordered
        .iter()
        .filter(|m| m.machine != local.machine && m.role != local.role)
        .take(want)
        .map(|m| m.id)
        .collect();
    if buddies.len() < want {
        for m in &ordered {
            if buddies.len() >= want {
                break;
            }
            if m.machine != local.machine && !buddies.contains(&m.id) {
                buddies.push(m.id);
            }
        }
    }
    if buddies.len() < want {
        for m in &ordered {
            if buddies.len() >= want {
                break;
            }
            if !buddies.contains(&m.id) {
                buddies.push(m.id);
            }
        }
    }
    buddies
}

impl ClusterCore {
    /// A ring connection dropped. If the address belongs to one of our
    /// buddies, the peer is dead right now — no witness, no quorum gate.
    pub(crate) async fn handle_ring_down(&mut self, addr: SocketAddr) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let Some(member) = self.registry.find_by_addr(addr) else {
            return Ok(());
        };
        let id = member.id;
        if !self.ring.contains(&id) {
            return Ok(());
        }
        if id == self.me() {
            warn!("ring reports our own address down; ignoring");
            return Ok(());
        }
        info!("ring buddy {} lost its connection; declaring it dead", id);
        self.work.push_back(Work::Depart { id, informed: BTreeSet::new(), fan_out: true });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_proto::member::MemberUid;
    use std::time::Duration;

    fn registry_with(members: &[(u64, u32, &str)]) -> (Registry, Vec<MemberId>) {
        let mut reg = Registry::new(Duration::from_secs(60));
        let mut ids = Vec::new();
        for (i, (born, machine, role)) in members.iter().enumerate() {
            let uid = MemberUid::new(*born, *machine, 1, 0);
            let addr = format!("10.0.0.{}:7300", i + 1).parse().unwrap();
            ids.push(
                reg.register(uid, addr, *machine, "p".into(), role.to_string()).unwrap(),
            );
        }
        (reg, ids)
    }

    #[test]
    fn buddies_avoid_same_machine_and_role() {
        let (reg, ids) = registry_with(&[
            (10, 1, "storage"),
            (20, 1, "storage"), // same machine and role as us
            (30, 2, "proxy"),
            (40, 3, "proxy"),
        ]);
        let buddies = select_buddies(&reg, ids[0]);
        assert_eq!(buddies.len(), 2);
        assert!(!buddies.contains(&ids[1]));
    }

    #[test]
    fn buddies_fall_back_when_membership_is_uniform() {
        let (reg, ids) = registry_with(&[(10, 1, "storage"), (20, 1, "storage")]);
        let buddies = select_buddies(&reg, ids[0]);
        // Nothing better exists than the collocated peer.
        assert_eq!(buddies, vec![ids[1]]);
    }

    #[test]
    fn lone_member_has_no_buddies() {
        let (reg, ids) = registry_with(&[(10, 1, "storage")]);
        assert!(select_buddies(&reg, ids[0]).is_empty());
    }
}

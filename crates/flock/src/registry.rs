//! Member registry: the authoritative in-memory member table with derived
//! senior lookup.
//!
//! Members live in a dense arena indexed by their small integer id, with a
//! bitmap tracking ids that are in use — either by a live member or by a
//! recently-dead record still inside the recycle-retention window. An id is
//! never simultaneously live and recycled, and a retained id is never
//! reissued. Every mutation of the live/dead partitioning goes through
//! `register` and `mark_departed`; there is no other write path.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bitvec::prelude::*;

use flock_proto::constants::MAX_MEMBERS;
use flock_proto::error::RejectReason;
use flock_proto::member::{Member, MemberId, MemberUid};

/// A recently-dead member retained to reject stale re-announcements and to
/// synchronize late joiners.
#[derive(Debug, Clone)]
pub struct Retired {
    pub id: MemberId,
    pub uid: MemberUid,
    pub addr: SocketAddr,
    pub died: Instant,
}

pub struct Registry {
    /// Dense member arena; slot index is the member id.
    slots: Vec<Option<Member>>,
    /// Ids in use by a live member or a retained dead record.
    in_use: BitVec<u8, Msb0>,
    /// Recycle set: recently-dead records by id.
    recycled: BTreeMap<MemberId, Retired>,
    retention: Duration,
}

impl Registry {
    pub fn new(retention: Duration) -> Self {
        Self {
            slots: (0..MAX_MEMBERS).map(|_| None).collect(),
            in_use: bitvec![u8, Msb0; 0; MAX_MEMBERS],
            recycled: BTreeMap::new(),
            retention,
        }
    }

    /// Single acceptance point: admit a new member and assign the lowest
    /// free id. Id 0 is reserved as "no member".
    pub fn register(
        &mut self,
        uid: MemberUid,
        addr: SocketAddr,
        machine: u32,
        process: String,
        role: String,
    ) -> Result<MemberId, RejectReason> {
        let id = match self.in_use[1..].first_zero() {
            Some(off) => (off + 1) as MemberId,
            None => return Err(RejectReason::ClusterFull),
        };
        let mut member = Member::new(id, uid, addr);
        member.machine = machine;
        member.process = process;
        member.role = role;
        info!("registered {}", member);
        self.in_use.set(id as usize, true);
        self.slots[id as usize] = Some(member);
        Ok(id)
    }

    /// Install a member learned from a snapshot or a join notification,
    /// keeping its already-assigned id.
    pub fn insert_existing(&mut self, member: Member) {
        let id = member.id as usize;
        if id == 0 || id >= MAX_MEMBERS {
            warn!("ignoring member with out-of-range id {}", member.id);
            return;
        }
        let retained = match self.recycled.get(&member.id) {
            Some(r) if r.uid == member.uid => {
                debug!("ignoring re-announcement of retired {}", member.uid);
                return;
            }
            Some(_) => true,
            None => false,
        };
        if retained {
            // A different uid may take over a retained id only via the
            // senior; trust the notification and drop the stale record.
            self.recycled.remove(&member.id);
        }
        self.in_use.set(id, true);
        self.slots[id] = Some(member);
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: MemberId) -> Option<&mut Member> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn by_uid(&self, uid: &MemberUid) -> Option<&Member> {
        self.live_members().find(|m| &m.uid == uid)
    }

    pub fn by_uid_mut(&mut self, uid: &MemberUid) -> Option<&mut Member> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut())
            .find(|m| &m.uid == uid && m.is_live())
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&Member> {
        self.live_members().find(|m| m.addr == addr)
    }

    pub fn live_members(&self) -> impl Iterator<Item = &Member> {
        self.slots.iter().filter_map(|s| s.as_ref()).filter(|m| m.is_live())
    }

    pub fn live_members_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.slots.iter_mut().filter_map(|s| s.as_mut()).filter(|m| m.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.live_members().count()
    }

    pub fn live_ids(&self) -> Vec<MemberId> {
        self.live_members().map(|m| m.id).collect()
    }

    pub fn live_ids_except(&self, me: MemberId) -> Vec<MemberId> {
        self.live_members().map(|m| m.id).filter(|id| *id != me).collect()
    }

    pub fn live_uids(&self) -> Vec<MemberUid> {
        self.live_members().map(|m| m.uid).collect()
    }

    /// Senior election is computed, not voted: the live member with the
    /// most senior (smallest) uid, recomputed on every lookup.
    pub fn senior(&self) -> Option<&Member> {
        self.live_members().min_by_key(|m| m.uid)
    }

    pub fn senior_id(&self) -> Option<MemberId> {
        self.senior().map(|m| m.id)
    }

    /// Retire a member into the recycle set. Returns the dead member and
    /// the fan-out list: live members (other than the departed) that are
    /// not already known to be informed, so the caller can close gaps for
    /// anyone who might have learned the death out of order.
    pub fn mark_departed(
        &mut self,
        id: MemberId,
        informed: &BTreeSet<MemberId>,
        now: Instant,
    ) -> Option<(Member, Vec<MemberId>)> {
        let slot = self.slots.get_mut(id as usize)?;
        let mut member = slot.take()?;
        member.dead = true;
        self.recycled.insert(id, Retired {
            id,
            uid: member.uid,
            addr: member.addr,
            died: now,
        });
        // The in_use bit stays set until the retention window expires.
        let fan_out = self
            .live_members()
            .map(|m| m.id)
            .filter(|mid| *mid != id && !informed.contains(mid))
            .collect();
        info!("departed {}", member);
        Some((member, fan_out))
    }

    /// True if the uid belongs to a retained dead record — traffic from it
    /// identifies a zombie.
    pub fn is_recycled_uid(&self, uid: &MemberUid) -> bool {
        self.recycled.values().any(|r| &r.uid == uid)
    }

    pub fn recycled_count(&self) -> usize {
        self.recycled.len()
    }

    /// Drop retained records whose retention window has expired, freeing
    /// their ids for reissue.
    pub fn sweep_recycled(&mut self, now: Instant) -> usize {
        let expired: Vec<MemberId> = self
            .recycled
            .values()
            .filter(|r| now.duration_since(r.died) >= self.retention)
            .map(|r| r.id)
            .collect();
        for id in &expired {
            self.recycled.remove(id);
            self.in_use.set(*id as usize, false);
            debug!("recycled id {} is free again", id);
        }
        expired.len()
    }

    /// Duplicate-address detection: a new announcement from an unrecognized
    /// uid at an address already bound to a live member implies the old
    /// member is dead. Returns the id to kill, if any.
    pub fn duplicate_at_addr(&self, uid: &MemberUid, addr: SocketAddr) -> Option<MemberId> {
        self.live_members()
            .find(|m| m.addr == addr && &m.uid != uid)
            .map(|m| m.id)
    }

    /// Full live snapshot for inducting a new member.
    pub fn snapshot(&self) -> Vec<Member> {
        self.live_members().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(born: u64) -> MemberUid {
        MemberUid::new(born, 1, 1, 0)
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn registry() -> Registry {
        Registry::new(Duration::from_secs(300))
    }

    #[test]
    fn ids_start_at_one_and_are_unique() {
        let mut reg = registry();
        let a = reg.register(uid(1), addr(1), 1, "p".into(), "r".into()).unwrap();
        let b = reg.register(uid(2), addr(2), 1, "p".into(), "r".into()).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_ne!(reg.get(a).unwrap().uid, reg.get(b).unwrap().uid);
    }

    #[test]
    fn senior_is_the_oldest_uid() {
        let mut reg = registry();
        reg.register(uid(50), addr(1), 1, "p".into(), "r".into()).unwrap();
        let elder = reg.register(uid(10), addr(2), 1, "p".into(), "r".into()).unwrap();
        reg.register(uid(90), addr(3), 1, "p".into(), "r".into()).unwrap();
        assert_eq!(reg.senior_id(), Some(elder));
    }

    #[tokio::test(start_paused = true)]
    async fn departed_id_is_not_reused_inside_retention() {
        let mut reg = Registry::new(Duration::from_secs(10));
        let a = reg.register(uid(1), addr(1), 1, "p".into(), "r".into()).unwrap();
        let now = Instant::now();
        let (dead, _) = reg.mark_departed(a, &BTreeSet::new(), now).unwrap();
        assert!(dead.dead);
        assert!(reg.get(a).is_none());
        assert!(reg.is_recycled_uid(&uid(1)));

        // Fresh registration must not take the retained id.
        let b = reg.register(uid(2), addr(2), 1, "p".into(), "r".into()).unwrap();
        assert_ne!(a, b);

        // After the retention window the id is free again.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reg.sweep_recycled(Instant::now()), 1);
        let c = reg.register(uid(3), addr(3), 1, "p".into(), "r".into()).unwrap();
        assert_eq!(c, a);
        assert!(!reg.is_recycled_uid(&uid(1)));
    }

    #[test]
    fn departure_fan_out_excludes_informed() {
        let mut reg = registry();
        let a = reg.register(uid(1), addr(1), 1, "p".into(), "r".into()).unwrap();
        let b = reg.register(uid(2), addr(2), 1, "p".into(), "r".into()).unwrap();
        let c = reg.register(uid(3), addr(3), 1, "p".into(), "r".into()).unwrap();

        let informed: BTreeSet<MemberId> = [b].into();
        let (_, fan_out) = reg.mark_departed(a, &informed, Instant::now()).unwrap();
        assert_eq!(fan_out, vec![c]);
    }

    #[test]
    fn duplicate_address_names_the_stale_member() {
        let mut reg = registry();
        let a = reg.register(uid(1), addr(1), 1, "p".into(), "r".into()).unwrap();
        assert_eq!(reg.duplicate_at_addr(&uid(9), addr(1)), Some(a));
        assert_eq!(reg.duplicate_at_addr(&uid(1), addr(1)), None);
        assert_eq!(reg.duplicate_at_addr(&uid(9), addr(2)), None);
    }

    #[test]
    fn senior_recomputed_after_departure() {
        let mut reg = registry();
        let elder = reg.register(uid(10), addr(1), 1, "p".into(), "r".into()).unwrap();
        let next = reg.register(uid(20), addr(2), 1, "p".into(), "r".into()).unwrap();
        assert_eq!(reg.senior_id(), Some(elder));
        reg.mark_departed(elder, &BTreeSet::new(), Instant::now()).unwrap();
        assert_eq!(reg.senior_id(), Some(next));
    }
}

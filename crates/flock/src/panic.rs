//! Split-brain detection and forced resolution.
//!
//! Two islands, each with a member believing itself senior, cannot coexist.
//! The deciding comparison is deterministic on both sides — larger island
//! wins, equal sizes go to the elder senior uid — so `resolve(A,B)` and
//! `resolve(B,A)` always name the same survivor. The losing senior and its
//! subordinates are told to terminate; a confirmed-dead member that keeps
//! transmitting is shunned as a zombie, and admission of new members is
//! suspended while any zombie record is active so nobody joins an
//! about-to-be-corrected split.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use flock_proto::error::FlockResult;
use flock_proto::member::{MemberId, MemberUid};
use flock_proto::message::DiscoveryMessage;

use crate::engine::{ClusterCore, Inbound, JoinState};
use crate::events::HaltReason;

/// Which island survives a split, given (size, senior uid) of each.
/// Deterministic and symmetric: `resolve(a, b)` names the same survivor as
/// `resolve(b, a)`.
pub(crate) fn surviving_island(
    a: (usize, MemberUid),
    b: (usize, MemberUid),
) -> MemberUid {
    match a.0.cmp(&b.0) {
        Ordering::Greater => a.1,
        Ordering::Less => b.1,
        Ordering::Equal => {
            // Equal size: the elder senior's island survives.
            if a.1 < b.1 {
                a.1
            } else {
                b.1
            }
        }
    }
}

impl ClusterCore {
    /// A senior heartbeat arrived. Either it is our senior's, or two
    /// seniors exist and the split must be resolved.
    pub(crate) async fn on_senior_heartbeat(
        &mut self,
        inbound: Inbound,
        _senior_id: MemberId,
        members: Vec<MemberUid>,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let sender = inbound.packet.header.sender;
        let our_senior = match self.registry.senior() {
            Some(s) => s.uid,
            None => return Ok(()),
        };
        if sender == our_senior {
            return Ok(());
        }
        if !self.is_senior() {
            // Subordinates leave the correction to their senior.
            debug!("foreign senior {} heard; our senior will resolve it", sender);
            return Ok(());
        }

        warn!("foreign senior {} with {} members; resolving split", sender, members.len());
        self.resolve_split(inbound, sender, members).await
    }

    async fn resolve_split(
        &mut self,
        inbound: Inbound,
        foreign_senior: MemberUid,
        their_members: Vec<MemberUid>,
    ) -> FlockResult<()> {
        let ours: BTreeSet<MemberUid> = self.registry.live_uids().into_iter().collect();
        let theirs: BTreeSet<MemberUid> = their_members.into_iter().collect();

        // Silent expulsion: their view heavily overlaps ours, yet neither
        // side recognizes the other. The cluster moved on without us.
        let we_know_them = self.registry.by_uid(&foreign_senior).map(|m| m.is_live()).unwrap_or(false);
        let they_know_us = theirs.contains(&self.uid);
        let overlap = ours.intersection(&theirs).count();
        if !we_know_them && !they_know_us && overlap * 2 >= ours.len().max(1) {
            warn!("we were silently expelled from the cluster; terminating");
            self.halt(HaltReason::Expelled);
            return Ok(());
        }

        let our_island = (ours.len(), self.uid);
        let their_island = (theirs.len(), foreign_senior);

        // A lone member folds immediately rather than contesting a larger
        // island; two singletons fall through to the uid comparison.
        if ours.len() == 1 && theirs.len() > 1 {
            info!("lone member against an island of {}; terminating", theirs.len());
            self.halt(HaltReason::SplitBrainLoser);
            return Ok(());
        }

        let survivor = surviving_island(our_island, their_island);
        if survivor == self.uid {
            info!("our island survives; killing foreign senior {}", foreign_senior);
            // Directed kill for the foreign senior, panic broadcast so both
            // islands' members learn which senior is being corrected.
            self.send_discovery_addr(inbound.from, DiscoveryMessage::Kill).await?;
            self.broadcast_discovery(&[], DiscoveryMessage::Panic { foreign_senior }).await?;
            // Expect continued transmissions from the loser for a while.
            self.zombies.insert(foreign_senior, Instant::now() + self.config.zombie_expiry);
        } else {
            warn!("our island loses the split-brain comparison; terminating");
            self.broadcast_discovery(&[], DiscoveryMessage::Panic { foreign_senior: self.uid })
                .await?;
            self.halt(HaltReason::SplitBrainLoser);
        }
        Ok(())
    }

    /// A panic notice. From our own senior it names a foreign senior to
    /// shun; from a foreign senior naming ours it means our island lost.
    pub(crate) async fn on_panic(
        &mut self,
        inbound: Inbound,
        foreign_senior: MemberUid,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let sender = inbound.packet.header.sender;
        let our_senior = match self.registry.senior() {
            Some(s) => s.uid,
            None => return Ok(()),
        };

        if foreign_senior == self.uid || foreign_senior == our_senior {
            let sender_is_ours =
                self.registry.by_uid(&sender).map(|m| m.is_live()).unwrap_or(false);
            if !sender_is_ours {
                warn!("panic from winning island names our senior; terminating");
                self.halt(HaltReason::SplitBrainLoser);
            }
            return Ok(());
        }

        if sender == our_senior {
            info!("senior orders shunning of {}", foreign_senior);
            self.zombies.insert(foreign_senior, Instant::now() + self.config.zombie_expiry);
            if let Some(m) = self.registry.by_uid_mut(&foreign_senior) {
                m.zombie = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(born: u64) -> MemberUid {
        MemberUid::new(born, 1, 1, 0)
    }

    #[test]
    fn larger_island_survives() {
        let a = (3, uid(50));
        let b = (2, uid(10));
        assert_eq!(surviving_island(a, b), uid(50));
        assert_eq!(surviving_island(b, a), uid(50));
    }

    #[test]
    fn equal_islands_go_to_the_elder_senior() {
        let a = (2, uid(10));
        let b = (2, uid(90));
        assert_eq!(surviving_island(a, b), uid(10));
        assert_eq!(surviving_island(b, a), uid(10));
    }

    #[test]
    fn two_singletons_leave_exactly_one_survivor_by_uid() {
        let elder = (1, uid(5));
        let younger = (1, uid(7));
        // Antisymmetric: both orderings name the elder.
        assert_eq!(surviving_island(elder, younger), uid(5));
        assert_eq!(surviving_island(younger, elder), uid(5));
        assert_ne!(surviving_island(elder, younger), uid(7));
    }
}

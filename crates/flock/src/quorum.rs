//! Quorum control: the gate between suspicion and disconnection.
//!
//! Failure detection convicts members; this module decides when conviction
//! becomes disconnection. An injectable policy is consulted on every
//! change. When the policy denies, a roll-call poll asks every other live
//! member to answer for itself, re-evaluated on each reply and re-issued on
//! a timer. A roll-call in which every convicted member answers is a full
//! recovery: the incident resets and a moratorium absorbs straggling
//! confirmations from the restored partition, so the same members are not
//! immediately re-convicted.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use flock_proto::error::FlockResult;
use flock_proto::member::MemberId;
use flock_proto::message::DirectedMessage;

use crate::engine::{ClusterCore, Inbound, JoinState, PollPurpose, Work};
use crate::events::{HaltReason, MembershipEvent};
use crate::poll::{Poll, PollOutcome};

/// Quorum bookkeeping owned by the actor.
pub struct QuorumState {
    /// Members selected for disconnection but not yet disconnected.
    pub convicted: BTreeSet<MemberId>,
    /// The local member is itself convicted.
    pub suicide: bool,
    /// Cluster time at which the current incident began.
    pub incident_start: Option<u64>,
    /// No new disconnections until this instant.
    pub moratorium_until: Option<Instant>,
    /// The outstanding roll-call, if any.
    pub rollcall_poll: Option<u64>,
    /// Members whose roll-call confirmation arrived recently; protected
    /// from re-conviction while the moratorium holds.
    recently_confirmed: BTreeMap<MemberId, Instant>,
}

impl QuorumState {
    pub fn new() -> Self {
        Self {
            convicted: BTreeSet::new(),
            suicide: false,
            incident_start: None,
            moratorium_until: None,
            rollcall_poll: None,
            recently_confirmed: BTreeMap::new(),
        }
    }

    pub fn incident_active(&self) -> bool {
        self.incident_start.is_some()
    }

    pub fn moratorium_active(&self, now: Instant) -> bool {
        self.moratorium_until.map(|t| t > now).unwrap_or(false)
    }

    pub fn record_confirmation(&mut self, member: MemberId, now: Instant) {
        self.recently_confirmed.insert(member, now);
    }

    /// A member's confirmation arrived within the moratorium window.
    pub fn confirmed_recently(&self, member: MemberId) -> bool {
        self.recently_confirmed.contains_key(&member)
    }

    pub fn member_departed(&mut self, member: MemberId) {
        if self.convicted.remove(&member) && self.convicted.is_empty() {
            debug!("last convicted member departed; incident over");
            self.incident_start = None;
            self.suicide = false;
        }
        self.recently_confirmed.remove(&member);
    }

    pub fn moratorium_elapsed(&mut self) {
        self.moratorium_until = None;
        self.recently_confirmed.clear();
    }

    pub fn sweep_confirmations(&mut self, now: Instant, window: Duration) {
        self.recently_confirmed.retain(|_, at| now.duration_since(*at) < window);
    }

    fn reset_incident(&mut self) {
        self.convicted.clear();
        self.suicide = false;
        self.incident_start = None;
        self.rollcall_poll = None;
    }
}

impl Default for QuorumState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterCore {
    /// A new conviction from failure detection (or the detector convicting
    /// itself). Consults the policy and either disconnects immediately or
    /// escalates to a roll-call.
    pub(crate) async fn do_convict(&mut self, id: MemberId) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let now = Instant::now();
        if self.quorum.moratorium_active(now) && self.quorum.confirmed_recently(id) {
            debug!("member {} confirmed within the moratorium; conviction suppressed", id);
            return Ok(());
        }
        if id != self.me() && self.registry.get(id).is_none() {
            return Ok(());
        }
        if !self.quorum.convicted.insert(id) {
            return self.do_reevaluate().await;
        }
        if id == self.me() {
            warn!("local member is convicted");
            self.quorum.suicide = true;
        }
        if self.quorum.incident_start.is_none() {
            self.quorum.incident_start = Some(self.cluster_millis());
        }
        self.emit(MembershipEvent::MembersTimedOut(
            self.quorum.convicted.iter().copied().collect(),
        ))
        .await;
        self.do_reevaluate().await
    }

    /// Re-run the policy gate; disconnect, or (re)issue the roll-call.
    pub(crate) async fn do_reevaluate(&mut self) -> FlockResult<()> {
        if self.quorum.convicted.is_empty() {
            return Ok(());
        }
        let live = self.registry.live_count();
        if self.policy.allow_disconnect(&self.quorum.convicted, live) {
            return self.disconnect_convicted().await;
        }
        if self.quorum.rollcall_poll.is_none() {
            self.issue_rollcall().await?;
        }
        Ok(())
    }

    async fn disconnect_convicted(&mut self) -> FlockResult<()> {
        if let Some(poll_id) = self.quorum.rollcall_poll.take() {
            self.polls.cancel(poll_id);
        }
        if self.quorum.suicide {
            warn!("policy allows disconnection and we are convicted; terminating");
            self.quorum.reset_incident();
            self.halt(HaltReason::SelfConvicted);
            return Ok(());
        }
        let victims: Vec<MemberId> = self.quorum.convicted.iter().copied().collect();
        info!("disconnecting convicted members {:?}", victims);
        for id in victims {
            // A parting shot in case the member is alive enough to hear it.
            self.broadcast_discovery(&[id], flock_proto::message::DiscoveryMessage::Kill)
                .await?;
            self.work.push_back(Work::Depart {
                id,
                informed: BTreeSet::new(),
                fan_out: true,
            });
        }
        self.quorum.reset_incident();
        Ok(())
    }

    async fn issue_rollcall(&mut self) -> FlockResult<()> {
        let me = self.me();
        let recipients: BTreeSet<MemberId> =
            self.registry.live_ids_except(me).into_iter().collect();
        if recipients.is_empty() {
            return Ok(());
        }
        let incident = self.quorum.incident_start.unwrap_or_else(|| self.cluster_millis());
        let expiry = Instant::now() + self.config.rollcall_reissue;
        let poll_id =
            self.polls.open("rollcall", recipients.clone(), Some(expiry), PollPurpose::RollCall);
        self.quorum.rollcall_poll = Some(poll_id);
        info!("roll-call {} for incident at {}ms ({} members)", poll_id, incident, recipients.len());
        for id in recipients {
            self.send_directed(id, DirectedMessage::RollCall { poll_id, incident_millis: incident })
                .await?;
        }
        self.timers.rollcall = Some(Instant::now() + self.config.rollcall_reissue);
        Ok(())
    }

    /// Roll-call re-issue timer: while convictions are outstanding and the
    /// policy still denies, keep asking.
    pub(crate) async fn rollcall_tick(&mut self) -> FlockResult<()> {
        if self.quorum.convicted.is_empty() {
            return Ok(());
        }
        let live = self.registry.live_count();
        if self.policy.allow_disconnect(&self.quorum.convicted, live) {
            return self.disconnect_convicted().await;
        }
        if let Some(poll_id) = self.quorum.rollcall_poll.take() {
            self.polls.cancel(poll_id);
        }
        self.issue_rollcall().await
    }

    /// Another member's roll-call: answer for ourselves.
    pub(crate) async fn on_roll_call(
        &mut self,
        inbound: Inbound,
        poll_id: u64,
        _incident_millis: u64,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let Some(caller) = self.registry.by_uid(&inbound.packet.header.sender).map(|m| m.id)
        else {
            return Ok(());
        };
        let me = self.me();
        self.send_directed(caller, DirectedMessage::Ack { poll_id, from: me }).await
    }

    /// The roll-call closed. Full recovery — every convicted member
    /// answered — resets the incident and arms the moratorium.
    pub(crate) async fn complete_roll_call(
        &mut self,
        poll: Poll,
        _outcome: PollOutcome,
    ) -> FlockResult<()> {
        if self.quorum.rollcall_poll == Some(poll.id) {
            self.quorum.rollcall_poll = None;
        }
        let all_recovered = self
            .quorum
            .convicted
            .iter()
            .all(|id| poll.has_response_from(*id));
        if all_recovered && !self.quorum.convicted.is_empty() && !self.quorum.suicide {
            info!(
                "roll-call shows full recovery of {:?}; arming moratorium",
                self.quorum.convicted
            );
            let now = Instant::now();
            for id in self.quorum.convicted.clone() {
                self.quorum.record_confirmation(id, now);
                if let Some(m) = self.registry.get_mut(id) {
                    m.deaf = false;
                    m.timed_out = false;
                    m.timeout_windows = 0;
                }
            }
            self.quorum.reset_incident();
            self.quorum.moratorium_until = Some(now + self.config.moratorium);
            self.timers.moratorium = Some(now + self.config.moratorium);
            self.timers.rollcall = None;
            return Ok(());
        }
        // Not recovered: policy gets another look; the re-issue timer keeps
        // the roll-call alive.
        self.do_reevaluate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn departure_clears_convictions_member_by_member() {
        let mut q = QuorumState::new();
        q.convicted.insert(2);
        q.convicted.insert(3);
        q.incident_start = Some(100);

        q.member_departed(2);
        assert!(q.incident_active());
        q.member_departed(3);
        assert!(!q.incident_active());
        assert!(q.convicted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn moratorium_window_tracks_confirmations() {
        let mut q = QuorumState::new();
        let now = Instant::now();
        q.record_confirmation(4, now);
        q.moratorium_until = Some(now + Duration::from_secs(5));

        assert!(q.moratorium_active(now));
        assert!(q.confirmed_recently(4));
        assert!(!q.confirmed_recently(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!q.moratorium_active(Instant::now()));
        q.moratorium_elapsed();
        assert!(!q.confirmed_recently(4));
    }
}

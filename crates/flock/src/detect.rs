//! Failure detection.
//!
//! Three independent signals feed suspicion: rotating directed heartbeats,
//! the liveness ring (see [`crate::ring`]), and delivery timeouts reported
//! by the transport. A suspect with fresh incoming traffic is "slow", not
//! dead: it is granted further timeout windows, and responsibility for a
//! confirmed-slow peer is settled by comparing the importance of the
//! services each side hosts — the less important side concedes. Ties go to
//! a witness poll: up to two third-party peers confirm or refute the
//! suspicion, and a detector that nobody backs turns the suspicion on
//! itself.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use flock_proto::error::FlockResult;
use flock_proto::member::MemberId;
use flock_proto::message::{DirectedMessage, DiscoveryMessage};

use crate::engine::{ClusterCore, Inbound, JoinState, PollPurpose, Work};
use crate::events::HaltReason;
use crate::poll::PollOutcome;
use crate::registry::Registry;
use crate::services::ServiceTable;

/// Heartbeat rotation state. Peers are visited in a shuffled order that is
/// rebuilt on membership change, so every peer is heartbeated within a
/// bounded multiple of the interval.
pub struct DetectState {
    order: Vec<MemberId>,
    cursor: usize,
    dirty: bool,
}

impl DetectState {
    pub fn new() -> Self {
        Self { order: Vec::new(), cursor: 0, dirty: true }
    }

    pub fn membership_changed(&mut self) {
        self.dirty = true;
    }

    /// Pick this round's heartbeat targets: `ceil(n / spread)` peers, in
    /// rotation, reshuffled each full cycle.
    pub fn next_round(&mut self, live: &[MemberId], spread: u32) -> Vec<MemberId> {
        if live.is_empty() {
            return Vec::new();
        }
        if self.dirty || self.order.len() != live.len() {
            self.order = live.to_vec();
            self.order.shuffle(&mut rand::thread_rng());
            self.cursor = 0;
            self.dirty = false;
        }
        let n = self.order.len();
        let k = (n + spread.max(1) as usize - 1) / spread.max(1) as usize;
        let mut round = Vec::with_capacity(k);
        for _ in 0..k {
            round.push(self.order[self.cursor % n]);
            self.cursor += 1;
        }
        if self.cursor >= n {
            self.order.shuffle(&mut rand::thread_rng());
            self.cursor = 0;
        }
        round
    }
}

impl Default for DetectState {
    fn default() -> Self {
        Self::new()
    }
}

/// Witness selection: live peers other than the detector and suspect, not
/// themselves suspect or slow, of equal-or-greater importance than the
/// suspect, preferring peers on a third machine.
pub(crate) fn select_witnesses(
    registry: &Registry,
    services: &ServiceTable,
    me: MemberId,
    suspect: MemberId,
    now_millis: u64,
    slow_tolerance_millis: u64,
    max: usize,
) -> Vec<MemberId> {
    let my_machine = registry.get(me).map(|m| m.machine);
    let suspect_machine = registry.get(suspect).map(|m| m.machine);
    let suspect_importance = services.member_priority(suspect);

    let mut eligible: Vec<&flock_proto::member::Member> = registry
        .live_members()
        .filter(|m| m.id != me && m.id != suspect)
        .filter(|m| !m.deaf && !m.timed_out)
        .filter(|m| m.last_slow == 0 || now_millis.saturating_sub(m.last_slow) > slow_tolerance_millis)
        .filter(|m| services.member_priority(m.id) >= suspect_importance)
        .collect();

    // Third-machine witnesses first, then by importance.
    eligible.sort_by_key(|m| {
        let third_machine =
            Some(m.machine) != my_machine && Some(m.machine) != suspect_machine;
        (!third_machine, std::cmp::Reverse(services.member_priority(m.id)), m.id)
    });
    eligible.into_iter().take(max).map(|m| m.id).collect()
}

impl ClusterCore {
    /// Heartbeat-timer tick: directed heartbeats to this round's subset,
    /// plus the senior's member-set broadcast.
    pub(crate) async fn heartbeat_tick(&mut self) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let me = self.me();
        let others = self.registry.live_ids_except(me);
        let round = self.detect.next_round(&others, self.config.heartbeat_spread);
        let sent_millis = self.now_millis();
        for peer in round {
            self.send_directed(peer, DirectedMessage::MemberHeartbeat { from: me, sent_millis })
                .await?;
        }
        if self.is_senior() && !others.is_empty() {
            let members = self.registry.live_uids();
            self.broadcast_discovery(
                &[],
                DiscoveryMessage::SeniorHeartbeat { senior_id: me, members },
            )
            .await?;
        }
        self.timers.heartbeat = Some(Instant::now() + self.config.heartbeat_interval);
        Ok(())
    }

    pub(crate) fn on_member_heartbeat(&mut self, from: MemberId, _sent_millis: u64) {
        trace!("heartbeat from member {}", from);
        // Liveness bookkeeping already happened on packet receipt.
    }

    /// The transport gave up on a directed packet.
    pub(crate) async fn handle_delivery_timeout(&mut self, addr: SocketAddr) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let now = self.now_millis();
        let slow_tolerance = self.config.slow_tolerance.as_millis() as u64;
        let (suspect, escalate) = {
            let Some(m) = self.registry.find_by_addr(addr) else {
                return Ok(());
            };
            let id = m.id;
            let fresh = now.saturating_sub(m.last_incoming) <= slow_tolerance;
            let m = self.registry.get_mut(id).expect("member exists");
            m.last_timeout = now;
            m.timed_out = true;
            if fresh {
                m.last_slow = now;
                m.timeout_windows += 1;
                if m.timeout_windows <= self.config.slow_confirm_windows {
                    info!(
                        "member {} is slow, not dead ({} of {} windows)",
                        id, m.timeout_windows, self.config.slow_confirm_windows
                    );
                    (id, false)
                } else {
                    (id, true)
                }
            } else {
                (id, true)
            }
        };
        if !escalate {
            return Ok(());
        }
        self.arbitrate_suspect(suspect).await
    }

    /// Decide who is responsible for a confirmed suspicion. A slow peer's
    /// fate is settled by service importance; ties and silent peers go to
    /// witnesses.
    async fn arbitrate_suspect(&mut self, suspect: MemberId) -> FlockResult<()> {
        let now = self.now_millis();
        let slow_tolerance = self.config.slow_tolerance.as_millis() as u64;
        let suspect_is_slow = self
            .registry
            .get(suspect)
            .map(|m| now.saturating_sub(m.last_incoming) <= slow_tolerance)
            .unwrap_or(false);

        if suspect_is_slow {
            let mine = self.services.member_priority(self.me());
            let theirs = self.services.member_priority(suspect);
            if mine > theirs {
                info!("slow member {} is less important; selecting for disconnect", suspect);
                self.work.push_back(Work::Convict { id: suspect });
                return Ok(());
            }
            if mine < theirs {
                warn!("slow member {} outranks us; conceding", suspect);
                self.halt(HaltReason::Conceded);
                return Ok(());
            }
            // fall through to witnesses on a tie
        }
        self.start_witness_poll(suspect).await
    }

    async fn start_witness_poll(&mut self, suspect: MemberId) -> FlockResult<()> {
        let now = self.now_millis();
        let witnesses = select_witnesses(
            &self.registry,
            &self.services,
            self.me(),
            suspect,
            now,
            self.config.slow_tolerance.as_millis() as u64,
            self.config.witness_count,
        );
        if witnesses.is_empty() {
            warn!("no eligible witnesses for {}; suspecting ourselves instead", suspect);
            let me = self.me();
            self.work.push_back(Work::Convict { id: me });
            return Ok(());
        }

        if let Some(m) = self.registry.get_mut(suspect) {
            m.deaf = true;
            m.last_heuristic_death = now;
        }
        let recipients: BTreeSet<MemberId> = witnesses.iter().copied().collect();
        let expiry = Instant::now() + self.config.delivery_timeout;
        let poll_id = self.polls.open(
            "witness",
            recipients,
            Some(expiry),
            PollPurpose::Witness { suspect },
        );
        debug!("asking witnesses {:?} about member {}", witnesses, suspect);
        for w in witnesses {
            self.send_directed(w, DirectedMessage::WitnessRequest { poll_id, suspect }).await?;
        }
        Ok(())
    }

    /// Another member asks: can you reach this suspect?
    pub(crate) async fn on_witness_request(
        &mut self,
        inbound: Inbound,
        poll_id: u64,
        suspect: MemberId,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let now = self.now_millis();
        let delivery = self.config.delivery_timeout.as_millis() as u64;
        let confirmed_dead = match self.registry.get(suspect) {
            None => true,
            Some(m) => !m.is_live() || now.saturating_sub(m.last_incoming) > delivery,
        };
        let Some(detector) = self.registry.by_uid(&inbound.packet.header.sender).map(|m| m.id)
        else {
            return Ok(());
        };
        self.send_directed(
            detector,
            DirectedMessage::WitnessReply { poll_id, suspect, confirmed_dead },
        )
        .await
    }

    /// Witness verdicts. A single affirmative closes the poll early and
    /// escalates; the decision is not reversed by late replies.
    pub(crate) fn on_witness_reply(
        &mut self,
        inbound: Inbound,
        poll_id: u64,
        _suspect: MemberId,
        confirmed_dead: bool,
    ) {
        let Some(witness) = self.registry.by_uid(&inbound.packet.header.sender).map(|m| m.id)
        else {
            return;
        };
        if confirmed_dead {
            if let Some((poll, purpose, outcome)) = self.polls.close_early(poll_id, Some(witness))
            {
                self.work.push_back(Work::PollDone { poll, purpose, outcome });
            }
        } else if let Some((poll, purpose, outcome)) = self.polls.respond(poll_id, witness) {
            self.work.push_back(Work::PollDone { poll, purpose, outcome });
        }
    }

    pub(crate) async fn complete_witness(
        &mut self,
        poll: crate::poll::Poll,
        suspect: MemberId,
        outcome: PollOutcome,
    ) -> FlockResult<()> {
        match outcome {
            PollOutcome::EarlyClosed => {
                info!("witness confirmed member {} unreachable", suspect);
                self.work.push_back(Work::Convict { id: suspect });
            }
            PollOutcome::AllResponded => {
                // Full rejection: every witness reaches the suspect, so the
                // problem is on our side.
                warn!(
                    "witnesses {:?} all reach member {}; suspecting ourselves",
                    poll.responded, suspect
                );
                if let Some(m) = self.registry.get_mut(suspect) {
                    m.deaf = false;
                    m.timed_out = false;
                    m.timeout_windows = 0;
                }
                let me = self.me();
                self.work.push_back(Work::Convict { id: me });
            }
            PollOutcome::Expired | PollOutcome::Abandoned => {
                warn!("witnesses unavailable for member {}; suspecting ourselves", suspect);
                if let Some(m) = self.registry.get_mut(suspect) {
                    m.deaf = false;
                }
                let me = self.me();
                self.work.push_back(Work::Convict { id: me });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_covers_all_peers_within_spread_rounds() {
        let mut state = DetectState::new();
        let live: Vec<MemberId> = vec![2, 3, 4, 5, 6, 7];
        let spread = 3;

        let mut seen: BTreeSet<MemberId> = BTreeSet::new();
        for _ in 0..spread {
            for id in state.next_round(&live, spread) {
                seen.insert(id);
            }
        }
        assert_eq!(seen, live.iter().copied().collect());
    }

    #[test]
    fn rotation_rebuilds_on_membership_change() {
        let mut state = DetectState::new();
        let live: Vec<MemberId> = vec![2, 3, 4];
        state.next_round(&live, 3);

        let grown: Vec<MemberId> = vec![2, 3, 4, 5];
        let round = state.next_round(&grown, 1);
        assert_eq!(round.len(), 4);
    }

    #[test]
    fn round_size_is_ceil_of_n_over_spread() {
        let mut state = DetectState::new();
        let live: Vec<MemberId> = vec![2, 3, 4, 5, 6];
        assert_eq!(state.next_round(&live, 3).len(), 2);
        assert_eq!(state.next_round(&live, 1).len(), 5);
    }
}

//! Join state machine: `Announce → Joining → Joined → Leaving → Left`.
//!
//! A candidate announces its presence on the broadcast medium with an
//! increasing attempt counter. If a senior answers, the candidate derives a
//! time adjustment and requests a member id; otherwise, once the attempt
//! limit is reached and the candidate can prove its broadcasts are
//! self-audible, it holds an authorized address, and it owns the cluster
//! port, it forms a brand-new cluster as its sole (and senior) member.
//!
//! The senior validates a join request in a fixed order — protocol version,
//! cluster name, packet size, WKA mode, license, edition, mode, admission
//! policy — and rejects with the first failing reason. A "wait" reply from
//! any non-senior resets the candidate's attempt counter so that no
//! candidate forms a second cluster during senior failover.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use flock_proto::error::{FlockResult, RejectReason};
use flock_proto::member::{Member, MemberId, MemberUid};
use flock_proto::message::{DirectedMessage, DiscoveryMessage};
use flock_proto::service::ServiceInfo;

use crate::engine::{
    AnnounceState, ClusterCore, Inbound, JoinState, JoiningState, PollPurpose, Work,
};
use crate::events::{HaltReason, MembershipEvent};
use crate::poll::PollOutcome;

impl ClusterCore {
    // ── candidate side ─────────────────────────────────────────────────

    /// Announce-timer tick: broadcast presence or, at the attempt limit,
    /// try to self-elect.
    pub(crate) async fn announce_tick(&mut self) -> FlockResult<()> {
        let (attempt, self_heard, mut bound) = match &self.state {
            JoinState::Announce(st) => (st.attempt, st.self_heard, st.bound),
            _ => return Ok(()),
        };
        let limit = self.config.attempt_limit();
        let threshold = self.config.bind_check_threshold();

        // The bind check is only consulted late in the attempt run; two
        // candidates racing to form a cluster serialize on the port.
        if attempt >= threshold && !bound {
            bound = self.transport.bind_cluster_port(&self.config.cluster).await;
            if let JoinState::Announce(st) = &mut self.state {
                st.bound = bound;
            }
            if bound {
                debug!("holding the cluster port for '{}'", self.config.cluster);
            }
        }

        if attempt >= limit {
            if self_heard && bound && self.config.addr_authorized() {
                return self.form_new_cluster().await;
            }
            debug!(
                "attempt limit reached but cannot self-elect \
                 (self_heard={self_heard}, bound={bound}, authorized={})",
                self.config.addr_authorized()
            );
        }

        let next_attempt = (attempt + 1).min(limit);
        if let JoinState::Announce(st) = &mut self.state {
            st.attempt = next_attempt;
        }
        let msg = DiscoveryMessage::Announce {
            cluster: self.config.cluster.clone(),
            addr: self.config.addr,
            machine: self.config.machine,
            role: self.config.role.clone(),
            attempt: next_attempt,
            sent_millis: self.now_millis(),
        };
        self.broadcast_discovery(&[], msg).await?;
        self.timers.announce = Some(Instant::now() + self.config.announce_interval);
        Ok(())
    }

    /// No senior exists: become the sole member of a brand-new cluster.
    async fn form_new_cluster(&mut self) -> FlockResult<()> {
        let id = self
            .registry
            .register(
                self.uid,
                self.config.addr,
                self.config.machine,
                self.config.process.clone(),
                self.config.role.clone(),
            )
            .map_err(|r| flock_proto::error::FlockError::Rejected(r))?;
        self.local_id = Some(id);
        self.state = JoinState::Joined;
        self.timers.announce = None;
        self.timers.heartbeat = Some(Instant::now() + self.config.heartbeat_interval);
        self.refresh_derived();
        info!("formed new cluster '{}' as member {}", self.config.cluster, id);
        if let Some(me) = self.registry.get(id).cloned() {
            self.emit(MembershipEvent::MemberJoined(me)).await;
        }
        Ok(())
    }

    /// A senior answered our announce: derive the time adjustment and move
    /// to Joining if the sample's round trip is inside the variance bound.
    pub(crate) async fn on_announce_reply(
        &mut self,
        inbound: Inbound,
        _senior_id: MemberId,
        echo_millis: u64,
        senior_millis: u64,
    ) -> FlockResult<()> {
        let rtt_bound = match &self.state {
            JoinState::Announce(st) => st.rtt_bound,
            _ => return Ok(()),
        };
        let now = self.now_millis();
        let rtt = now.saturating_sub(echo_millis);
        if rtt > rtt_bound.as_millis() as u64 {
            // Widen the bound so a consistently slow path still converges.
            let widened = rtt_bound * self.config.rtt_variance_growth;
            if let JoinState::Announce(st) = &mut self.state {
                st.rtt_bound = widened;
            }
            debug!("time adjustment sample rejected (rtt {rtt}ms), bound now {:?}", widened);
            return Ok(());
        }

        self.time_adjust = senior_millis as i64 + (rtt / 2) as i64 - now as i64;
        info!(
            "senior at {} answered; time adjustment {}ms, requesting id",
            inbound.from, self.time_adjust
        );
        // A cluster exists; stop blocking anyone from forming a new one.
        self.transport.release_cluster_port(&self.config.cluster).await;
        self.state = JoinState::Joining(JoiningState {
            senior_addr: inbound.from,
            assigned: None,
            welcome_poll: None,
        });
        self.timers.announce = None;
        self.timers.joining = Some(Instant::now() + self.config.delivery_timeout);

        let msg = DiscoveryMessage::RequestId {
            cluster: self.config.cluster.clone(),
            addr: self.config.addr,
            machine: self.config.machine,
            process: self.config.process.clone(),
            role: self.config.role.clone(),
            max_packet: self.config.max_packet_size,
            wka_mode: self.config.wka_mode(),
            license_mode: self.config.license_mode,
            edition: self.config.edition.clone(),
            mode: self.config.mode.clone(),
            sent_millis: self.now_millis(),
        };
        self.send_discovery_addr(inbound.from, msg).await
    }

    /// A wait reply from a non-senior peer: the cluster is mid-transition.
    /// Resetting the attempt counter (instead of counting a rejection)
    /// prevents premature cluster formation during senior failover.
    pub(crate) fn on_wait_reply(&mut self) {
        match &mut self.state {
            JoinState::Announce(st) => {
                debug!("cluster mid-transition; resetting announce attempts");
                st.attempt = 0;
                st.bound = false;
            }
            JoinState::Joining(_) => {
                debug!("join deferred; returning to announce");
                self.restart_announce();
            }
            _ => {}
        }
    }

    /// Restart the join protocol from a clean announce state.
    pub(crate) fn restart_announce(&mut self) {
        self.state = JoinState::Announce(AnnounceState {
            attempt: 0,
            self_heard: false,
            bound: false,
            rtt_bound: self.config.rtt_variance,
        });
        self.timers.joining = None;
        self.timers.announce = Some(Instant::now() + self.config.announce_interval);
    }

    pub(crate) async fn on_request_id_reply(
        &mut self,
        _inbound: Inbound,
        id: MemberId,
        _senior_id: MemberId,
    ) -> FlockResult<()> {
        if let JoinState::Joining(st) = &mut self.state {
            info!("assigned member id {}", id);
            st.assigned = Some(id);
            // Take the id right away so the induct and welcome frames
            // addressed to it are ours.
            self.local_id = Some(id);
            self.timers.joining = Some(Instant::now() + self.config.delivery_timeout);
        }
        Ok(())
    }

    pub(crate) async fn on_request_id_reject(&mut self, code: u8) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Announce(_) | JoinState::Joining(_)) {
            return Ok(());
        }
        let reason = RejectReason::from_code(code).unwrap_or(RejectReason::RestartRequested);
        if reason.is_hard() {
            warn!("join rejected: {}", reason);
            self.halt(HaltReason::Rejected(reason));
        } else {
            info!("join softly rejected ({}); restarting announce", reason);
            self.restart_announce();
        }
        Ok(())
    }

    /// The membership/service snapshot from the senior. Joined is only
    /// reached after the welcome handshake with every other live member.
    pub(crate) async fn on_induct(
        &mut self,
        _inbound: Inbound,
        members: Vec<Member>,
        services: Vec<ServiceInfo>,
    ) -> FlockResult<()> {
        let assigned = match &self.state {
            JoinState::Joining(st) => st.assigned,
            _ => return Ok(()),
        };
        for member in members {
            self.registry.insert_existing(member);
        }
        self.services.install_snapshot(services);

        let me = match self.registry.by_uid(&self.uid) {
            Some(m) => m.id,
            None => {
                warn!("induct snapshot does not contain us; restarting join");
                self.restart_announce();
                return Ok(());
            }
        };
        if let Some(assigned) = assigned {
            if assigned != me {
                warn!("snapshot id {} disagrees with assigned {}", me, assigned);
            }
        }
        self.local_id = Some(me);
        self.refresh_derived();

        let others: BTreeSet<MemberId> = self.registry.live_ids_except(me).into_iter().collect();
        if others.is_empty() {
            return self.complete_join().await;
        }
        let expiry = Instant::now() + self.config.delivery_timeout;
        let poll_id = self.polls.open("welcome", others.clone(), Some(expiry), PollPurpose::Welcome);
        if let JoinState::Joining(st) = &mut self.state {
            st.welcome_poll = Some(poll_id);
        }
        for other in others {
            self.send_directed(other, DirectedMessage::Welcome { poll_id, from: me }).await?;
        }
        self.timers.joining = None;
        Ok(())
    }

    pub(crate) async fn complete_welcome(&mut self, outcome: PollOutcome) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joining(_)) {
            return Ok(());
        }
        match outcome {
            PollOutcome::AllResponded | PollOutcome::Abandoned => self.complete_join().await,
            PollOutcome::Expired | PollOutcome::EarlyClosed => {
                warn!("welcome handshake incomplete; restarting join");
                self.restart_announce();
                Ok(())
            }
        }
    }

    async fn complete_join(&mut self) -> FlockResult<()> {
        self.state = JoinState::Joined;
        self.timers.joining = None;
        self.timers.heartbeat = Some(Instant::now() + self.config.heartbeat_interval);
        let senior = self.registry.senior_id();
        info!(
            "joined cluster '{}' as member {} (senior {:?}, {} members)",
            self.config.cluster,
            self.me(),
            senior,
            self.registry.live_count()
        );
        if let Some(me) = self.registry.get(self.me()).cloned() {
            self.emit(MembershipEvent::MemberJoined(me)).await;
        }
        Ok(())
    }

    /// No answer to our id request within the delivery timeout.
    pub(crate) async fn joining_timeout(&mut self) -> FlockResult<()> {
        if matches!(self.state, JoinState::Joining(_)) {
            warn!("join attempt timed out; restarting announce");
            self.restart_announce();
        }
        Ok(())
    }

    // ── senior / established side ──────────────────────────────────────

    pub(crate) async fn on_announce(
        &mut self,
        inbound: Inbound,
        cluster: String,
        addr: SocketAddr,
        _machine: u32,
        _role: String,
        _attempt: u32,
        sent_millis: u64,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        if cluster != self.config.cluster {
            // Another cluster sharing the medium; name mismatches are
            // rejected at request-id time, announces are simply not ours.
            return Ok(());
        }

        if !self.is_senior() {
            // Mid-transition: if our senior looks gone, hold the candidate
            // off instead of letting it form a second cluster.
            let senior_suspect = self
                .registry
                .senior()
                .map(|s| s.deaf || s.timed_out)
                .unwrap_or(true);
            if senior_suspect {
                self.send_discovery_addr(addr, DiscoveryMessage::AnnounceWait).await?;
            }
            return Ok(());
        }

        if self.admission_suspended() {
            self.send_discovery_addr(addr, DiscoveryMessage::AnnounceWait).await?;
            return Ok(());
        }

        // Duplicate-address detection: an unknown uid announcing from an
        // address bound to a live member means the old member is dead.
        if let Some(stale) = self.registry.duplicate_at_addr(&inbound.packet.header.sender, addr) {
            warn!("address {} re-announced by a new identity; killing member {}", addr, stale);
            self.work.push_back(Work::Depart {
                id: stale,
                informed: BTreeSet::new(),
                fan_out: true,
            });
        }

        let reply = DiscoveryMessage::AnnounceReply {
            senior_id: self.me(),
            echo_millis: sent_millis,
            senior_millis: self.cluster_millis(),
        };
        self.send_discovery_addr(addr, reply).await
    }

    pub(crate) async fn on_request_id(
        &mut self,
        inbound: Inbound,
        msg: DiscoveryMessage,
    ) -> FlockResult<()> {
        let DiscoveryMessage::RequestId {
            ref cluster,
            addr,
            machine,
            ref process,
            ref role,
            max_packet,
            wka_mode,
            license_mode,
            ref edition,
            ref mode,
            sent_millis,
        } = msg
        else {
            return Ok(());
        };

        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        if !self.is_senior() {
            return self.send_discovery_addr(addr, DiscoveryMessage::RequestIdWait).await;
        }
        if self.admission_suspended() {
            return self.send_discovery_addr(addr, DiscoveryMessage::RequestIdWait).await;
        }
        // Admission of new cluster members is deferred while a
        // service-join notification poll is outstanding.
        if !self.service_polls.is_empty() {
            debug!("deferring join from {} behind service-join poll", addr);
            self.pending_joins.insert(sent_millis, inbound);
            return Ok(());
        }

        // Validation order is fixed; the first mismatch names the reason.
        let reject = if inbound.packet.header.proto_ver != self.config.proto_ver {
            Some(RejectReason::Version)
        } else if *cluster != self.config.cluster {
            Some(RejectReason::ClusterName)
        } else if max_packet != self.config.max_packet_size {
            Some(RejectReason::PacketSize)
        } else if wka_mode != self.config.wka_mode() {
            Some(RejectReason::Wka)
        } else if !self.license.validate(license_mode) {
            Some(RejectReason::License)
        } else if *edition != self.config.edition {
            Some(RejectReason::Edition)
        } else if *mode != self.config.mode {
            Some(RejectReason::Mode)
        } else if self.quorum.incident_active() || !self.policy.allow_join(self.registry.live_count())
        {
            Some(RejectReason::QuorumDenied)
        } else {
            None
        };
        if let Some(reason) = reject {
            info!("rejecting join from {}: {}", addr, reason);
            return self
                .send_discovery_addr(
                    addr,
                    DiscoveryMessage::RequestIdReject { code: reason.to_code() },
                )
                .await;
        }

        let sender = inbound.packet.header.sender;
        let id = match self.registry.register(
            sender,
            addr,
            machine,
            process.clone(),
            role.clone(),
        ) {
            Ok(id) => id,
            Err(reason) => {
                return self
                    .send_discovery_addr(
                        addr,
                        DiscoveryMessage::RequestIdReject { code: reason.to_code() },
                    )
                    .await;
            }
        };
        self.refresh_derived();

        // Flood the join to every established member before answering the
        // candidate.
        let Some(joined) = self.registry.get(id).cloned() else {
            return Ok(());
        };
        for other in self.registry.live_ids_except(self.me()) {
            if other == id {
                continue;
            }
            self.send_directed(other, DirectedMessage::MemberJoined { member: joined.clone() })
                .await?;
        }

        self.send_discovery_addr(
            addr,
            DiscoveryMessage::RequestIdReply { id, senior_id: self.me() },
        )
        .await?;
        self.send_directed(
            id,
            DirectedMessage::Induct {
                members: self.registry.snapshot(),
                services: self.services.snapshot(),
            },
        )
        .await?;
        self.emit(MembershipEvent::MemberJoined(joined)).await;
        Ok(())
    }

    /// Answer a welcome handshake from a newly inducted member.
    pub(crate) async fn on_welcome(&mut self, poll_id: u64, from: MemberId) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        self.send_directed(from, DirectedMessage::Ack { poll_id, from: self.me() }).await
    }

    pub(crate) async fn on_member_joined(&mut self, member: Member) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        info!("{} joined the cluster", member);
        self.registry.insert_existing(member.clone());
        self.refresh_derived();
        self.emit(MembershipEvent::MemberJoined(member)).await;
        Ok(())
    }

    // ── departure ──────────────────────────────────────────────────────

    pub(crate) async fn on_member_leaving(&mut self, id: MemberId) {
        let known = match self.registry.get_mut(id) {
            Some(m) => {
                m.leaving = true;
                true
            }
            None => false,
        };
        if known {
            self.emit(MembershipEvent::MemberLeaving(id)).await;
        }
    }

    pub(crate) fn on_member_left(&mut self, id: MemberId, uid: MemberUid) {
        match self.registry.get(id) {
            Some(m) if m.uid == uid => {
                // The sender already informed us; apply without re-fanning.
                self.work.push_back(Work::Depart {
                    id,
                    informed: BTreeSet::new(),
                    fan_out: false,
                });
            }
            Some(_) => debug!("stale departure record for id {} ignored", id),
            None => {}
        }
    }

    pub(crate) async fn begin_leaving(&mut self, reply: tokio::sync::oneshot::Sender<()>) {
        if !matches!(self.state, JoinState::Joined) {
            self.halt(HaltReason::Left);
            let _ = reply.send(());
            return;
        }
        info!("leaving cluster '{}'", self.config.cluster);
        self.state = JoinState::Leaving;
        self.leave_reply = Some(reply);
        let me = self.me();
        for other in self.registry.live_ids_except(me) {
            let _ = self.send_directed(other, DirectedMessage::MemberLeaving { id: me }).await;
        }
        // Grace delay lets the intent reach peers before the record lands.
        self.timers.leave_grace = Some(Instant::now() + self.config.leave_grace);
    }

    pub(crate) async fn finish_leaving(&mut self) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Leaving) {
            return Ok(());
        }
        let me = self.me();
        for other in self.registry.live_ids_except(me) {
            self.send_directed(other, DirectedMessage::MemberLeft { id: me, uid: self.uid })
                .await?;
        }
        self.state = JoinState::Left;
        self.halt(HaltReason::Left);
        Ok(())
    }

    /// A directed kill from a senior is honored without negotiation.
    pub(crate) async fn on_kill(&mut self, inbound: Inbound) -> FlockResult<()> {
        warn!("kill directive from {}", inbound.packet.header.sender);
        self.halt(HaltReason::Killed);
        Ok(())
    }
}

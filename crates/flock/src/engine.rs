//! Single-actor protocol engine.
//!
//! One tokio task owns all protocol state: join state machine, member
//! registry, poll table, quorum bookkeeping. Everything else — the
//! transport's receive path, the ring monitor, API callers — only enqueues
//! [`Input`]s, which the actor processes strictly in arrival order. Protocol
//! timers are not threads: every pending deadline is computed as a "next
//! wake" instant and the actor sleeps until the minimum of them.
//!
//! Handlers never call back into each other recursively. Follow-up effects
//! (a departure completing a poll whose completion convicts a member, ...)
//! are pushed onto a work queue drained after every input, so the state
//! machine advances one well-ordered step at a time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use flock_proto::defaults::{DEFAULT_ENGINE_QUEUE_SIZE, DEFAULT_EVENT_CHANNEL_SIZE};
use flock_proto::error::{FlockError, FlockResult, RejectReason};
use flock_proto::member::{MemberId, MemberUid};
use flock_proto::message::{
    encode_frame, DirectedMessage, DiscoveryMessage, Packet, Payload,
};

use crate::config::ClusterConfig;
use crate::events::{HaltReason, MembershipEvent};
use crate::policy::{
    AcceptAllLicenses, AcceptAllTokens, DisconnectPolicy, LicenseValidator, MajorityPolicy,
    TokenValidator,
};
use crate::poll::{Poll, PollOutcome, PollTable};
use crate::registry::Registry;
use crate::services::ServiceTable;
use crate::transport::{Destination, LoopbackMesh, Transport};

/// A received frame plus the transport-level source address, which is the
/// only way to answer a candidate that has no member id yet.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub packet: Packet,
    pub from: SocketAddr,
}

/// Everything that can reach the actor.
#[derive(Debug)]
pub enum Input {
    Packet(Inbound),
    /// The transport gave up on a directed packet to this address.
    DeliveryTimeout { addr: SocketAddr },
    /// The liveness ring lost its connection to this address.
    RingDown { addr: SocketAddr },
    Api(ApiRequest),
    Shutdown,
}

/// Blocking application calls, resolved by the actor via oneshot.
#[derive(Debug)]
pub enum ApiRequest {
    JoinService {
        name: String,
        service_type: String,
        priority: u8,
        version: u32,
        token: Option<Vec<u8>>,
        reply: oneshot::Sender<FlockResult<u16>>,
    },
    LeaveService {
        service_id: u16,
        reply: oneshot::Sender<FlockResult<()>>,
    },
    Status { reply: oneshot::Sender<StatusReport> },
    Leave { reply: oneshot::Sender<()> },
}

/// Point-in-time status snapshot.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: &'static str,
    pub id: Option<MemberId>,
    pub uid: MemberUid,
    pub senior: Option<MemberId>,
    pub live_members: usize,
    pub convicted: usize,
    pub services: usize,
}

/// Pending API reply slots, keyed by the poll id carried on the wire.
pub(crate) enum ApiWaiter {
    ServiceJoin {
        reply: oneshot::Sender<FlockResult<u16>>,
        name: String,
        service_type: String,
        priority: u8,
        version: u32,
    },
    ServiceLeave(oneshot::Sender<FlockResult<()>>),
}

/// Where a senior sends the answer once a service-join poll completes.
#[derive(Debug)]
pub(crate) enum ServiceReplyTo {
    /// The requester is this member; resolve its API reply directly.
    Local { reply: oneshot::Sender<FlockResult<u16>> },
    /// The requester is a peer; echo its request poll id.
    Remote { addr: SocketAddr, request_poll: u64, member: MemberId },
}

/// Completion dispatch for the generic poll, one variant per use.
#[derive(Debug)]
pub(crate) enum PollPurpose {
    /// Welcome handshake gating the candidate's transition to Joined.
    Welcome,
    /// Witness confirmation for a suspect.
    Witness { suspect: MemberId },
    /// Quorum roll-call.
    RollCall,
    /// Service-join notification flood; answer the requester on close.
    ServiceJoinNotify {
        service_id: u16,
        name: String,
        service_type: String,
        priority: u8,
        member: MemberId,
        join_time: u64,
        version: u32,
        reply_to: ServiceReplyTo,
    },
    /// Requester-side guard for an outstanding service request.
    ApiPending,
}

/// Deferred follow-up effects, drained after every input.
pub(crate) enum Work {
    PollDone { poll: Poll, purpose: PollPurpose, outcome: PollOutcome },
    Depart { id: MemberId, informed: BTreeSet<MemberId>, fan_out: bool },
    Convict { id: MemberId },
    /// Re-run the quorum policy evaluation without a new conviction.
    Reevaluate,
}

/// Join state machine; `Left` is terminal.
#[derive(Debug)]
pub(crate) enum JoinState {
    Announce(AnnounceState),
    Joining(JoiningState),
    Joined,
    Leaving,
    Left,
}

impl JoinState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Announce(_) => "announce",
            Self::Joining(_) => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
            Self::Left => "left",
        }
    }
}

#[derive(Debug)]
pub(crate) struct AnnounceState {
    pub attempt: u32,
    /// Our own broadcasts came back to us.
    pub self_heard: bool,
    /// We hold the cluster port (checked only late in the attempt run).
    pub bound: bool,
    /// Current round-trip acceptance bound, widened on rejection.
    pub rtt_bound: Duration,
}

#[derive(Debug)]
pub(crate) struct JoiningState {
    pub senior_addr: SocketAddr,
    pub assigned: Option<MemberId>,
    pub welcome_poll: Option<u64>,
}

/// All pending protocol deadlines. The actor's wait is the minimum.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    pub announce: Option<Instant>,
    pub joining: Option<Instant>,
    pub heartbeat: Option<Instant>,
    pub rollcall: Option<Instant>,
    pub moratorium: Option<Instant>,
    pub housekeeping: Option<Instant>,
    pub leave_grace: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [
            self.announce,
            self.joining,
            self.heartbeat,
            self.rollcall,
            self.moratorium,
            self.housekeeping,
            self.leave_grace,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Pop a timer if its deadline has passed.
pub(crate) fn due(slot: &mut Option<Instant>, now: Instant) -> bool {
    if slot.map(|t| t <= now).unwrap_or(false) {
        *slot = None;
        true
    } else {
        false
    }
}

/// Protocol state, owned exclusively by the actor task.
pub struct ClusterCore {
    pub(crate) config: ClusterConfig,
    pub(crate) uid: MemberUid,
    pub(crate) local_id: Option<MemberId>,
    pub(crate) state: JoinState,
    /// Offset from local safe time to the senior's clock.
    pub(crate) time_adjust: i64,

    pub(crate) registry: Registry,
    pub(crate) services: ServiceTable,
    pub(crate) polls: PollTable<PollPurpose>,
    pub(crate) quorum: crate::quorum::QuorumState,
    pub(crate) detect: crate::detect::DetectState,
    pub(crate) ring: Vec<MemberId>,

    /// Confirmed-dead uids still transmitting, with record expiry.
    pub(crate) zombies: BTreeMap<MemberUid, Instant>,
    /// Cluster-join requests deferred while a service-join poll is
    /// outstanding, keyed by request timestamp.
    pub(crate) pending_joins: BTreeMap<u64, Inbound>,
    /// Outstanding service-join notification polls.
    pub(crate) service_polls: BTreeSet<u64>,
    pub(crate) api_waiters: BTreeMap<u64, ApiWaiter>,
    pub(crate) leave_reply: Option<oneshot::Sender<()>>,

    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: mpsc::Sender<MembershipEvent>,
    pub(crate) license: Arc<dyn LicenseValidator>,
    pub(crate) tokens: Arc<dyn TokenValidator>,
    pub(crate) policy: Arc<dyn DisconnectPolicy>,

    /// Broadcast-over-unicast address set, shared with status readers.
    /// The only state guarded by a lock; everything else is single-writer.
    pub(crate) broadcast_addrs: Arc<StdMutex<BTreeSet<SocketAddr>>>,

    pub(crate) timers: Timers,
    pub(crate) work: VecDeque<Work>,
    pub(crate) halted: Option<HaltReason>,
}

impl ClusterCore {
    // ── clock ──────────────────────────────────────────────────────────

    pub(crate) fn now_millis(&self) -> u64 {
        self.transport.current_safe_time()
    }

    /// Local safe time shifted onto the senior's clock.
    pub(crate) fn cluster_millis(&self) -> u64 {
        let now = self.now_millis() as i64 + self.time_adjust;
        now.max(0) as u64
    }

    // ── identity helpers ───────────────────────────────────────────────

    pub(crate) fn me(&self) -> MemberId {
        self.local_id.unwrap_or(0)
    }

    pub(crate) fn is_senior(&self) -> bool {
        match (self.local_id, self.registry.senior_id()) {
            (Some(me), Some(senior)) => me == senior,
            _ => false,
        }
    }

    // ── outbound ───────────────────────────────────────────────────────

    fn frame(&self, targets: &[MemberId], payload: &Payload) -> FlockResult<Vec<u8>> {
        let frame = encode_frame(self.config.proto_ver, self.uid, targets, payload)?;
        if frame.len() > self.config.max_packet_size as usize {
            return Err(FlockError::FrameTooLarge);
        }
        Ok(frame)
    }

    /// Broadcast a discovery message: true multicast, or the simulated
    /// broadcast-over-unicast address set in WKA mode.
    pub(crate) async fn broadcast_discovery(
        &mut self,
        targets: &[MemberId],
        msg: DiscoveryMessage,
    ) -> FlockResult<()> {
        let frame = self.frame(targets, &Payload::Discovery(msg))?;
        if self.config.wka_mode() {
            let addrs: Vec<SocketAddr> = {
                let set = self.broadcast_addrs.lock().expect("broadcast addrs lock");
                set.iter().copied().collect()
            };
            for addr in addrs {
                self.transport.post(Destination::Unicast(addr), frame.clone()).await?;
            }
        } else {
            self.transport.post(Destination::Broadcast, frame).await?;
        }
        Ok(())
    }

    /// Unicast a discovery message to a candidate that has no id yet.
    pub(crate) async fn send_discovery_addr(
        &self,
        addr: SocketAddr,
        msg: DiscoveryMessage,
    ) -> FlockResult<()> {
        let frame = self.frame(&[], &Payload::Discovery(msg))?;
        self.transport.post(Destination::Unicast(addr), frame).await
    }

    /// Directed delivery to a registered member; records the outgoing
    /// timestamp feeding failure detection.
    pub(crate) async fn send_directed(
        &mut self,
        to: MemberId,
        msg: DirectedMessage,
    ) -> FlockResult<()> {
        let now = self.now_millis();
        let addr = match self.registry.get_mut(to) {
            Some(m) => {
                m.last_outgoing = now;
                m.addr
            }
            None => {
                trace!("directed {} to unknown member {}", msg.type_id(), to);
                return Ok(());
            }
        };
        let frame = self.frame(&[to], &Payload::Directed(msg))?;
        self.transport.post(Destination::Unicast(addr), frame).await
    }

    pub(crate) async fn send_directed_addr(
        &self,
        addr: SocketAddr,
        to: MemberId,
        msg: DirectedMessage,
    ) -> FlockResult<()> {
        let frame = self.frame(&[to], &Payload::Directed(msg))?;
        self.transport.post(Destination::Unicast(addr), frame).await
    }

    pub(crate) async fn emit(&self, event: MembershipEvent) {
        let _ = self.events.send(event).await;
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    pub(crate) fn halt(&mut self, reason: HaltReason) {
        if self.halted.is_none() {
            warn!("halting: {:?}", reason);
            self.halted = Some(reason);
        }
    }

    /// Refresh derived views after any registry mutation: the shared
    /// broadcast address set and the ring buddy selection.
    pub(crate) fn refresh_derived(&mut self) {
        let mut addrs: BTreeSet<SocketAddr> = self.config.wka.iter().copied().collect();
        addrs.insert(self.config.addr);
        addrs.extend(self.registry.live_members().map(|m| m.addr));
        *self.broadcast_addrs.lock().expect("broadcast addrs lock") = addrs;

        self.ring = crate::ring::select_buddies(&self.registry, self.me());
        self.detect.membership_changed();
    }

    /// Admission is suspended while any zombie record is active.
    pub(crate) fn admission_suspended(&self) -> bool {
        !self.zombies.is_empty()
    }

    // ── input dispatch ─────────────────────────────────────────────────

    pub(crate) async fn handle_input(&mut self, input: Input) {
        let result = match input {
            Input::Packet(inbound) => self.handle_packet(inbound).await,
            Input::DeliveryTimeout { addr } => self.handle_delivery_timeout(addr).await,
            Input::RingDown { addr } => self.handle_ring_down(addr).await,
            Input::Api(req) => self.handle_api(req).await,
            Input::Shutdown => {
                self.halt(HaltReason::Left);
                Ok(())
            }
        };
        match result {
            Ok(()) => self.drain_work().await,
            Err(e) => {
                // Only unrecoverable errors bubble this far; they end the
                // local member's protocol participation.
                error!("unrecoverable error processing input: {}", e);
                self.halt(HaltReason::Fatal(e.to_string()));
            }
        }
    }

    async fn handle_packet(&mut self, inbound: Inbound) -> FlockResult<()> {
        let sender = inbound.packet.header.sender;

        if sender == self.uid {
            self.handle_own_echo(&inbound);
            return Ok(());
        }

        // Zombies are shunned, never re-processed.
        if self.zombies.contains_key(&sender) {
            trace!("shunning zombie {}", sender);
            return Ok(());
        }
        if self.registry.is_recycled_uid(&sender) {
            warn!("confirmed-dead {} is still transmitting; shunning as zombie", sender);
            self.zombies.insert(sender, Instant::now() + self.config.zombie_expiry);
            if let Some(m) = self.registry.by_uid_mut(&sender) {
                m.zombie = true;
            }
            return Ok(());
        }

        if !inbound.packet.header.addressed_to(self.me()) {
            return Ok(());
        }

        // Any attributable traffic is a liveness signal.
        let now = self.now_millis();
        if let Some(m) = self.registry.by_uid_mut(&sender) {
            m.touch_incoming(now);
        }

        if inbound.packet.read_error {
            return self.handle_read_error(inbound).await;
        }

        let payload = match inbound.packet.payload.clone() {
            Some(p) => p,
            None => return Ok(()),
        };
        match payload {
            Payload::Discovery(msg) => self.handle_discovery(inbound, msg).await,
            Payload::Directed(msg) => self.handle_directed(inbound, msg).await,
        }
    }

    fn handle_own_echo(&mut self, inbound: &Inbound) {
        // Hearing our own announce echoed back proves the broadcast
        // medium works for us, a self-election precondition.
        if let JoinState::Announce(ref mut st) = self.state {
            if inbound.packet.header.type_id == 1 {
                if !st.self_heard {
                    debug!("own announce is audible");
                }
                st.self_heard = true;
            }
        }
    }

    /// A record that failed to deserialize is still applied: the only
    /// meaningful application is reporting a version mismatch back to a
    /// joining sender, which is exactly the case that must not hang.
    async fn handle_read_error(&mut self, inbound: Inbound) -> FlockResult<()> {
        let header = &inbound.packet.header;
        warn!(
            "read error on type {} (proto {}) from {}",
            header.type_id, header.proto_ver, header.sender
        );
        let is_join_attempt = header.is_discovery() && matches!(header.type_id, 1 | 5);
        if is_join_attempt && self.is_senior() {
            self.send_discovery_addr(
                inbound.from,
                DiscoveryMessage::RequestIdReject { code: RejectReason::Version.to_code() },
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_discovery(
        &mut self,
        inbound: Inbound,
        msg: DiscoveryMessage,
    ) -> FlockResult<()> {
        match msg {
            DiscoveryMessage::Announce { cluster, addr, machine, role, attempt, sent_millis } => {
                self.on_announce(inbound, cluster, addr, machine, role, attempt, sent_millis)
                    .await
            }
            DiscoveryMessage::AnnounceReply { senior_id, echo_millis, senior_millis } => {
                self.on_announce_reply(inbound, senior_id, echo_millis, senior_millis).await
            }
            DiscoveryMessage::AnnounceWait | DiscoveryMessage::RequestIdWait => {
                self.on_wait_reply();
                Ok(())
            }
            DiscoveryMessage::SeniorHeartbeat { senior_id, members } => {
                self.on_senior_heartbeat(inbound, senior_id, members).await
            }
            DiscoveryMessage::RequestId { .. } => self.on_request_id(inbound, msg).await,
            DiscoveryMessage::RequestIdReply { id, senior_id } => {
                self.on_request_id_reply(inbound, id, senior_id).await
            }
            DiscoveryMessage::RequestIdReject { code } => self.on_request_id_reject(code).await,
            DiscoveryMessage::Kill => self.on_kill(inbound).await,
            DiscoveryMessage::Panic { foreign_senior } => {
                self.on_panic(inbound, foreign_senior).await
            }
        }
    }

    async fn handle_directed(
        &mut self,
        inbound: Inbound,
        msg: DirectedMessage,
    ) -> FlockResult<()> {
        match msg {
            DirectedMessage::MemberHeartbeat { from, sent_millis } => {
                self.on_member_heartbeat(from, sent_millis);
                Ok(())
            }
            DirectedMessage::Induct { members, services } => {
                self.on_induct(inbound, members, services).await
            }
            DirectedMessage::Welcome { poll_id, from } => self.on_welcome(poll_id, from).await,
            DirectedMessage::Ack { poll_id, from } => {
                self.on_ack(poll_id, from);
                Ok(())
            }
            DirectedMessage::MemberLeaving { id } => {
                self.on_member_leaving(id).await;
                Ok(())
            }
            DirectedMessage::MemberLeft { id, uid } => {
                self.on_member_left(id, uid);
                Ok(())
            }
            DirectedMessage::MemberJoined { member } => self.on_member_joined(member).await,
            DirectedMessage::ServiceJoinRequest { .. } => {
                self.on_service_join_request(inbound, msg).await
            }
            DirectedMessage::ServiceJoinReply { poll_id, service_id, join_time, granted, code } => {
                self.on_service_join_reply(poll_id, service_id, join_time, granted, code).await
            }
            DirectedMessage::ServiceJoining {
                poll_id,
                service_id,
                name,
                service_type,
                priority,
                member,
                join_time,
                version,
            } => {
                self.on_service_joining(
                    inbound, poll_id, service_id, name, service_type, priority, member,
                    join_time, version,
                )
                .await
            }
            DirectedMessage::ServiceLeave { poll_id, service_id, member } => {
                self.on_service_leave(inbound, poll_id, service_id, member).await
            }
            DirectedMessage::ServiceLeft { service_id, member } => {
                self.on_service_left(service_id, member).await;
                Ok(())
            }
            DirectedMessage::WitnessRequest { poll_id, suspect } => {
                self.on_witness_request(inbound, poll_id, suspect).await
            }
            DirectedMessage::WitnessReply { poll_id, suspect, confirmed_dead } => {
                self.on_witness_reply(inbound, poll_id, suspect, confirmed_dead);
                Ok(())
            }
            DirectedMessage::RollCall { poll_id, incident_millis } => {
                self.on_roll_call(inbound, poll_id, incident_millis).await
            }
        }
    }

    /// Generic poll response path. The quorum roll-call additionally
    /// re-evaluates on every single response, not just completion.
    fn on_ack(&mut self, poll_id: u64, from: MemberId) {
        if self.quorum.rollcall_poll == Some(poll_id) {
            self.quorum.record_confirmation(from, Instant::now());
        }
        if let Some((poll, purpose, outcome)) = self.polls.respond(poll_id, from) {
            self.work.push_back(Work::PollDone { poll, purpose, outcome });
        } else if self.quorum.rollcall_poll == Some(poll_id) {
            // Intermediate response: the policy may allow now.
            self.work.push_back(Work::Reevaluate);
        }
    }

    // ── api ────────────────────────────────────────────────────────────

    async fn handle_api(&mut self, req: ApiRequest) -> FlockResult<()> {
        match req {
            ApiRequest::JoinService { name, service_type, priority, version, token, reply } => {
                self.api_join_service(name, service_type, priority, version, token, reply).await
            }
            ApiRequest::LeaveService { service_id, reply } => {
                self.api_leave_service(service_id, reply).await
            }
            ApiRequest::Status { reply } => {
                let report = StatusReport {
                    state: self.state.name(),
                    id: self.local_id,
                    uid: self.uid,
                    senior: self.registry.senior_id(),
                    live_members: self.registry.live_count(),
                    convicted: self.quorum.convicted.len(),
                    services: self.services.count(),
                };
                let _ = reply.send(report);
                Ok(())
            }
            ApiRequest::Leave { reply } => {
                self.begin_leaving(reply).await;
                Ok(())
            }
        }
    }

    // ── deferred work ──────────────────────────────────────────────────

    pub(crate) async fn drain_work(&mut self) {
        while let Some(work) = self.work.pop_front() {
            if self.halted.is_some() {
                return;
            }
            let result = match work {
                Work::PollDone { poll, purpose, outcome } => {
                    self.on_poll_complete(poll, purpose, outcome).await
                }
                Work::Depart { id, informed, fan_out } => {
                    self.do_depart(id, informed, fan_out).await
                }
                Work::Convict { id } => self.do_convict(id).await,
                Work::Reevaluate => self.do_reevaluate().await,
            };
            if let Err(e) = result {
                error!("unrecoverable error in deferred work: {}", e);
                self.halt(HaltReason::Fatal(e.to_string()));
            }
        }
    }

    async fn on_poll_complete(
        &mut self,
        poll: Poll,
        purpose: PollPurpose,
        outcome: PollOutcome,
    ) -> FlockResult<()> {
        debug!("poll {} ({}) completed: {:?}", poll.id, poll.purpose, outcome);
        match purpose {
            PollPurpose::Welcome => self.complete_welcome(outcome).await,
            PollPurpose::Witness { suspect } => {
                self.complete_witness(poll, suspect, outcome).await
            }
            PollPurpose::RollCall => self.complete_roll_call(poll, outcome).await,
            PollPurpose::ServiceJoinNotify {
                service_id,
                name,
                service_type,
                priority,
                member,
                join_time,
                version,
                reply_to,
            } => {
                self.complete_service_join(
                    poll.id, service_id, name, service_type, priority, member, join_time,
                    version, reply_to, outcome,
                )
                .await
            }
            PollPurpose::ApiPending => {
                if let Some(waiter) = self.api_waiters.remove(&poll.id) {
                    match waiter {
                        // A granted join resolves through ServiceJoinReply,
                        // which removes the waiter first; reaching here
                        // means the request went unanswered.
                        ApiWaiter::ServiceJoin { reply, .. } => {
                            let err = match outcome {
                                PollOutcome::Expired => FlockError::JoinTimeout,
                                _ => FlockError::NotJoined,
                            };
                            let _ = reply.send(Err(err));
                        }
                        // Leave requests are acknowledged with a plain Ack,
                        // so full response is success.
                        ApiWaiter::ServiceLeave(tx) => {
                            let result = match outcome {
                                PollOutcome::AllResponded => Ok(()),
                                PollOutcome::Expired => Err(FlockError::JoinTimeout),
                                _ => Err(FlockError::NotJoined),
                            };
                            let _ = tx.send(result);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// The single full-departure path: registry retirement, poll cleanup,
    /// quorum cleanup, service cleanup, derived-view refresh, events, and
    /// the gap-closing departure fan-out.
    async fn do_depart(
        &mut self,
        id: MemberId,
        informed: BTreeSet<MemberId>,
        fan_out: bool,
    ) -> FlockResult<()> {
        if Some(id) == self.local_id {
            self.halt(HaltReason::Killed);
            return Ok(());
        }
        let Some((member, gaps)) = self.registry.mark_departed(id, &informed, Instant::now())
        else {
            return Ok(());
        };

        for (poll, purpose, outcome) in self.polls.member_departed(id) {
            self.work.push_back(Work::PollDone { poll, purpose, outcome });
        }
        self.quorum.member_departed(id);
        for service_id in self.services.purge_member(id) {
            self.emit(MembershipEvent::ServiceLeft { service_id, member: id }).await;
        }
        self.refresh_derived();

        if fan_out {
            for gap in gaps {
                self.send_directed(gap, DirectedMessage::MemberLeft { id, uid: member.uid })
                    .await?;
            }
        }
        self.emit(MembershipEvent::MemberLeft(member)).await;
        Ok(())
    }

    // ── timer wheel ────────────────────────────────────────────────────

    pub(crate) fn next_deadline(&self) -> Instant {
        let idle = Instant::now() + Duration::from_secs(60);
        [self.timers.next(), self.polls.next_expiry()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(idle)
    }

    pub(crate) async fn handle_tick(&mut self) {
        let now = Instant::now();

        let expired = self.polls.expire_due(now);
        for (poll, purpose, outcome) in expired {
            self.work.push_back(Work::PollDone { poll, purpose, outcome });
        }

        let mut result: FlockResult<()> = Ok(());
        if due(&mut self.timers.announce, now) {
            result = result.and(self.announce_tick().await);
        }
        if due(&mut self.timers.joining, now) {
            result = result.and(self.joining_timeout().await);
        }
        if due(&mut self.timers.heartbeat, now) {
            result = result.and(self.heartbeat_tick().await);
        }
        if due(&mut self.timers.rollcall, now) {
            result = result.and(self.rollcall_tick().await);
        }
        if due(&mut self.timers.moratorium, now) {
            self.quorum.moratorium_elapsed();
        }
        if due(&mut self.timers.housekeeping, now) {
            self.housekeeping_tick(now).await;
        }
        if due(&mut self.timers.leave_grace, now) {
            result = result.and(self.finish_leaving().await);
        }

        if let Err(e) = result {
            error!("unrecoverable error in timer processing: {}", e);
            self.halt(HaltReason::Fatal(e.to_string()));
        }
        self.drain_work().await;
    }

    async fn housekeeping_tick(&mut self, now: Instant) {
        self.registry.sweep_recycled(now);

        // A member whose timeouts stopped long enough ago gets its
        // consecutive-window counter back.
        let now_millis = self.now_millis();
        let decay = self.config.delivery_timeout.as_millis() as u64;
        for m in self.registry.live_members_mut() {
            if m.timeout_windows > 0
                && !m.timed_out
                && now_millis.saturating_sub(m.last_timeout) > decay
            {
                m.timeout_windows = 0;
            }
        }

        let before = self.zombies.len();
        self.zombies.retain(|_, expiry| *expiry > now);
        if before > 0 && self.zombies.is_empty() {
            info!("zombie records expired; admission resumed");
        }

        self.sweep_pending_joins();
        self.quorum.sweep_confirmations(now, self.config.moratorium);

        self.timers.housekeeping = Some(now + self.config.service_join_sweep);
    }
}

/// The actor task: owns a [`ClusterCore`] and its input queue.
pub struct Engine {
    pub(crate) core: ClusterCore,
    pub(crate) rx: mpsc::Receiver<Input>,
}

impl Engine {
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        rx: mpsc::Receiver<Input>,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Self {
        let uid = MemberUid::generate(
            transport.current_safe_time(),
            config.machine,
            (std::process::id() & 0xFFFF) as u16,
        );
        let registry = Registry::new(config.recycle_retention);
        let core = ClusterCore {
            uid,
            local_id: None,
            state: JoinState::Announce(AnnounceState {
                attempt: 0,
                self_heard: false,
                bound: false,
                rtt_bound: config.rtt_variance,
            }),
            time_adjust: 0,
            registry,
            services: ServiceTable::new(),
            polls: PollTable::new(),
            quorum: crate::quorum::QuorumState::new(),
            detect: crate::detect::DetectState::new(),
            ring: Vec::new(),
            zombies: BTreeMap::new(),
            pending_joins: BTreeMap::new(),
            service_polls: BTreeSet::new(),
            api_waiters: BTreeMap::new(),
            leave_reply: None,
            transport,
            events,
            license: Arc::new(AcceptAllLicenses),
            tokens: Arc::new(AcceptAllTokens),
            policy: Arc::new(MajorityPolicy),
            broadcast_addrs: Arc::new(StdMutex::new(BTreeSet::new())),
            timers: Timers::default(),
            work: VecDeque::new(),
            halted: None,
            config,
        };
        Self { core, rx }
    }

    pub fn with_license(mut self, v: Arc<dyn LicenseValidator>) -> Self {
        self.core.license = v;
        self
    }

    pub fn with_tokens(mut self, v: Arc<dyn TokenValidator>) -> Self {
        self.core.tokens = v;
        self
    }

    pub fn with_policy(mut self, v: Arc<dyn DisconnectPolicy>) -> Self {
        self.core.policy = v;
        self
    }

    /// Run until the member halts. The returned reason is also emitted as
    /// a [`MembershipEvent::SelfTerminated`].
    pub async fn run(mut self) -> HaltReason {
        info!(
            "starting member {} for cluster '{}' at {}",
            self.core.uid, self.core.config.cluster, self.core.config.addr
        );
        self.core.refresh_derived();
        self.core.timers.announce = Some(Instant::now());
        self.core.timers.housekeeping =
            Some(Instant::now() + self.core.config.service_join_sweep);

        loop {
            if self.core.halted.is_some() {
                break;
            }
            let deadline = self.core.next_deadline();
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(input) => self.core.handle_input(input).await,
                    None => {
                        self.core.halt(HaltReason::Left);
                    }
                },
                _ = tokio::time::sleep_until(deadline) => self.core.handle_tick().await,
            }
        }

        let reason = self.core.halted.clone().unwrap_or(HaltReason::Left);
        if let Some(tx) = self.core.leave_reply.take() {
            let _ = tx.send(());
        }
        self.core.emit(MembershipEvent::SelfTerminated(reason.clone())).await;
        info!("member {} stopped: {:?}", self.core.uid, reason);
        reason
    }
}

/// Enqueue-only handle for API callers; safe to clone across threads.
#[derive(Clone)]
pub struct ClusterHandle {
    tx: mpsc::Sender<Input>,
}

impl ClusterHandle {
    pub fn new(tx: mpsc::Sender<Input>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ApiRequest,
    ) -> FlockResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Input::Api(build(reply_tx)))
            .await
            .map_err(|_| FlockError::Terminated)?;
        reply_rx.await.map_err(|_| FlockError::Terminated)
    }

    /// Join a named sub-service and wait for cluster-wide arbitration.
    pub async fn join_service(
        &self,
        name: impl Into<String>,
        service_type: impl Into<String>,
        priority: u8,
        version: u32,
        token: Option<Vec<u8>>,
    ) -> FlockResult<u16> {
        let name = name.into();
        let service_type = service_type.into();
        self.request(|reply| ApiRequest::JoinService {
            name,
            service_type,
            priority,
            version,
            token,
            reply,
        })
        .await?
    }

    pub async fn leave_service(&self, service_id: u16) -> FlockResult<()> {
        self.request(|reply| ApiRequest::LeaveService { service_id, reply }).await?
    }

    pub async fn status(&self) -> FlockResult<StatusReport> {
        self.request(|reply| ApiRequest::Status { reply }).await
    }

    /// Graceful departure: announce intent, wait out the grace delay,
    /// broadcast the departure record, halt.
    pub async fn leave(&self) -> FlockResult<()> {
        self.request(|reply| ApiRequest::Leave { reply }).await
    }

    /// Immediate halt without the leave protocol.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Input::Shutdown).await;
    }

    /// Feed a transport-level signal (packet, delivery timeout, ring down)
    /// into the engine. This is the surface a real transport's receive
    /// path and ring monitor use; they never touch protocol state.
    pub async fn inject(&self, input: Input) -> FlockResult<()> {
        self.tx.send(input).await.map_err(|_| FlockError::Terminated)
    }
}

/// Wire a new engine onto a loopback mesh and spawn it.
pub fn spawn_on_mesh(
    config: ClusterConfig,
    mesh: &Arc<LoopbackMesh>,
) -> (ClusterHandle, mpsc::Receiver<MembershipEvent>, JoinHandle<HaltReason>) {
    let (input_tx, input_rx) = mpsc::channel(DEFAULT_ENGINE_QUEUE_SIZE);
    let (event_tx, event_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_SIZE);
    let transport = mesh.attach(config.addr, input_tx.clone());
    let engine = Engine::new(config, transport, input_rx, event_tx);
    let handle = ClusterHandle::new(input_tx);
    let task = tokio::spawn(engine.run());
    (handle, event_rx, task)
}


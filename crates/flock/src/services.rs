//! Service join/leave coordination.
//!
//! The join/notify/respond pattern of cluster membership, reused at the
//! scope of a named sub-service. A member asks the cluster senior to admit
//! it into service *S*; the senior validates the security token, assigns a
//! join time strictly greater than any existing member's for that service,
//! floods a joining notification to every other member, and answers the
//! requester only after the flood is fully acknowledged — no member ever
//! observes the new service member before all peers were notified. While
//! such a flood is outstanding, admission of new *cluster* members is
//! deferred.

use std::collections::BTreeSet;

use bitvec::prelude::*;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use flock_proto::constants::MAX_SERVICES;
use flock_proto::error::{FlockError, FlockResult, RejectReason};
use flock_proto::member::MemberId;
use flock_proto::message::DirectedMessage;
use flock_proto::service::{ServiceInfo, ServiceMemberState, ServicePhase};

use crate::engine::{ApiWaiter, ClusterCore, Inbound, JoinState, PollPurpose, ServiceReplyTo};
use crate::events::MembershipEvent;
use crate::poll::PollOutcome;

/// Reply code: the security token was rejected.
pub const SVC_REJECT_TOKEN: u8 = 0x01;
/// Reply code: the service is suspended.
pub const SVC_REJECT_SUSPENDED: u8 = 0x02;

/// Dense service arena keyed by service id, with an in-use bitmap.
/// Entries are created on first announcement and never destroyed; an
/// identity mismatch recreates the entry in place.
pub struct ServiceTable {
    slots: Vec<Option<ServiceInfo>>,
    in_use: BitVec<u8, Msb0>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SERVICES).map(|_| None).collect(),
            in_use: bitvec![u8, Msb0; 0; MAX_SERVICES],
        }
    }

    pub fn count(&self) -> usize {
        self.in_use.count_ones()
    }

    pub fn get(&self, id: u16) -> Option<&ServiceInfo> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut ServiceInfo> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ServiceInfo> {
        self.slots.iter().filter_map(|s| s.as_ref()).find(|s| s.name == name)
    }

    /// Allocate the lowest free service id. Id 0 is reserved.
    pub fn create(&mut self, name: String, service_type: String, priority: u8) -> Option<u16> {
        let id = self.in_use[1..].first_zero().map(|off| (off + 1) as u16)?;
        self.in_use.set(id as usize, true);
        self.slots[id as usize] = Some(ServiceInfo::new(id, name, service_type, priority));
        Some(id)
    }

    /// Get the entry for an announced identity, recreating it when the
    /// stored identity does not match the announcement.
    pub fn ensure(
        &mut self,
        id: u16,
        name: &str,
        service_type: &str,
        priority: u8,
    ) -> Option<&mut ServiceInfo> {
        if id as usize >= MAX_SERVICES || id == 0 {
            return None;
        }
        let stale = match self.get(id) {
            Some(s) => s.name != name || s.service_type != service_type,
            None => true,
        };
        if stale {
            self.in_use.set(id as usize, true);
            self.slots[id as usize] =
                Some(ServiceInfo::new(id, name.to_string(), service_type.to_string(), priority));
        }
        self.get_mut(id)
    }

    pub fn install_snapshot(&mut self, services: Vec<ServiceInfo>) {
        for svc in services {
            let id = svc.id as usize;
            if id == 0 || id >= MAX_SERVICES {
                continue;
            }
            self.in_use.set(id, true);
            self.slots[id] = Some(svc);
        }
    }

    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        self.slots.iter().filter_map(|s| s.as_ref()).cloned().collect()
    }

    /// Remove a member from every service; returns the services touched.
    pub fn purge_member(&mut self, member: MemberId) -> Vec<u16> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut())
            .filter_map(|s| s.remove_member(member).is_some().then_some(s.id))
            .collect()
    }

    /// Summed priority of the services a member runs; the importance
    /// measure used by slow-member arbitration and witness selection.
    pub fn member_priority(&self, member: MemberId) -> u32 {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(|s| s.has_member(member))
            .map(|s| s.priority as u32)
            .sum()
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterCore {
    // ── requester side ─────────────────────────────────────────────────

    pub(crate) async fn api_join_service(
        &mut self,
        name: String,
        service_type: String,
        priority: u8,
        version: u32,
        token: Option<Vec<u8>>,
        reply: oneshot::Sender<FlockResult<u16>>,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            let _ = reply.send(Err(FlockError::NotJoined));
            return Ok(());
        }
        if self.is_senior() {
            let me = self.me();
            return self
                .senior_service_join(
                    name,
                    service_type,
                    priority,
                    version,
                    token,
                    me,
                    None,
                    Some(reply),
                )
                .await;
        }

        let Some(senior) = self.registry.senior_id() else {
            let _ = reply.send(Err(FlockError::NotJoined));
            return Ok(());
        };
        let recipients: BTreeSet<MemberId> = [senior].into();
        let expiry = Instant::now() + self.config.delivery_timeout;
        let poll_id = self.polls.open("svc-request", recipients, Some(expiry), PollPurpose::ApiPending);
        self.api_waiters.insert(
            poll_id,
            ApiWaiter::ServiceJoin {
                reply,
                name: name.clone(),
                service_type: service_type.clone(),
                priority,
                version,
            },
        );
        self.send_directed(
            senior,
            DirectedMessage::ServiceJoinRequest {
                poll_id,
                name,
                service_type,
                priority,
                version,
                token,
                sent_millis: self.now_millis(),
            },
        )
        .await
    }

    pub(crate) async fn api_leave_service(
        &mut self,
        service_id: u16,
        reply: oneshot::Sender<FlockResult<()>>,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            let _ = reply.send(Err(FlockError::NotJoined));
            return Ok(());
        }
        let me = self.me();
        if self.is_senior() {
            self.senior_service_leave(service_id, me).await?;
            let _ = reply.send(Ok(()));
            return Ok(());
        }
        let Some(senior) = self.registry.senior_id() else {
            let _ = reply.send(Err(FlockError::NotJoined));
            return Ok(());
        };
        let recipients: BTreeSet<MemberId> = [senior].into();
        let expiry = Instant::now() + self.config.delivery_timeout;
        let poll_id = self.polls.open("svc-leave", recipients, Some(expiry), PollPurpose::ApiPending);
        self.api_waiters.insert(poll_id, ApiWaiter::ServiceLeave(reply));
        self.send_directed(senior, DirectedMessage::ServiceLeave { poll_id, service_id, member: me })
            .await
    }

    /// The senior's answer to our service-join request.
    pub(crate) async fn on_service_join_reply(
        &mut self,
        poll_id: u64,
        service_id: u16,
        join_time: u64,
        granted: bool,
        code: u8,
    ) -> FlockResult<()> {
        self.polls.cancel(poll_id);
        let Some(waiter) = self.api_waiters.remove(&poll_id) else {
            return Ok(());
        };
        match waiter {
            ApiWaiter::ServiceJoin { reply, name, service_type, priority, version } => {
                if granted {
                    let me = self.me();
                    if let Some(svc) =
                        self.services.ensure(service_id, &name, &service_type, priority)
                    {
                        svc.insert_member(
                            me,
                            ServiceMemberState { join_time, phase: ServicePhase::Joined, version },
                        );
                    }
                    self.emit(MembershipEvent::ServiceJoined { service_id, member: me }).await;
                    let _ = reply.send(Ok(service_id));
                } else {
                    let err = match code {
                        SVC_REJECT_TOKEN => FlockError::TokenRejected,
                        SVC_REJECT_SUSPENDED => FlockError::ServiceSuspended,
                        c => RejectReason::from_code(c)
                            .map(FlockError::Rejected)
                            .unwrap_or(FlockError::NotJoined),
                    };
                    let _ = reply.send(Err(err));
                }
            }
            ApiWaiter::ServiceLeave(reply) => {
                let _ = reply.send(Err(FlockError::Internal("mismatched reply".into())));
            }
        }
        Ok(())
    }

    // ── senior side ────────────────────────────────────────────────────

    pub(crate) async fn on_service_join_request(
        &mut self,
        inbound: Inbound,
        msg: DirectedMessage,
    ) -> FlockResult<()> {
        let DirectedMessage::ServiceJoinRequest {
            poll_id,
            ref name,
            ref service_type,
            priority,
            version,
            ref token,
            sent_millis: _,
        } = msg
        else {
            return Ok(());
        };
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        let Some(requester) = self.registry.by_uid(&inbound.packet.header.sender).map(|m| m.id)
        else {
            return Ok(());
        };
        if !self.is_senior() {
            // Mid-failover; the requester will retry against the new senior.
            return self
                .send_directed(
                    requester,
                    DirectedMessage::ServiceJoinReply {
                        poll_id,
                        service_id: 0,
                        join_time: 0,
                        granted: false,
                        code: RejectReason::RestartRequested.to_code(),
                    },
                )
                .await;
        }

        // Security-token validation interposed before anyone is notified.
        if !self.tokens.validate(token.as_deref()) {
            warn!("service-join token rejected for member {}", requester);
            return self
                .send_directed(
                    requester,
                    DirectedMessage::ServiceJoinReply {
                        poll_id,
                        service_id: 0,
                        join_time: 0,
                        granted: false,
                        code: SVC_REJECT_TOKEN,
                    },
                )
                .await;
        }

        self.senior_service_join(
            name.clone(),
            service_type.clone(),
            priority,
            version,
            token.clone(),
            requester,
            Some((inbound.from, poll_id)),
            None,
        )
        .await
    }

    /// The senior's half of a service join, for both remote requesters and
    /// the senior's own API calls.
    #[allow(clippy::too_many_arguments)]
    async fn senior_service_join(
        &mut self,
        name: String,
        service_type: String,
        priority: u8,
        version: u32,
        token: Option<Vec<u8>>,
        requester: MemberId,
        remote: Option<(std::net::SocketAddr, u64)>,
        local_reply: Option<oneshot::Sender<FlockResult<u16>>>,
    ) -> FlockResult<()> {
        // Local callers validate here too; remote tokens were checked on
        // receipt so the reject can carry the request poll id.
        if remote.is_none() && !self.tokens.validate(token.as_deref()) {
            if let Some(reply) = local_reply {
                let _ = reply.send(Err(FlockError::TokenRejected));
            }
            return Ok(());
        }

        let existing = self
            .services
            .find_by_name(&name)
            .map(|s| (s.id, s.suspended, s.max_join_time()));
        let service = existing.or_else(|| {
            self.services
                .create(name.clone(), service_type.clone(), priority)
                .map(|id| (id, false, 0))
        });
        let Some((service_id, suspended, max_join)) = service else {
            return self
                .answer_service_join(remote, local_reply, 0, 0, false, RejectReason::ClusterFull.to_code())
                .await;
        };
        if suspended {
            return self
                .answer_service_join(remote, local_reply, service_id, 0, false, SVC_REJECT_SUSPENDED)
                .await;
        }

        // Strictly greater than every existing member's join time.
        let join_time = max_join.max(self.cluster_millis()) + 1;
        let me = self.me();
        let others: BTreeSet<MemberId> = self
            .registry
            .live_ids_except(me)
            .into_iter()
            .filter(|id| *id != requester)
            .collect();

        if others.is_empty() {
            // No peers to notify: immediate success.
            self.apply_service_join(service_id, &name, &service_type, priority, requester, join_time, version)
                .await;
            return self
                .answer_service_join(remote, local_reply, service_id, join_time, true, 0)
                .await;
        }

        let reply_to = match (remote, local_reply) {
            (Some((addr, request_poll)), None) => {
                ServiceReplyTo::Remote { addr, request_poll, member: requester }
            }
            (None, Some(reply)) => {
                // Stash the local waiter under the notify poll id below.
                ServiceReplyTo::Local { reply }
            }
            _ => return Ok(()),
        };

        let expiry = Instant::now() + self.config.delivery_timeout;
        let poll_id = self.polls.open(
            "svc-notify",
            others.clone(),
            Some(expiry),
            PollPurpose::ServiceJoinNotify {
                service_id,
                name: name.clone(),
                service_type: service_type.clone(),
                priority,
                member: requester,
                join_time,
                version,
                reply_to,
            },
        );
        self.service_polls.insert(poll_id);
        debug!(
            "flooding service-join of member {} into '{}' to {:?}",
            requester, name, others
        );
        for other in others {
            self.send_directed(
                other,
                DirectedMessage::ServiceJoining {
                    poll_id,
                    service_id,
                    name: name.clone(),
                    service_type: service_type.clone(),
                    priority,
                    member: requester,
                    join_time,
                    version,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn answer_service_join(
        &mut self,
        remote: Option<(std::net::SocketAddr, u64)>,
        local_reply: Option<oneshot::Sender<FlockResult<u16>>>,
        service_id: u16,
        join_time: u64,
        granted: bool,
        code: u8,
    ) -> FlockResult<()> {
        if let Some((addr, request_poll)) = remote {
            let member = self
                .registry
                .live_members()
                .find(|m| m.addr == addr)
                .map(|m| m.id)
                .unwrap_or(0);
            self.send_directed_addr(
                addr,
                member,
                DirectedMessage::ServiceJoinReply {
                    poll_id: request_poll,
                    service_id,
                    join_time,
                    granted,
                    code,
                },
            )
            .await?;
        }
        if let Some(reply) = local_reply {
            let result = if granted {
                Ok(service_id)
            } else {
                Err(match code {
                    SVC_REJECT_TOKEN => FlockError::TokenRejected,
                    SVC_REJECT_SUSPENDED => FlockError::ServiceSuspended,
                    c => RejectReason::from_code(c)
                        .map(FlockError::Rejected)
                        .unwrap_or(FlockError::NotJoined),
                })
            };
            let _ = reply.send(result);
        }
        Ok(())
    }

    async fn apply_service_join(
        &mut self,
        service_id: u16,
        name: &str,
        service_type: &str,
        priority: u8,
        member: MemberId,
        join_time: u64,
        version: u32,
    ) {
        if let Some(svc) = self.services.ensure(service_id, name, service_type, priority) {
            svc.insert_member(
                member,
                ServiceMemberState { join_time, phase: ServicePhase::Joined, version },
            );
            info!("member {} joined {}", member, svc);
        }
        self.emit(MembershipEvent::ServiceJoined { service_id, member }).await;
    }

    /// The notification flood closed; only now may the requester learn of
    /// its success.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn complete_service_join(
        &mut self,
        poll_id: u64,
        service_id: u16,
        name: String,
        service_type: String,
        priority: u8,
        member: MemberId,
        join_time: u64,
        version: u32,
        reply_to: ServiceReplyTo,
        outcome: PollOutcome,
    ) -> FlockResult<()> {
        self.service_polls.remove(&poll_id);

        let granted = matches!(outcome, PollOutcome::AllResponded | PollOutcome::Abandoned);
        if granted {
            self.apply_service_join(
                service_id, &name, &service_type, priority, member, join_time, version,
            )
            .await;
        } else {
            warn!("service-join notification for member {} did not complete", member);
        }
        let code = if granted { 0 } else { RejectReason::RestartRequested.to_code() };
        match reply_to {
            ServiceReplyTo::Remote { addr, request_poll, member: m } => {
                self.send_directed_addr(
                    addr,
                    m,
                    DirectedMessage::ServiceJoinReply {
                        poll_id: request_poll,
                        service_id,
                        join_time,
                        granted,
                        code,
                    },
                )
                .await?;
            }
            ServiceReplyTo::Local { reply } => {
                let result = if granted {
                    Ok(service_id)
                } else {
                    Err(FlockError::Rejected(RejectReason::RestartRequested))
                };
                let _ = reply.send(result);
            }
        }

        // The deferral is over: admit the cluster joins queued behind this
        // notification.
        if self.service_polls.is_empty() {
            self.flush_pending_joins().await?;
        }
        Ok(())
    }

    async fn flush_pending_joins(&mut self) -> FlockResult<()> {
        let pending: Vec<Inbound> = std::mem::take(&mut self.pending_joins)
            .into_values()
            .collect();
        for inbound in pending {
            if let Some(flock_proto::message::Payload::Discovery(msg)) =
                inbound.packet.payload.clone()
            {
                debug!("admitting deferred cluster join from {}", inbound.from);
                self.on_request_id(inbound, msg).await?;
            }
        }
        Ok(())
    }

    /// Drop deferred cluster joins that have waited past the overdue bound;
    /// their candidates re-announce on their own schedule.
    pub(crate) fn sweep_pending_joins(&mut self) {
        let now = self.now_millis();
        let overdue = self.config.service_join_overdue.as_millis() as u64;
        let before = self.pending_joins.len();
        self.pending_joins.retain(|sent, _| now.saturating_sub(*sent) < overdue);
        let dropped = before - self.pending_joins.len();
        if dropped > 0 {
            debug!("dropped {} overdue deferred joins", dropped);
        }
    }

    // ── notification receivers ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn on_service_joining(
        &mut self,
        inbound: Inbound,
        poll_id: u64,
        service_id: u16,
        name: String,
        service_type: String,
        priority: u8,
        member: MemberId,
        join_time: u64,
        version: u32,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) {
            return Ok(());
        }
        if let Some(svc) = self.services.ensure(service_id, &name, &service_type, priority) {
            svc.insert_member(
                member,
                ServiceMemberState { join_time, phase: ServicePhase::Joined, version },
            );
        }
        self.emit(MembershipEvent::ServiceJoining { service_id, member }).await;
        let Some(senior) = self.registry.by_uid(&inbound.packet.header.sender).map(|m| m.id)
        else {
            return Ok(());
        };
        let me = self.me();
        self.send_directed(senior, DirectedMessage::Ack { poll_id, from: me }).await
    }

    pub(crate) async fn on_service_leave(
        &mut self,
        inbound: Inbound,
        poll_id: u64,
        service_id: u16,
        member: MemberId,
    ) -> FlockResult<()> {
        if !matches!(self.state, JoinState::Joined) || !self.is_senior() {
            return Ok(());
        }
        let Some(requester) = self.registry.by_uid(&inbound.packet.header.sender).map(|m| m.id)
        else {
            return Ok(());
        };
        self.emit(MembershipEvent::ServiceLeaving { service_id, member }).await;
        self.senior_service_leave(service_id, member).await?;
        self.send_directed(requester, DirectedMessage::Ack { poll_id, from: self.me() }).await
    }

    async fn senior_service_leave(&mut self, service_id: u16, member: MemberId) -> FlockResult<()> {
        if let Some(svc) = self.services.get_mut(service_id) {
            svc.remove_member(member);
        }
        let me = self.me();
        for other in self.registry.live_ids_except(me) {
            if other == member {
                continue;
            }
            self.send_directed(other, DirectedMessage::ServiceLeft { service_id, member }).await?;
        }
        self.emit(MembershipEvent::ServiceLeft { service_id, member }).await;
        Ok(())
    }

    pub(crate) async fn on_service_left(&mut self, service_id: u16, member: MemberId) {
        if let Some(svc) = self.services.get_mut(service_id) {
            svc.remove_member(member);
        }
        self.emit(MembershipEvent::ServiceLeft { service_id, member }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ids_are_dense_and_start_at_one() {
        let mut table = ServiceTable::new();
        let a = table.create("cache".into(), "partitioned".into(), 5).unwrap();
        let b = table.create("topics".into(), "messaging".into(), 3).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn identity_mismatch_recreates_the_entry() {
        let mut table = ServiceTable::new();
        let id = table.create("cache".into(), "partitioned".into(), 5).unwrap();
        table
            .get_mut(id)
            .unwrap()
            .insert_member(7, ServiceMemberState { join_time: 1, phase: ServicePhase::Joined, version: 1 });

        // Same id re-announced under a different identity: stale entry.
        let svc = table.ensure(id, "topics", "messaging", 2).unwrap();
        assert_eq!(svc.name, "topics");
        assert!(svc.members.is_empty());

        // Matching identity keeps the entry.
        table
            .get_mut(id)
            .unwrap()
            .insert_member(9, ServiceMemberState { join_time: 2, phase: ServicePhase::Joined, version: 1 });
        let svc = table.ensure(id, "topics", "messaging", 2).unwrap();
        assert!(svc.has_member(9));
    }

    #[test]
    fn member_priority_sums_across_services() {
        let mut table = ServiceTable::new();
        let a = table.create("cache".into(), "partitioned".into(), 5).unwrap();
        let b = table.create("topics".into(), "messaging".into(), 3).unwrap();
        let state = ServiceMemberState { join_time: 1, phase: ServicePhase::Joined, version: 1 };
        table.get_mut(a).unwrap().insert_member(7, state.clone());
        table.get_mut(b).unwrap().insert_member(7, state.clone());
        table.get_mut(b).unwrap().insert_member(8, state);

        assert_eq!(table.member_priority(7), 8);
        assert_eq!(table.member_priority(8), 3);
        assert_eq!(table.member_priority(9), 0);
    }

    #[test]
    fn purge_member_names_the_touched_services() {
        let mut table = ServiceTable::new();
        let a = table.create("cache".into(), "partitioned".into(), 5).unwrap();
        let b = table.create("topics".into(), "messaging".into(), 3).unwrap();
        let state = ServiceMemberState { join_time: 1, phase: ServicePhase::Joined, version: 1 };
        table.get_mut(a).unwrap().insert_member(7, state.clone());
        table.get_mut(b).unwrap().insert_member(7, state);

        let touched = table.purge_member(7);
        assert_eq!(touched, vec![a, b]);
        assert!(table.purge_member(7).is_empty());
    }
}

//! Wire messages for the membership protocol.
//!
//! All messages live on one shared numeric type-id namespace. Ids below
//! [`DISCOVERY_TYPE_CUTOFF`] are discovery/broadcast messages and must stay
//! byte-compatible across protocol versions: version-mismatch detection
//! itself depends on a current build being able to read an old announce.
//! Ids at or above the cutoff are directed (point-to-point) messages and
//! may change between versions.
//!
//! ## Frame layout
//!
//! ```text
//! magic      u32 BE
//! proto_ver  u16 BE
//! type_id    u16 BE
//! sender     16-byte member uid
//! n_targets  u16 BE, then n_targets * u16 BE member ids (empty = broadcast)
//! payload    bincode-encoded message enum
//! ```
//!
//! A frame whose payload fails to decode is not dropped: it is returned as
//! a [`Packet`] with `read_error` set and still dispatched, so that
//! version-mismatch and validation failures can be reported to the sender
//! instead of hanging silently.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::constants::{DISCOVERY_TYPE_CUTOFF, FRAME_MAGIC, FRAME_PREFIX_LEN, UID_WIRE_LEN};
use crate::error::{FlockError, FlockResult};
use crate::member::{Member, MemberId, MemberUid};
use crate::service::ServiceInfo;

/// Discovery/broadcast messages, type ids 1-10. These float on the shared
/// broadcast medium (multicast or a WKA unicast set) and are interpreted
/// differently depending on the receiver's local join state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// Presence announcement from a candidate, repeated with an increasing
    /// attempt counter.
    Announce {
        cluster: String,
        addr: SocketAddr,
        machine: u32,
        role: String,
        attempt: u32,
        sent_millis: u64,
    },
    /// Senior's reply to an announce, carrying the timestamps the candidate
    /// needs to derive its time adjustment.
    AnnounceReply {
        senior_id: MemberId,
        /// The candidate's `sent_millis`, echoed back.
        echo_millis: u64,
        /// Senior's clock when the reply was sent.
        senior_millis: u64,
    },
    /// From a non-senior: the cluster is mid-transition, keep announcing.
    AnnounceWait,
    /// Periodic senior broadcast advertising the live member set.
    SeniorHeartbeat {
        senior_id: MemberId,
        members: Vec<MemberUid>,
    },
    /// Candidate asks the senior for a member id.
    RequestId {
        cluster: String,
        addr: SocketAddr,
        machine: u32,
        process: String,
        role: String,
        max_packet: u32,
        wka_mode: bool,
        license_mode: u8,
        edition: String,
        mode: String,
        sent_millis: u64,
    },
    /// Senior grants an id.
    RequestIdReply { id: MemberId, senior_id: MemberId },
    /// Senior rejects; `code` is a stable [`RejectReason`] wire code.
    ///
    /// [`RejectReason`]: crate::error::RejectReason
    RequestIdReject { code: u8 },
    /// Senior defers the request (admission temporarily suspended).
    RequestIdWait,
    /// Directed kill, addressed via the frame target set.
    Kill,
    /// Split-brain notice: the sender's island is being corrected against
    /// the named foreign senior.
    Panic { foreign_senior: MemberUid },
}

impl DiscoveryMessage {
    pub fn type_id(&self) -> u16 {
        match self {
            Self::Announce { .. } => 1,
            Self::AnnounceReply { .. } => 2,
            Self::AnnounceWait => 3,
            Self::SeniorHeartbeat { .. } => 4,
            Self::RequestId { .. } => 5,
            Self::RequestIdReply { .. } => 6,
            Self::RequestIdReject { .. } => 7,
            Self::RequestIdWait => 8,
            Self::Kill => 9,
            Self::Panic { .. } => 10,
        }
    }
}

/// Directed (point-to-point) messages, type ids 33 and up. Undelivered
/// directed packets feed delivery-timeout death inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirectedMessage {
    /// Heartbeat to one peer of the current random subset.
    MemberHeartbeat { from: MemberId, sent_millis: u64 },
    /// Full membership and service snapshot sent to an inducted member.
    Induct {
        members: Vec<Member>,
        services: Vec<ServiceInfo>,
    },
    /// Handshake from a newly inducted member to each established member.
    Welcome { poll_id: u64, from: MemberId },
    /// Generic poll response.
    Ack { poll_id: u64, from: MemberId },
    /// Departure intent.
    MemberLeaving { id: MemberId },
    /// Departure record, fanned out to close out-of-order gaps.
    MemberLeft { id: MemberId, uid: MemberUid },
    /// Senior's join notification flooded to established members.
    MemberJoined { member: Member },
    /// Ask the senior to admit the sender into a named sub-service.
    ServiceJoinRequest {
        poll_id: u64,
        name: String,
        service_type: String,
        priority: u8,
        version: u32,
        token: Option<Vec<u8>>,
        sent_millis: u64,
    },
    /// Senior's answer, sent only after every peer acknowledged the
    /// joining notification.
    ServiceJoinReply {
        poll_id: u64,
        service_id: u16,
        join_time: u64,
        granted: bool,
        /// [`RejectReason`] wire code when not granted, 0 otherwise.
        ///
        /// [`RejectReason`]: crate::error::RejectReason
        code: u8,
    },
    /// Joining notification flooded to every other member.
    ServiceJoining {
        poll_id: u64,
        service_id: u16,
        name: String,
        service_type: String,
        priority: u8,
        member: MemberId,
        join_time: u64,
        version: u32,
    },
    /// Member asks the senior to take it out of a service.
    ServiceLeave { poll_id: u64, service_id: u16, member: MemberId },
    /// Senior's notice that a member left a service.
    ServiceLeft { service_id: u16, member: MemberId },
    /// Ask a witness to confirm a suspect's unreachability.
    WitnessRequest { poll_id: u64, suspect: MemberId },
    WitnessReply {
        poll_id: u64,
        suspect: MemberId,
        /// True if the witness also cannot reach the suspect.
        confirmed_dead: bool,
    },
    /// Quorum roll-call; answered with [`DirectedMessage::Ack`].
    RollCall { poll_id: u64, incident_millis: u64 },
}

impl DirectedMessage {
    pub fn type_id(&self) -> u16 {
        match self {
            Self::MemberHeartbeat { .. } => 33,
            Self::Induct { .. } => 34,
            Self::Welcome { .. } => 35,
            Self::Ack { .. } => 36,
            Self::MemberLeaving { .. } => 37,
            Self::MemberLeft { .. } => 38,
            Self::MemberJoined { .. } => 39,
            Self::ServiceJoinRequest { .. } => 40,
            Self::ServiceJoinReply { .. } => 41,
            Self::ServiceJoining { .. } => 42,
            Self::ServiceLeave { .. } => 43,
            Self::ServiceLeft { .. } => 44,
            Self::WitnessRequest { .. } => 45,
            Self::WitnessReply { .. } => 46,
            Self::RollCall { .. } => 47,
        }
    }
}

/// Either message category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Discovery(DiscoveryMessage),
    Directed(DirectedMessage),
}

impl Payload {
    pub fn type_id(&self) -> u16 {
        match self {
            Self::Discovery(m) => m.type_id(),
            Self::Directed(m) => m.type_id(),
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub proto_ver: u16,
    pub type_id: u16,
    pub sender: MemberUid,
    /// Addressed member ids; empty means every receiver.
    pub targets: Vec<MemberId>,
}

impl FrameHeader {
    pub fn is_discovery(&self) -> bool {
        self.type_id < DISCOVERY_TYPE_CUTOFF
    }

    /// Whether a member with the given id should process this frame.
    pub fn addressed_to(&self, id: MemberId) -> bool {
        self.targets.is_empty() || self.targets.contains(&id)
    }
}

/// A received frame: header always available, payload absent when the body
/// failed to decode under the local protocol version.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: FrameHeader,
    pub payload: Option<Payload>,
    pub read_error: bool,
}

/// Encode a frame for the wire.
pub fn encode_frame(
    proto_ver: u16,
    sender: MemberUid,
    targets: &[MemberId],
    payload: &Payload,
) -> FlockResult<Vec<u8>> {
    let body = match payload {
        Payload::Discovery(m) => bincode::serialize(m),
        Payload::Directed(m) => bincode::serialize(m),
    }
    .map_err(|e| FlockError::Codec(e.to_string()))?;

    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + UID_WIRE_LEN + 2 + targets.len() * 2 + body.len());
    out.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
    out.extend_from_slice(&proto_ver.to_be_bytes());
    out.extend_from_slice(&payload.type_id().to_be_bytes());
    out.extend_from_slice(&sender.to_bytes());
    out.extend_from_slice(&(targets.len() as u16).to_be_bytes());
    for t in targets {
        out.extend_from_slice(&t.to_be_bytes());
    }
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame. Fails only when the fixed prefix itself is unreadable;
/// a payload that does not parse under this build's protocol version comes
/// back as a `read_error` packet and must still be dispatched.
pub fn decode_frame(bytes: &[u8]) -> FlockResult<Packet> {
    let header_min = FRAME_PREFIX_LEN + UID_WIRE_LEN + 2;
    if bytes.len() < header_min {
        return Err(FlockError::Codec("short frame".into()));
    }
    let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if magic != FRAME_MAGIC {
        return Err(FlockError::Codec("bad frame magic".into()));
    }
    let proto_ver = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
    let type_id = u16::from_be_bytes(bytes[6..8].try_into().unwrap());
    let sender = MemberUid::from_bytes(bytes[8..24].try_into().unwrap());

    let n_targets = u16::from_be_bytes(bytes[24..26].try_into().unwrap()) as usize;
    let targets_end = 26 + n_targets * 2;
    if bytes.len() < targets_end {
        return Err(FlockError::Codec("truncated target set".into()));
    }
    let mut targets = Vec::with_capacity(n_targets);
    for i in 0..n_targets {
        let off = 26 + i * 2;
        targets.push(u16::from_be_bytes(bytes[off..off + 2].try_into().unwrap()));
    }

    let header = FrameHeader { proto_ver, type_id, sender, targets };
    let body = &bytes[targets_end..];

    let decoded: Option<Payload> = if header.is_discovery() {
        bincode::deserialize::<DiscoveryMessage>(body)
            .ok()
            .filter(|m| m.type_id() == type_id)
            .map(Payload::Discovery)
    } else {
        bincode::deserialize::<DirectedMessage>(body)
            .ok()
            .filter(|m| m.type_id() == type_id)
            .map(Payload::Directed)
    };

    let read_error = decoded.is_none();
    Ok(Packet { header, payload: decoded, read_error })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid() -> MemberUid {
        MemberUid::new(1_000, 7, 1, 42)
    }

    #[test]
    fn discovery_ids_stay_below_the_cutoff() {
        let msgs = [
            DiscoveryMessage::AnnounceWait,
            DiscoveryMessage::RequestIdWait,
            DiscoveryMessage::Kill,
            DiscoveryMessage::Panic { foreign_senior: uid() },
        ];
        for m in &msgs {
            assert!(m.type_id() < DISCOVERY_TYPE_CUTOFF, "{:?}", m);
        }
        assert!(DirectedMessage::MemberHeartbeat { from: 1, sent_millis: 0 }.type_id() >= DISCOVERY_TYPE_CUTOFF);
    }

    #[test]
    fn announce_round_trips_with_targets() {
        let msg = Payload::Discovery(DiscoveryMessage::Announce {
            cluster: "prod".into(),
            addr: "10.0.0.1:7300".parse().unwrap(),
            machine: 7,
            role: "storage".into(),
            attempt: 3,
            sent_millis: 99,
        });
        let frame = encode_frame(3, uid(), &[4, 9], &msg).unwrap();
        let pkt = decode_frame(&frame).unwrap();
        assert!(!pkt.read_error);
        assert_eq!(pkt.header.sender, uid());
        assert_eq!(pkt.header.targets, vec![4, 9]);
        assert!(pkt.header.addressed_to(4));
        assert!(!pkt.header.addressed_to(5));
        assert_eq!(pkt.payload, Some(msg));
    }

    #[test]
    fn empty_target_set_addresses_everyone() {
        let msg = Payload::Discovery(DiscoveryMessage::AnnounceWait);
        let frame = encode_frame(3, uid(), &[], &msg).unwrap();
        let pkt = decode_frame(&frame).unwrap();
        assert!(pkt.header.addressed_to(0));
        assert!(pkt.header.addressed_to(4095));
    }

    #[test]
    fn corrupt_payload_is_dispatched_as_read_error() {
        let msg = Payload::Discovery(DiscoveryMessage::RequestIdReply { id: 2, senior_id: 1 });
        let mut frame = encode_frame(3, uid(), &[], &msg).unwrap();
        frame.truncate(frame.len() - 3);
        let pkt = decode_frame(&frame).unwrap();
        assert!(pkt.read_error);
        assert!(pkt.payload.is_none());
        // The header survives so the receiver can still answer the sender.
        assert_eq!(pkt.header.type_id, 6);
        assert_eq!(pkt.header.sender, uid());
    }

    #[test]
    fn bad_magic_is_unattributable() {
        let msg = Payload::Discovery(DiscoveryMessage::Kill);
        let mut frame = encode_frame(3, uid(), &[1], &msg).unwrap();
        frame[0] ^= 0xFF;
        assert!(decode_frame(&frame).is_err());
    }
}

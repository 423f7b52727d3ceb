/// Member identity and per-member runtime state.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

/// Small integer member id, unique among live members. An id freed by a
/// departure is only reissued after the recycle-retention window expires.
pub type MemberId = u16;

/// 128-bit member identity, totally ordered by birth time with the
/// remaining bits as tie-break. A lower (older) uid is more senior; the
/// most senior live member coordinates admission for the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberUid {
    /// Birth timestamp, milliseconds since the cluster time epoch.
    pub born_millis: u64,
    /// Machine identifier (hash of host identity).
    pub machine: u32,
    /// Process identifier on that machine.
    pub process: u16,
    /// Random salt distinguishing same-millisecond births.
    pub salt: u16,
}

impl MemberUid {
    pub fn new(born_millis: u64, machine: u32, process: u16, salt: u16) -> Self {
        Self { born_millis, machine, process, salt }
    }

    /// Generate a fresh uid for a process being born now.
    pub fn generate(born_millis: u64, machine: u32, process: u16) -> Self {
        Self {
            born_millis,
            machine,
            process,
            salt: rand::random::<u16>(),
        }
    }

    /// True if `self` is more senior (older) than `other`.
    pub fn is_senior_to(&self, other: &MemberUid) -> bool {
        self < other
    }

    /// Fixed 16-byte wire form, big-endian fields in comparison order.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.born_millis.to_be_bytes());
        out[8..12].copy_from_slice(&self.machine.to_be_bytes());
        out[12..14].copy_from_slice(&self.process.to_be_bytes());
        out[14..16].copy_from_slice(&self.salt.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            born_millis: u64::from_be_bytes(bytes[..8].try_into().unwrap()),
            machine: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            process: u16::from_be_bytes(bytes[12..14].try_into().unwrap()),
            salt: u16::from_be_bytes(bytes[14..16].try_into().unwrap()),
        }
    }
}

impl PartialOrd for MemberUid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemberUid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.born_millis
            .cmp(&other.born_millis)
            .then(self.machine.cmp(&other.machine))
            .then(self.process.cmp(&other.process))
            .then(self.salt.cmp(&other.salt))
    }
}

impl fmt::Display for MemberUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:012x}-{:08x}-{:04x}-{:04x}",
            self.born_millis, self.machine, self.process, self.salt
        )
    }
}

/// A cluster member: identity plus the mutable attributes every component
/// reads and the protocol engine alone writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Assigned small integer id.
    pub id: MemberId,
    /// Globally unique birth-ordered identity.
    pub uid: MemberUid,
    /// Network address for directed delivery.
    pub addr: SocketAddr,
    /// Machine identifier, used for witness and ring buddy placement.
    pub machine: u32,
    /// Process name, informational.
    pub process: String,
    /// Role name, used to avoid same-role ring collocation.
    pub role: String,

    // Per-peer liveness timestamps, cluster safe-time milliseconds.
    pub last_outgoing: u64,
    pub last_incoming: u64,
    pub last_slow: u64,
    pub last_timeout: u64,
    pub last_heuristic_death: u64,

    /// Consecutive timeout windows observed while the member was slow.
    pub timeout_windows: u32,

    /// Suspected; a confirmation (witness poll or roll-call) is in flight.
    pub deaf: bool,
    /// Confirmed departed.
    pub dead: bool,
    /// Confirmed dead but still transmitting; shunned.
    pub zombie: bool,
    /// Announced intent to leave.
    pub leaving: bool,
    /// Flagged by delivery-timeout detection.
    pub timed_out: bool,
}

impl Member {
    pub fn new(id: MemberId, uid: MemberUid, addr: SocketAddr) -> Self {
        Self {
            id,
            uid,
            addr,
            machine: uid.machine,
            process: String::new(),
            role: String::new(),
            last_outgoing: 0,
            last_incoming: 0,
            last_slow: 0,
            last_timeout: 0,
            last_heuristic_death: 0,
            timeout_windows: 0,
            deaf: false,
            dead: false,
            zombie: false,
            leaving: false,
            timed_out: false,
        }
    }

    /// A member counts as live until its departure is confirmed.
    pub fn is_live(&self) -> bool {
        !self.dead && !self.zombie
    }

    /// Record inbound traffic. Clears the timed-out flag but not the
    /// consecutive-window counter: a slow member keeps transmitting, and
    /// the counter is what separates slow from dead.
    pub fn touch_incoming(&mut self, now_millis: u64) {
        self.last_incoming = now_millis;
        self.timed_out = false;
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member {} ({} at {})", self.id, self.uid, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_order_is_birth_time_first() {
        let old = MemberUid::new(100, 9, 9, 9);
        let young = MemberUid::new(200, 1, 1, 1);
        assert!(old < young);
        assert!(old.is_senior_to(&young));
    }

    #[test]
    fn uid_tie_break_on_machine_then_process_then_salt() {
        let a = MemberUid::new(100, 1, 2, 3);
        let b = MemberUid::new(100, 1, 2, 4);
        let c = MemberUid::new(100, 2, 0, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn uid_bytes_round_trip_preserves_order() {
        let a = MemberUid::new(5, 6, 7, 8);
        assert_eq!(MemberUid::from_bytes(&a.to_bytes()), a);

        let b = MemberUid::new(5, 6, 7, 9);
        // Byte-lexicographic order matches the comparison order.
        assert!(a.to_bytes() < b.to_bytes());
        assert!(a < b);
    }

    #[test]
    fn fresh_traffic_clears_timed_out_but_not_windows() {
        let uid = MemberUid::new(1, 1, 1, 1);
        let mut m = Member::new(3, uid, "127.0.0.1:7300".parse().unwrap());
        m.timed_out = true;
        m.timeout_windows = 2;
        m.touch_incoming(42);
        assert_eq!(m.last_incoming, 42);
        assert!(!m.timed_out);
        assert_eq!(m.timeout_windows, 2);
    }
}

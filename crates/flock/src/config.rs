//! Cluster configuration.
//!
//! Policy values (attempt-limit fractions, bind-check divisor, timeout
//! windows) are deliberately configuration, not hard-coded: their absolute
//! values are tunable, while the protocol preserves their relative ordering
//! (the bind check is never consulted before a third of the announce
//! attempts have elapsed).

use std::net::SocketAddr;
use std::time::Duration;

use flock_proto::constants::FLOCK_PROTO_VER;
use flock_proto::defaults::*;

/// Everything a member needs to know before it can announce itself.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name; mismatches are rejected at join time.
    pub cluster: String,
    /// This member's address for directed delivery.
    pub addr: SocketAddr,
    /// Machine identifier (hash of host identity).
    pub machine: u32,
    /// Process name, informational.
    pub process: String,
    /// Role name, used for ring buddy placement.
    pub role: String,
    /// Well-known-address list; empty selects multicast mode.
    pub wka: Vec<SocketAddr>,
    /// Membership protocol version.
    pub proto_ver: u16,
    /// Negotiated maximum packet size (bytes).
    pub max_packet_size: u32,
    /// Edition label; must match across the cluster.
    pub edition: String,
    /// Operational mode label; must match across the cluster.
    pub mode: String,
    /// License mode forwarded to the injected validator.
    pub license_mode: u8,

    pub announce_interval: Duration,
    pub broadcast_timeout: Duration,
    pub bind_check_divisor: u32,
    pub rtt_variance: Duration,
    pub rtt_variance_growth: u32,
    pub leave_grace: Duration,

    pub heartbeat_interval: Duration,
    pub heartbeat_spread: u32,
    pub delivery_timeout: Duration,
    pub slow_tolerance: Duration,
    pub slow_confirm_windows: u32,
    pub witness_count: usize,

    pub rollcall_reissue: Duration,
    pub moratorium: Duration,

    pub recycle_retention: Duration,
    pub zombie_expiry: Duration,

    pub service_join_sweep: Duration,
    pub service_join_overdue: Duration,
}

impl ClusterConfig {
    pub fn new(cluster: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            cluster: cluster.into(),
            addr,
            machine: default_machine_id(addr),
            process: String::from("flockd"),
            role: String::new(),
            wka: Vec::new(),
            proto_ver: FLOCK_PROTO_VER,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            edition: String::from("community"),
            mode: String::from("prod"),
            license_mode: 0,
            announce_interval: Duration::from_millis(DEFAULT_ANNOUNCE_INTERVAL_MS),
            broadcast_timeout: Duration::from_millis(DEFAULT_BROADCAST_TIMEOUT_MS),
            bind_check_divisor: DEFAULT_BIND_CHECK_DIVISOR,
            rtt_variance: Duration::from_millis(DEFAULT_RTT_VARIANCE_MS),
            rtt_variance_growth: DEFAULT_RTT_VARIANCE_GROWTH,
            leave_grace: Duration::from_millis(DEFAULT_LEAVE_GRACE_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_spread: DEFAULT_HEARTBEAT_SPREAD,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            slow_tolerance: Duration::from_millis(DEFAULT_SLOW_TOLERANCE_MS),
            slow_confirm_windows: DEFAULT_SLOW_CONFIRM_WINDOWS,
            witness_count: DEFAULT_WITNESS_COUNT,
            rollcall_reissue: Duration::from_millis(DEFAULT_ROLLCALL_REISSUE_MS),
            moratorium: Duration::from_millis(DEFAULT_MORATORIUM_MS),
            recycle_retention: Duration::from_secs(DEFAULT_RECYCLE_RETENTION_SECS),
            zombie_expiry: Duration::from_secs(DEFAULT_ZOMBIE_EXPIRY_SECS),
            service_join_sweep: Duration::from_millis(DEFAULT_SERVICE_JOIN_SWEEP_MS),
            service_join_overdue: Duration::from_millis(DEFAULT_SERVICE_JOIN_OVERDUE_MS),
        }
    }

    /// Number of announce broadcasts before a candidate may self-elect.
    pub fn attempt_limit(&self) -> u32 {
        let interval = self.announce_interval.as_millis().max(1) as u64;
        ((self.broadcast_timeout.as_millis() as u64 + interval - 1) / interval).max(1) as u32
    }

    /// Attempt count from which the cluster-port bind check is consulted.
    pub fn bind_check_threshold(&self) -> u32 {
        (self.attempt_limit() / self.bind_check_divisor.max(1)).max(1)
    }

    /// Well-known-address mode is selected by a non-empty WKA list.
    pub fn wka_mode(&self) -> bool {
        !self.wka.is_empty()
    }

    /// In WKA mode only listed addresses may form a new cluster.
    pub fn addr_authorized(&self) -> bool {
        self.wka.is_empty() || self.wka.contains(&self.addr)
    }

    /// Shrink every protocol timer, for tests that drive real engines.
    pub fn with_fast_timers(mut self) -> Self {
        self.announce_interval = Duration::from_millis(20);
        self.broadcast_timeout = Duration::from_millis(180);
        self.leave_grace = Duration::from_millis(20);
        self.heartbeat_interval = Duration::from_millis(40);
        self.delivery_timeout = Duration::from_millis(300);
        self.slow_tolerance = Duration::from_millis(250);
        self.rollcall_reissue = Duration::from_millis(100);
        self.moratorium = Duration::from_millis(400);
        self.service_join_sweep = Duration::from_millis(100);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_machine(mut self, machine: u32) -> Self {
        self.machine = machine;
        self
    }

    pub fn with_wka(mut self, wka: Vec<SocketAddr>) -> Self {
        self.wka = wka;
        self
    }
}

/// Derive a machine id from the bind address when none is configured.
fn default_machine_id(addr: SocketAddr) -> u32 {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        std::net::IpAddr::V6(v6) => {
            let o = v6.octets();
            u32::from_be_bytes([o[12], o[13], o[14], o[15]])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_limit_is_timeout_over_interval() {
        let mut cfg = ClusterConfig::new("t", "127.0.0.1:7300".parse().unwrap());
        cfg.announce_interval = Duration::from_millis(1_000);
        cfg.broadcast_timeout = Duration::from_millis(9_000);
        assert_eq!(cfg.attempt_limit(), 9);
        assert_eq!(cfg.bind_check_threshold(), 3);
    }

    #[test]
    fn bind_check_never_precedes_a_third_of_attempts() {
        let cfg = ClusterConfig::new("t", "127.0.0.1:7300".parse().unwrap());
        assert!(cfg.bind_check_threshold() >= cfg.attempt_limit() / 3);
        assert!(cfg.bind_check_threshold() >= 1);
    }

    #[test]
    fn wka_mode_authorization() {
        let addr: SocketAddr = "10.0.0.1:7300".parse().unwrap();
        let other: SocketAddr = "10.0.0.2:7300".parse().unwrap();
        let cfg = ClusterConfig::new("t", addr);
        assert!(!cfg.wka_mode());
        assert!(cfg.addr_authorized());

        let cfg = ClusterConfig::new("t", addr).with_wka(vec![other]);
        assert!(cfg.wka_mode());
        assert!(!cfg.addr_authorized());
    }
}

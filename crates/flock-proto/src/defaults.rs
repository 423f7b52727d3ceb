//! Tunable operational defaults for the flock membership protocol.
//!
//! Protocol-level constants (wire format, namespaces, magic numbers) remain
//! in [`crate::constants`]. This module centralizes the configurable
//! defaults that can be overridden via CLI flags or `ClusterConfig`.

// ─── Discovery / Join ───────────────────────────────────────────────────────

/// Interval between presence announce broadcasts (milliseconds).
pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 1_000;

/// Total time spent announcing before a candidate may self-elect
/// (milliseconds). The announce attempt limit is this divided by the
/// announce interval.
pub const DEFAULT_BROADCAST_TIMEOUT_MS: u64 = 9_000;

/// The cluster-port bind check is only consulted once the attempt counter
/// reaches `attempt_limit / bind_check_divisor`. The check never runs
/// earlier regardless of other settings.
pub const DEFAULT_BIND_CHECK_DIVISOR: u32 = 3;

/// Round-trip variance bound for accepting a senior's time adjustment
/// (milliseconds).
pub const DEFAULT_RTT_VARIANCE_MS: u64 = 200;

/// Multiplier applied to the variance bound each time an adjustment sample
/// is rejected for excessive round-trip time.
pub const DEFAULT_RTT_VARIANCE_GROWTH: u32 = 2;

/// Grace delay between announcing intent to leave and broadcasting the
/// departure record (milliseconds).
pub const DEFAULT_LEAVE_GRACE_MS: u64 = 500;

// ─── Failure Detection ──────────────────────────────────────────────────────

/// Interval between directed heartbeat rounds (milliseconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Heartbeat spread factor: each round heartbeats
/// `ceil(live_others / spread)` randomly chosen peers, so every peer is
/// covered within `spread` intervals.
pub const DEFAULT_HEARTBEAT_SPREAD: u32 = 3;

/// Delivery timeout after which an unanswered directed packet is reported
/// as undeliverable (milliseconds).
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 15_000;

/// A suspect whose last incoming traffic is within this window is "slow",
/// not dead (milliseconds).
pub const DEFAULT_SLOW_TOLERANCE_MS: u64 = 5_000;

/// Number of further consecutive timeout windows a slow member is granted
/// before suspicion escalates.
pub const DEFAULT_SLOW_CONFIRM_WINDOWS: u32 = 2;

/// Maximum number of witnesses polled to confirm a suspect.
pub const DEFAULT_WITNESS_COUNT: usize = 2;

// ─── Quorum / Recovery ──────────────────────────────────────────────────────

/// Interval between roll-call re-issues while convictions are outstanding
/// (milliseconds).
pub const DEFAULT_ROLLCALL_REISSUE_MS: u64 = 3_000;

/// Moratorium on new disconnections after a full roll-call recovery
/// (milliseconds).
pub const DEFAULT_MORATORIUM_MS: u64 = 5_000;

// ─── Registry ───────────────────────────────────────────────────────────────

/// Retention window for recycled (recently dead) member records before
/// their ids may be reissued (seconds).
pub const DEFAULT_RECYCLE_RETENTION_SECS: u64 = 300;

/// Lifetime of a zombie record; admission stays suspended while any record
/// is active (seconds).
pub const DEFAULT_ZOMBIE_EXPIRY_SECS: u64 = 300;

// ─── Service Coordination ───────────────────────────────────────────────────

/// Sweep interval for the pending cluster-join index held while a
/// service-join notification poll is outstanding (milliseconds).
pub const DEFAULT_SERVICE_JOIN_SWEEP_MS: u64 = 5_000;

/// Pending cluster-join entries older than this are dropped by the sweep
/// (milliseconds). The candidate re-announces on its own schedule.
pub const DEFAULT_SERVICE_JOIN_OVERDUE_MS: u64 = 30_000;

// ─── Packet / Channel Sizing ────────────────────────────────────────────────

/// Default maximum packet size negotiated at join time (bytes).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 64 * 1024;

/// Channel buffer size for the engine's inbound input queue.
pub const DEFAULT_ENGINE_QUEUE_SIZE: usize = 512;

/// Channel buffer size for the outbound membership event stream.
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 256;

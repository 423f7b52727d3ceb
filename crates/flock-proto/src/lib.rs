//! # flock-proto
//!
//! Protocol types, wire messages, constants, and error taxonomy for the
//! flock cluster membership runtime.
//!
//! This crate defines the member identity model, the discovery and directed
//! message namespaces, the frame codec, and the closed set of join
//! rejection reasons shared by all flock components.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod member;
pub mod message;
pub mod service;

// Re-export commonly used types at the crate root
pub use error::{FlockError, FlockResult, RejectReason};
pub use member::{Member, MemberId, MemberUid};
pub use message::{DirectedMessage, DiscoveryMessage, Packet, Payload};
pub use service::{ServiceInfo, ServiceMemberState, ServicePhase};

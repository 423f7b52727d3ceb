//! # flock
//!
//! The membership and failure-detection core of a peer-to-peer cluster
//! runtime: who is in the cluster, which member is senior, who is dead,
//! and which sub-services run where — decided with no external
//! coordinator, from broadcast/unicast messages and heuristic timeouts.
//!
//! The engine runs as a single logical actor (see [`engine`]); everything
//! outside it only enqueues inputs. The transport is an external
//! collaborator behind [`transport::Transport`]; [`transport::LoopbackMesh`]
//! wires engines together in-process for tests and single-node use.

pub mod config;
pub mod detect;
pub mod engine;
pub mod events;
pub mod join;
pub mod panic;
pub mod policy;
pub mod poll;
pub mod quorum;
pub mod registry;
pub mod ring;
pub mod services;
pub mod transport;

// Re-export the surface a hosting framework needs.
pub use config::ClusterConfig;
pub use engine::{spawn_on_mesh, ClusterHandle, Engine, Input, StatusReport};
pub use events::{HaltReason, MembershipEvent};
pub use policy::{DisconnectPolicy, LicenseValidator, TokenValidator};
pub use transport::{Destination, LoopbackMesh, Transport};

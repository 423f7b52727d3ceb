//! Flock membership daemon (flockd).
//!
//! Runs one cluster member and logs membership events. The in-process
//! loopback transport makes a single-node cluster; the real datagram
//! transport is an external collaborator and plugs in behind the same
//! [`flock::Transport`] trait.
//!
//! Usage:
//!   flockd --cluster prod --bind 127.0.0.1:7300

use std::net::SocketAddr;

use clap::Parser;
use tracing::{info, warn};

use flock::{spawn_on_mesh, ClusterConfig, LoopbackMesh, MembershipEvent};
use flock_proto::constants::FLOCK_LISTEN_PORT;

/// Flock cluster membership daemon
#[derive(Parser, Debug)]
#[command(name = "flockd", version, about = "Flock cluster membership daemon")]
struct Args {
    /// Cluster name
    #[arg(short = 'c', long, default_value = "flock")]
    cluster: String,

    /// Bind address
    #[arg(short = 'b', long, default_value_t = default_bind())]
    bind: SocketAddr,

    /// Role name for ring buddy placement
    #[arg(short = 'r', long, default_value = "")]
    role: String,

    /// Well-known addresses (repeatable); empty selects multicast mode
    #[arg(short = 'w', long = "wka")]
    wka: Vec<SocketAddr>,

    /// Edition label; must match across the cluster
    #[arg(long, default_value = "community")]
    edition: String,

    /// Operational mode label; must match across the cluster
    #[arg(long, default_value = "prod")]
    mode: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], FLOCK_LISTEN_PORT))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = ClusterConfig::new(args.cluster.clone(), args.bind)
        .with_role(args.role)
        .with_wka(args.wka);

    info!("flockd starting for cluster '{}' at {}", args.cluster, args.bind);

    let mesh = LoopbackMesh::new();
    let (handle, mut events, task) = spawn_on_mesh(config, &mesh);

    let event_loop = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MembershipEvent::MemberJoined(m) => info!("joined: {}", m),
                MembershipEvent::MemberLeaving(id) => info!("leaving: member {}", id),
                MembershipEvent::MemberLeft(m) => info!("left: {}", m),
                MembershipEvent::ServiceJoining { service_id, member } => {
                    info!("service {}: member {} joining", service_id, member)
                }
                MembershipEvent::ServiceJoined { service_id, member } => {
                    info!("service {}: member {} joined", service_id, member)
                }
                MembershipEvent::ServiceLeaving { service_id, member } => {
                    info!("service {}: member {} leaving", service_id, member)
                }
                MembershipEvent::ServiceLeft { service_id, member } => {
                    info!("service {}: member {} left", service_id, member)
                }
                MembershipEvent::MembersTimedOut(ids) => {
                    warn!("members timed out: {:?}", ids)
                }
                MembershipEvent::SelfTerminated(reason) => {
                    warn!("terminated: {:?}", reason);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = handle.leave().await;
        }
        _ = event_loop => {}
    }

    let _ = task.await;
}

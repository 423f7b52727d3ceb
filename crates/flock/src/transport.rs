//! Transport boundary.
//!
//! The byte-level transport (datagram/stream delivery, multicast or
//! WKA-simulated broadcast, congestion control) is an external
//! collaborator; the engine consumes it through the [`Transport`] trait and
//! never blocks on it. Undeliverable directed packets come back to the
//! engine as delivery-timeout inputs rather than errors.
//!
//! [`LoopbackMesh`] is the in-process implementation wiring several engines
//! together over channels. It backs the integration tests and single-node
//! deployments; dropping a node from the mesh models both datagram loss and
//! liveness-ring connection teardown.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use flock_proto::error::FlockResult;
use flock_proto::message::decode_frame;

use crate::engine::{Inbound, Input};

/// Where a frame is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The shared broadcast medium; self-audible.
    Broadcast,
    /// Point-to-point delivery.
    Unicast(SocketAddr),
}

/// Fire-and-forget frame delivery plus the transport's monotonic clock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post a frame. Broadcasts reach every member including the sender;
    /// unicast failures surface later as delivery-timeout inputs.
    async fn post(&self, dest: Destination, frame: Vec<u8>) -> FlockResult<()>;

    /// Cluster-wide safe time in milliseconds. Monotonic, shared basis.
    fn current_safe_time(&self) -> u64;

    /// Try to take the cluster port for a brand-new cluster. Only one
    /// candidate per cluster name can hold it at a time.
    async fn bind_cluster_port(&self, cluster: &str) -> bool;

    /// Give the cluster port back (a candidate that bound it but then
    /// joined an existing cluster must not keep blocking formation).
    async fn release_cluster_port(&self, cluster: &str);

    fn local_addr(&self) -> SocketAddr;
}

struct MeshInner {
    nodes: HashMap<SocketAddr, mpsc::Sender<Input>>,
    unreachable: HashSet<SocketAddr>,
    bound: HashMap<String, SocketAddr>,
    /// How long an undeliverable unicast "waits" before the sender's
    /// delivery timeout fires; models the real transport's timeout.
    delivery_delay: Duration,
}

/// In-process broadcast medium connecting engines by address.
pub struct LoopbackMesh {
    /// Basis of the mesh-wide safe time.
    epoch: Instant,
    inner: Mutex<MeshInner>,
}

impl LoopbackMesh {
    /// Create an empty mesh. Must run inside a tokio runtime; the safe
    /// time is anchored to the runtime clock.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            inner: Mutex::new(MeshInner {
                nodes: HashMap::new(),
                unreachable: HashSet::new(),
                bound: HashMap::new(),
                delivery_delay: Duration::ZERO,
            }),
        })
    }

    /// Delay between a failed unicast and the sender's delivery-timeout
    /// signal.
    pub fn set_delivery_delay(&self, delay: Duration) {
        self.inner.lock().expect("mesh lock").delivery_delay = delay;
    }

    /// Attach an engine's input queue at an address and get its transport.
    pub fn attach(
        self: &Arc<Self>,
        addr: SocketAddr,
        input_tx: mpsc::Sender<Input>,
    ) -> Arc<LoopbackTransport> {
        let mut inner = self.inner.lock().expect("mesh lock");
        inner.nodes.insert(addr, input_tx.clone());
        Arc::new(LoopbackTransport { mesh: Arc::clone(self), addr, self_tx: input_tx })
    }

    /// Tear a node out of the mesh. Every remaining node observes the
    /// connection loss as a ring-down signal for that address.
    pub fn detach(&self, addr: SocketAddr) {
        let peers: Vec<mpsc::Sender<Input>> = {
            let mut inner = self.inner.lock().expect("mesh lock");
            inner.nodes.remove(&addr);
            inner.bound.retain(|_, holder| *holder != addr);
            inner.nodes.values().cloned().collect()
        };
        for tx in peers {
            let _ = tx.try_send(Input::RingDown { addr });
        }
    }

    /// Simulate a partition: an unreachable node exchanges traffic with
    /// nobody but itself.
    pub fn set_unreachable(&self, addr: SocketAddr, unreachable: bool) {
        let mut inner = self.inner.lock().expect("mesh lock");
        if unreachable {
            inner.unreachable.insert(addr);
        } else {
            inner.unreachable.remove(&addr);
        }
    }

    fn millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// One node's view of the mesh.
pub struct LoopbackTransport {
    mesh: Arc<LoopbackMesh>,
    addr: SocketAddr,
    self_tx: mpsc::Sender<Input>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn post(&self, dest: Destination, frame: Vec<u8>) -> FlockResult<()> {
        let packet = decode_frame(&frame)?;
        match dest {
            Destination::Broadcast => {
                let targets: Vec<(SocketAddr, mpsc::Sender<Input>)> = {
                    let inner = self.mesh.inner.lock().expect("mesh lock");
                    let cut = inner.unreachable.contains(&self.addr);
                    inner
                        .nodes
                        .iter()
                        .filter(|(a, _)| {
                            // A partitioned node only hears itself.
                            **a == self.addr || (!cut && !inner.unreachable.contains(a))
                        })
                        .map(|(a, tx)| (*a, tx.clone()))
                        .collect()
                };
                for (a, tx) in targets {
                    let input = Input::Packet(Inbound { packet: packet.clone(), from: self.addr });
                    if tx.try_send(input).is_err() {
                        trace!("broadcast to {} dropped (queue full)", a);
                    }
                }
                Ok(())
            }
            Destination::Unicast(dest_addr) => {
                let (target, delay) = {
                    let inner = self.mesh.inner.lock().expect("mesh lock");
                    let target = if inner.unreachable.contains(&self.addr)
                        || inner.unreachable.contains(&dest_addr)
                    {
                        None
                    } else {
                        inner.nodes.get(&dest_addr).cloned()
                    };
                    (target, inner.delivery_delay)
                };
                let delivered = match target {
                    Some(tx) => {
                        let input = Input::Packet(Inbound { packet, from: self.addr });
                        // A closed queue means the node is gone; that is an
                        // undeliverable packet too.
                        tx.try_send(input).is_ok()
                    }
                    None => false,
                };
                if !delivered {
                    debug!("unicast to {} undeliverable", dest_addr);
                    let self_tx = self.self_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = self_tx.send(Input::DeliveryTimeout { addr: dest_addr }).await;
                    });
                }
                Ok(())
            }
        }
    }

    fn current_safe_time(&self) -> u64 {
        self.mesh.millis()
    }

    async fn bind_cluster_port(&self, cluster: &str) -> bool {
        let mut inner = self.mesh.inner.lock().expect("mesh lock");
        match inner.bound.get(cluster) {
            Some(holder) => *holder == self.addr,
            None => {
                inner.bound.insert(cluster.to_string(), self.addr);
                true
            }
        }
    }

    async fn release_cluster_port(&self, cluster: &str) {
        let mut inner = self.mesh.inner.lock().expect("mesh lock");
        if inner.bound.get(cluster) == Some(&self.addr) {
            inner.bound.remove(cluster);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl LoopbackTransport {
    pub fn mesh(&self) -> &Arc<LoopbackMesh> {
        &self.mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_proto::member::MemberUid;
    use flock_proto::message::{encode_frame, DiscoveryMessage, Payload};

    fn frame() -> Vec<u8> {
        encode_frame(
            3,
            MemberUid::new(1, 1, 1, 1),
            &[],
            &Payload::Discovery(DiscoveryMessage::AnnounceWait),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn broadcast_is_self_audible() {
        let mesh = LoopbackMesh::new();
        let (tx, mut rx) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:7301".parse().unwrap();
        let transport = mesh.attach(addr, tx);

        transport.post(Destination::Broadcast, frame()).await.unwrap();
        match rx.recv().await {
            Some(Input::Packet(inbound)) => assert_eq!(inbound.from, addr),
            other => panic!("expected own broadcast, got {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn unicast_to_missing_node_reports_delivery_timeout() {
        let mesh = LoopbackMesh::new();
        let (tx, mut rx) = mpsc::channel(8);
        let addr: SocketAddr = "127.0.0.1:7302".parse().unwrap();
        let gone: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let transport = mesh.attach(addr, tx);

        transport.post(Destination::Unicast(gone), frame()).await.unwrap();
        match rx.recv().await {
            Some(Input::DeliveryTimeout { addr: a }) => assert_eq!(a, gone),
            _ => panic!("expected delivery timeout"),
        }
    }

    #[tokio::test]
    async fn first_binder_holds_the_cluster_port() {
        let mesh = LoopbackMesh::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let a = mesh.attach("127.0.0.1:7303".parse().unwrap(), tx_a);
        let b = mesh.attach("127.0.0.1:7304".parse().unwrap(), tx_b);

        assert!(a.bind_cluster_port("prod").await);
        assert!(!b.bind_cluster_port("prod").await);
        // Re-checking is idempotent for the holder.
        assert!(a.bind_cluster_port("prod").await);
    }
}

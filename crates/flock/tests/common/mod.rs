//! Shared helpers for engine integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use flock::{ClusterConfig, ClusterHandle, MembershipEvent, StatusReport};

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Config with every protocol timer shrunk so tests run in milliseconds.
pub fn fast_config(cluster: &str, port: u16) -> ClusterConfig {
    ClusterConfig::new(cluster, addr(port)).with_fast_timers()
}

/// Poll the engine's status until a predicate holds.
pub async fn wait_for(
    handle: &ClusterHandle,
    what: &str,
    pred: impl Fn(&StatusReport) -> bool,
) -> StatusReport {
    for _ in 0..500 {
        if let Ok(status) = handle.status().await {
            if pred(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_joined(handle: &ClusterHandle) -> StatusReport {
    wait_for(handle, "member to join", |s| s.state == "joined").await
}

/// Drain events until one matches, panicking after a bounded wait.
pub async fn expect_event(
    rx: &mut mpsc::Receiver<MembershipEvent>,
    what: &str,
    pred: impl Fn(&MembershipEvent) -> bool,
) -> MembershipEvent {
    for _ in 0..500 {
        match tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            Ok(Some(event)) => {
                if pred(&event) {
                    return event;
                }
            }
            Ok(None) => break,
            Err(_) => {}
        }
    }
    panic!("timed out waiting for event: {what}");
}

//! Single-engine integration tests: cluster formation, service joins with
//! no peers, graceful departure.

mod common;

use common::{expect_event, fast_config, wait_joined};
use flock::{spawn_on_mesh, HaltReason, LoopbackMesh, MembershipEvent};

#[tokio::test(start_paused = true)]
async fn lone_candidate_forms_a_new_cluster_and_is_senior() {
    let mesh = LoopbackMesh::new();
    let (handle, mut events, _task) = spawn_on_mesh(fast_config("solo", 7300), &mesh);

    let status = wait_joined(&handle).await;
    assert_eq!(status.live_members, 1);
    assert_eq!(status.senior, status.id);

    let event = expect_event(&mut events, "own join", |e| {
        matches!(e, MembershipEvent::MemberJoined(_))
    })
    .await;
    match event {
        MembershipEvent::MemberJoined(m) => assert_eq!(Some(m.id), status.id),
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn service_join_with_no_peers_succeeds_immediately() {
    let mesh = LoopbackMesh::new();
    let (handle, mut events, _task) = spawn_on_mesh(fast_config("solo", 7310), &mesh);
    wait_joined(&handle).await;

    let service_id = handle
        .join_service("cache", "partitioned", 5, 1, None)
        .await
        .expect("join with no peers");
    assert!(service_id >= 1);

    expect_event(&mut events, "service joined", |e| {
        matches!(e, MembershipEvent::ServiceJoined { .. })
    })
    .await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.services, 1);
}

#[tokio::test(start_paused = true)]
async fn graceful_leave_halts_the_engine() {
    let mesh = LoopbackMesh::new();
    let (handle, _events, task) = spawn_on_mesh(fast_config("solo", 7320), &mesh);
    wait_joined(&handle).await;

    handle.leave().await.expect("leave");
    let reason = task.await.expect("engine task");
    assert_eq!(reason, HaltReason::Left);
}

#[tokio::test(start_paused = true)]
async fn leaving_twice_is_harmless() {
    let mesh = LoopbackMesh::new();
    let (handle, _events, task) = spawn_on_mesh(fast_config("solo", 7330), &mesh);
    wait_joined(&handle).await;

    handle.leave().await.expect("first leave");
    // The engine is gone; a second leave reports termination, not a hang.
    assert!(handle.leave().await.is_err());
    let _ = task.await;
}

//! Multi-engine integration tests over the loopback mesh: join flows,
//! senior convergence, failure detection, quorum, and zombie shunning.

mod common;

use std::time::Duration;

use common::{addr, expect_event, fast_config, wait_for, wait_joined};
use flock::engine::{Inbound, Input};
use flock::{spawn_on_mesh, HaltReason, LoopbackMesh, MembershipEvent};
use flock_proto::message::{encode_frame, DiscoveryMessage, Payload};

#[tokio::test(start_paused = true)]
async fn late_joiner_agrees_on_the_senior() {
    let mesh = LoopbackMesh::new();
    let (a, _a_events, _a_task) = spawn_on_mesh(fast_config("prod", 7400), &mesh);
    let a_status = wait_joined(&a).await;

    let (b, _b_events, _b_task) = spawn_on_mesh(fast_config("prod", 7401), &mesh);
    let b_status = wait_joined(&b).await;

    // The elder (first) member formed the cluster and stays senior.
    assert_eq!(b_status.senior, a_status.id);
    let a_status = wait_for(&a, "two members at a", |s| s.live_members == 2).await;
    assert_eq!(a_status.senior, a_status.id);
    assert_eq!(b_status.live_members, 2);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_candidates_form_exactly_one_cluster() {
    let mesh = LoopbackMesh::new();
    let (a, _a_events, _a_task) = spawn_on_mesh(fast_config("prod", 7410), &mesh);
    let (b, _b_events, _b_task) = spawn_on_mesh(fast_config("prod", 7411), &mesh);

    let a_status = wait_for(&a, "a sees both members", |s| {
        s.state == "joined" && s.live_members == 2
    })
    .await;
    let b_status = wait_for(&b, "b sees both members", |s| {
        s.state == "joined" && s.live_members == 2
    })
    .await;

    // One cluster, one senior, from both points of view.
    assert_eq!(a_status.senior, b_status.senior);
}

#[tokio::test(start_paused = true)]
async fn graceful_leave_reaches_the_remaining_member() {
    let mesh = LoopbackMesh::new();
    let (a, mut a_events, _a_task) = spawn_on_mesh(fast_config("prod", 7420), &mesh);
    wait_joined(&a).await;
    let (b, _b_events, b_task) = spawn_on_mesh(fast_config("prod", 7421), &mesh);
    let b_status = wait_joined(&b).await;
    wait_for(&a, "a sees b", |s| s.live_members == 2).await;

    b.leave().await.expect("b leaves");
    assert_eq!(b_task.await.unwrap(), HaltReason::Left);

    let event = expect_event(&mut a_events, "b's departure", |e| {
        matches!(e, MembershipEvent::MemberLeft(_))
    })
    .await;
    match event {
        MembershipEvent::MemberLeft(m) => assert_eq!(Some(m.id), b_status.id),
        _ => unreachable!(),
    }
    let a_status = wait_for(&a, "a back to one member", |s| s.live_members == 1).await;
    assert_eq!(a_status.senior, a_status.id);
}

#[tokio::test(start_paused = true)]
async fn senior_departure_converges_on_the_next_elder() {
    let mesh = LoopbackMesh::new();
    let (a, _ae, a_task) = spawn_on_mesh(fast_config("prod", 7430), &mesh);
    wait_joined(&a).await;
    let (b, _be, _bt) = spawn_on_mesh(fast_config("prod", 7431), &mesh);
    wait_joined(&b).await;
    let (c, _ce, _ct) = spawn_on_mesh(fast_config("prod", 7432), &mesh);
    wait_joined(&c).await;
    wait_for(&a, "full cluster", |s| s.live_members == 3).await;

    a.leave().await.expect("senior leaves");
    let _ = a_task.await;

    let b_status = wait_for(&b, "b drops the senior", |s| s.live_members == 2).await;
    let c_status = wait_for(&c, "c drops the senior", |s| s.live_members == 2).await;
    // Senior election is computed, not voted: both name the same survivor.
    assert_eq!(b_status.senior, c_status.senior);
    assert_eq!(b_status.senior, b_status.id.min(c_status.id));
}

#[tokio::test(start_paused = true)]
async fn service_join_is_flooded_before_the_requester_hears_back() {
    let mesh = LoopbackMesh::new();
    let (a, _ae, _at) = spawn_on_mesh(fast_config("prod", 7440), &mesh);
    wait_joined(&a).await;
    let (b, mut b_events, _bt) = spawn_on_mesh(fast_config("prod", 7441), &mesh);
    wait_joined(&b).await;
    let (c, _ce, _ct) = spawn_on_mesh(fast_config("prod", 7442), &mesh);
    let c_status = wait_joined(&c).await;
    wait_for(&a, "full cluster", |s| s.live_members == 3).await;

    let service_id = c
        .join_service("topics", "messaging", 3, 1, None)
        .await
        .expect("service join through the senior");

    // The bystander was notified; by the time C has its answer the poll
    // has fully completed.
    let event = expect_event(&mut b_events, "joining notification at b", |e| {
        matches!(e, MembershipEvent::ServiceJoining { .. })
    })
    .await;
    match event {
        MembershipEvent::ServiceJoining { service_id: sid, member } => {
            assert_eq!(sid, service_id);
            assert_eq!(Some(member), c_status.id);
        }
        _ => unreachable!(),
    }
    wait_for(&a, "service visible at the senior", |s| s.services == 1).await;
    wait_for(&b, "service visible at b", |s| s.services == 1).await;
}

#[tokio::test(start_paused = true)]
async fn join_with_wrong_edition_is_rejected_hard() {
    let mesh = LoopbackMesh::new();
    let (a, _ae, _at) = spawn_on_mesh(fast_config("prod", 7450), &mesh);
    wait_joined(&a).await;

    let mut cfg = fast_config("prod", 7451);
    cfg.edition = String::from("enterprise");
    let (_b, _be, b_task) = spawn_on_mesh(cfg, &mesh);

    let reason = b_task.await.expect("candidate task");
    assert_eq!(
        reason,
        HaltReason::Rejected(flock_proto::error::RejectReason::Edition)
    );
    // The established cluster is untouched.
    let a_status = a.status().await.unwrap();
    assert_eq!(a_status.live_members, 1);
}

#[tokio::test(start_paused = true)]
async fn join_with_wrong_protocol_version_is_rejected_first() {
    let mesh = LoopbackMesh::new();
    let (_a, _ae, _at) = {
        let (a, ae, at) = spawn_on_mesh(fast_config("prod", 7460), &mesh);
        wait_joined(&a).await;
        (a, ae, at)
    };

    // Wrong version AND wrong edition: the version check comes first.
    let mut cfg = fast_config("prod", 7461);
    cfg.proto_ver = 0x0099;
    cfg.edition = String::from("enterprise");
    let (_b, _be, b_task) = spawn_on_mesh(cfg, &mesh);

    let reason = b_task.await.expect("candidate task");
    assert_eq!(
        reason,
        HaltReason::Rejected(flock_proto::error::RejectReason::Version)
    );
}

#[tokio::test(start_paused = true)]
async fn slow_member_is_marked_but_not_disconnected() {
    let mesh = LoopbackMesh::new();
    let (a, mut a_events, _at) = spawn_on_mesh(fast_config("prod", 7470), &mesh);
    wait_joined(&a).await;
    let (b, _be, _bt) = spawn_on_mesh(fast_config("prod", 7471), &mesh);
    wait_joined(&b).await;
    wait_for(&a, "two members", |s| s.live_members == 2).await;

    // Two undeliverable-packet signals while B keeps heartbeating: B is
    // slow, not dead.
    for _ in 0..2 {
        a.inject(Input::DeliveryTimeout { addr: addr(7471) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let a_status = a.status().await.unwrap();
    assert_eq!(a_status.live_members, 2);
    assert_eq!(a_status.convicted, 0);
    // No departure was announced.
    while let Ok(event) = tokio::time::timeout(Duration::from_millis(20), a_events.recv()).await {
        assert!(!matches!(event, Some(MembershipEvent::MemberLeft(_))));
    }
}

#[tokio::test(start_paused = true)]
async fn rollcall_recovery_arms_the_moratorium() {
    let mesh = LoopbackMesh::new();
    let (a, mut a_events, a_task) = spawn_on_mesh(fast_config("prod", 7480), &mesh);
    wait_joined(&a).await;
    // Give the senior a service so slow-member arbitration favors it.
    a.join_service("cache", "partitioned", 5, 1, None).await.unwrap();
    let (b, _be, _bt) = spawn_on_mesh(fast_config("prod", 7481), &mesh);
    let b_status = wait_joined(&b).await;
    wait_for(&a, "two members", |s| s.live_members == 2).await;

    // Three consecutive timeout windows while B stays chatty: suspicion
    // escalates, the priority comparison convicts B, and the policy
    // (never disconnect half the cluster) forces a roll-call.
    for _ in 0..3 {
        a.inject(Input::DeliveryTimeout { addr: addr(7481) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    expect_event(&mut a_events, "conviction report", |e| {
        matches!(e, MembershipEvent::MembersTimedOut(_))
    })
    .await;

    // B answers the roll-call; full recovery, nobody is disconnected.
    let a_status = wait_for(&a, "conviction cleared", |s| s.convicted == 0).await;
    assert_eq!(a_status.live_members, 2);

    // Inside the moratorium a fresh suspicion of B is suppressed.
    for _ in 0..3 {
        a.inject(Input::DeliveryTimeout { addr: addr(7481) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    let a_status = a.status().await.unwrap();
    assert_eq!(a_status.live_members, 2);
    assert_eq!(a_status.convicted, 0);
    assert!(!a_task.is_finished());
    let _ = b_status;
}

#[tokio::test(start_paused = true)]
async fn silent_death_is_witnessed_and_disconnected() {
    let mesh = LoopbackMesh::new();
    // Make undeliverable reports arrive only after the suspect is stale
    // from every member's point of view.
    mesh.set_delivery_delay(Duration::from_millis(400));

    let (a, mut a_events, _at) = spawn_on_mesh(fast_config("prod", 7490), &mesh);
    wait_joined(&a).await;
    let (b, _be, _bt) = spawn_on_mesh(fast_config("prod", 7491), &mesh);
    wait_joined(&b).await;
    let (c, _ce, _ct) = spawn_on_mesh(fast_config("prod", 7492), &mesh);
    let c_status = wait_joined(&c).await;
    wait_for(&a, "full cluster", |s| s.live_members == 3).await;

    // C dies silently: no leave protocol, its queue just closes.
    c.shutdown().await;

    let event = expect_event(&mut a_events, "c's forced departure", |e| {
        matches!(e, MembershipEvent::MemberLeft(_))
    })
    .await;
    match event {
        MembershipEvent::MemberLeft(m) => assert_eq!(Some(m.id), c_status.id),
        _ => unreachable!(),
    }
    wait_for(&a, "a down to two", |s| s.live_members == 2).await;
    wait_for(&b, "b down to two", |s| s.live_members == 2).await;
}

#[tokio::test(start_paused = true)]
async fn ring_connection_loss_is_instant_death() {
    let mesh = LoopbackMesh::new();
    let (a, mut a_events, _at) = spawn_on_mesh(fast_config("prod", 7510), &mesh);
    wait_joined(&a).await;
    let (b, _be, _bt) = spawn_on_mesh(fast_config("prod", 7511), &mesh);
    wait_joined(&b).await;
    let (c, _ce, _ct) = spawn_on_mesh(fast_config("prod", 7512), &mesh);
    let c_status = wait_joined(&c).await;
    wait_for(&a, "full cluster", |s| s.live_members == 3).await;

    // The ring monitor reports the buddy connection down: no witness
    // poll, no quorum gate, the member is gone right now.
    a.inject(Input::RingDown { addr: addr(7512) }).await.unwrap();

    let event = expect_event(&mut a_events, "instant departure", |e| {
        matches!(e, MembershipEvent::MemberLeft(_))
    })
    .await;
    match event {
        MembershipEvent::MemberLeft(m) => assert_eq!(Some(m.id), c_status.id),
        _ => unreachable!(),
    }
    wait_for(&a, "a down to two", |s| s.live_members == 2).await;
    // The departure record was fanned out to the bystander.
    wait_for(&b, "b down to two", |s| s.live_members == 2).await;
}

#[tokio::test(start_paused = true)]
async fn departed_member_transmitting_again_is_shunned() {
    let mesh = LoopbackMesh::new();
    let (a, mut a_events, _at) = spawn_on_mesh(fast_config("prod", 7500), &mesh);
    wait_joined(&a).await;
    let (b, _be, b_task) = spawn_on_mesh(fast_config("prod", 7501), &mesh);
    wait_joined(&b).await;
    wait_for(&a, "two members", |s| s.live_members == 2).await;

    b.leave().await.expect("b leaves");
    let _ = b_task.await;
    let dead = match expect_event(&mut a_events, "b departed", |e| {
        matches!(e, MembershipEvent::MemberLeft(_))
    })
    .await
    {
        MembershipEvent::MemberLeft(m) => m,
        _ => unreachable!(),
    };

    // A forged announce from the dead identity: the zombie is shunned,
    // not re-admitted.
    let frame = encode_frame(
        flock_proto::constants::FLOCK_PROTO_VER,
        dead.uid,
        &[],
        &Payload::Discovery(DiscoveryMessage::Announce {
            cluster: "prod".into(),
            addr: addr(7501),
            machine: dead.machine,
            role: String::new(),
            attempt: 1,
            sent_millis: 0,
        }),
    )
    .unwrap();
    let packet = flock_proto::message::decode_frame(&frame).unwrap();
    a.inject(Input::Packet(Inbound { packet, from: addr(7501) })).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let a_status = a.status().await.unwrap();
    assert_eq!(a_status.live_members, 1);
}

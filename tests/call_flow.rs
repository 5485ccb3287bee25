mod common;

use common::{capture_stream, next_event, raw_peer, spawn_node, GatedCapture, NodeOptions};
use guardian_angel_lib::config::Role;
use guardian_angel_lib::logger::AppEvent;
use guardian_angel_lib::media::TrackKind;
use guardian_angel_lib::peer::loopback::NegotiatorCall;
use guardian_angel_lib::peer::{CallDirection, CallState, IceCandidate, LinkState, SignalingIdentity};
use guardian_angel_lib::relay::MemoryRelay;
use guardian_angel_lib::session::ManagerSnapshot;
use guardian_angel_lib::signaling::RelayMessage;
use std::time::Duration;
use tokio::time::sleep;

fn camera() -> NodeOptions {
    NodeOptions {
        role: Role::Camera,
        ..Default::default()
    }
}

fn host_candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:7 1 udp 2122260223 192.168.1.20 51000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[tokio::test]
async fn inbound_call_binds_preview_before_answering() {
    let relay = MemoryRelay::new();
    let node = spawn_node(&relay, "nursery", camera());
    node.negotiator.observe_preview(node.preview.clone());
    node.ready().await;

    let mut parent = raw_peer(&relay, "parent").await;
    let parent_stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &parent_stream).await;

    match parent.next_of_kind("ANSWER").await {
        RelayMessage::Answer { src, payload, .. } => {
            assert_eq!(src, Some(SignalingIdentity::from("nursery")));
            assert_eq!(payload.connection_id, connection_id);
        }
        other => panic!("unexpected frame {:?}", other),
    }

    let snapshot = node
        .eventually("connected", |s| {
            s.session(&connection_id)
                .is_some_and(|c| c.state == CallState::Connected)
        })
        .await;
    let session = snapshot.session(&connection_id).unwrap();
    assert_eq!(session.direction, CallDirection::Inbound);
    assert_eq!(session.remote, SignalingIdentity::from("parent"));
    let local_id = session.local.as_ref().unwrap().id.clone();

    let accepted = node
        .negotiator
        .journal()
        .into_iter()
        .find_map(|call| match call {
            NegotiatorCall::Accept {
                local_stream,
                preview,
                ..
            } => Some((local_stream, preview)),
            _ => None,
        })
        .expect("offer was accepted");
    assert_eq!(accepted.0, local_id);
    assert_eq!(accepted.1, Some(local_id.clone()));

    assert_eq!(node.preview.current_stream_id(), Some(local_id));
    assert_eq!(
        node.remote.current_stream_id().as_deref(),
        Some(parent_stream.id())
    );
    node.controller.shutdown().await;
}

#[tokio::test]
async fn outbound_call_starts_muted_and_toggles_focused_session() {
    let relay = MemoryRelay::new();
    let camera_node = spawn_node(&relay, "xyz789", camera());
    camera_node.ready().await;
    let monitor = spawn_node(
        &relay,
        "abc123",
        NodeOptions {
            role: Role::Monitor,
            ..Default::default()
        },
    );
    monitor.ready().await;

    let handle = monitor
        .controller
        .call_peer("xyz789")
        .await
        .expect("call placed");
    assert_eq!(handle.remote, SignalingIdentity::from("xyz789"));

    let snapshot = monitor.controller.status().await.unwrap();
    let session = snapshot.focused_session().unwrap();
    assert_eq!(session.connection_id, handle.connection_id);
    assert!(session.muted);
    assert!(!session.camera_enabled);
    let tracks = monitor.capture.inner.issued_tracks();
    assert_eq!(tracks.len(), 2);
    assert!(tracks.iter().all(|t| !t.is_enabled()));

    assert_eq!(monitor.controller.toggle_mute().await, Some(false));
    let audio = tracks.iter().find(|t| t.kind() == TrackKind::Audio).unwrap();
    assert!(audio.is_enabled());
    assert_eq!(monitor.controller.toggle_camera().await, Some(true));
    assert!(tracks.iter().all(|t| t.is_enabled()));

    monitor
        .eventually("monitor connected", |s| {
            s.session(&handle.connection_id)
                .is_some_and(|c| c.state == CallState::Connected)
        })
        .await;
    camera_node
        .eventually("camera connected", |s| {
            s.session(&handle.connection_id)
                .is_some_and(|c| c.state == CallState::Connected)
        })
        .await;
    let camera_local = camera_node.preview.current_stream_id().unwrap();
    assert_eq!(monitor.remote.current_stream_id(), Some(camera_local));

    assert_eq!(monitor.controller.toggle_mute().await, Some(true));
    assert!(!audio.is_enabled());

    monitor.controller.shutdown().await;
    camera_node.controller.shutdown().await;
}

#[tokio::test]
async fn toggles_without_a_session_do_nothing() {
    let relay = MemoryRelay::new();
    let node = spawn_node(&relay, "idle", NodeOptions::default());
    node.ready().await;

    assert_eq!(node.controller.toggle_mute().await, None);
    assert_eq!(node.controller.toggle_camera().await, None);
    assert!(!node.controller.hang_up().await);
    assert_eq!(node.capture.asked(), 0);
}

#[tokio::test]
async fn answer_waits_for_the_permission_prompt() {
    let relay = MemoryRelay::new();
    let node = spawn_node(
        &relay,
        "nursery",
        NodeOptions {
            role: Role::Camera,
            capture: Some(GatedCapture::gated()),
            ..Default::default()
        },
    );
    node.negotiator.hold_remote_media(true);
    node.ready().await;

    let parent = raw_peer(&relay, "parent").await;
    let parent_stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &parent_stream).await;

    node.eventually("capture requested", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::AcquiringLocalMedia)
    })
    .await;
    sleep(Duration::from_millis(100)).await;
    let snapshot = node.controller.status().await.unwrap();
    assert_eq!(
        snapshot.session(&connection_id).unwrap().state,
        CallState::AcquiringLocalMedia
    );
    assert!(relay.frames_of_kind("ANSWER").is_empty());
    assert!(node.preview.current().is_none());

    node.capture.release();
    node.eventually("answered", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::Answering)
    })
    .await;
    assert_eq!(relay.frames_of_kind("ANSWER").len(), 1);
    assert!(node.remote.current().is_none());

    assert!(node.negotiator.release_remote(&connection_id));
    node.eventually("connected", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::Connected)
    })
    .await;
    assert_eq!(node.capture.asked(), 1);
    node.controller.shutdown().await;
}

#[tokio::test]
async fn remote_candidates_wait_for_the_remote_description() {
    let relay = MemoryRelay::new();
    let node = spawn_node(
        &relay,
        "nursery",
        NodeOptions {
            role: Role::Camera,
            capture: Some(GatedCapture::gated()),
            ..Default::default()
        },
    );
    node.ready().await;

    let parent = raw_peer(&relay, "parent").await;
    let parent_stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &parent_stream).await;
    parent
        .send(RelayMessage::candidate(
            SignalingIdentity::from("nursery"),
            connection_id.clone(),
            host_candidate(),
        ))
        .await;

    let deadline = tokio::time::Instant::now() + common::WAIT;
    while node.negotiator.pending_candidates(&connection_id) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "candidate never queued");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.negotiator.applied_candidates(&connection_id), 0);

    node.capture.release();
    node.eventually("connected", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::Connected)
    })
    .await;
    assert_eq!(node.negotiator.pending_candidates(&connection_id), 0);
    assert_eq!(node.negotiator.applied_candidates(&connection_id), 1);
    node.controller.shutdown().await;
}

#[tokio::test]
async fn unreachable_relay_means_no_call() {
    let relay = MemoryRelay::offline();
    let node = spawn_node(&relay, "abc123", NodeOptions::default());

    assert_eq!(node.controller.call_peer("xyz789").await, None);
    assert_eq!(node.capture.asked(), 1);
    assert_eq!(node.capture.inner.live_track_count(), 0);
    assert!(node.preview.current().is_none());

    let snapshot = node.controller.status().await.unwrap();
    assert!(snapshot.sessions.is_empty());
    assert!(!snapshot.relay_open);
    assert_eq!(snapshot.identity, None);
}

#[tokio::test]
async fn shutdown_releases_every_track() {
    let relay = MemoryRelay::new();
    let node = spawn_node(&relay, "nursery", camera());
    node.ready().await;

    let parent = raw_peer(&relay, "parent").await;
    let parent_stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &parent_stream).await;
    node.eventually("connected", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::Connected)
    })
    .await;
    assert_eq!(node.capture.inner.live_track_count(), 2);

    node.controller.shutdown().await;
    node.controller.shutdown().await;

    assert_eq!(node.capture.inner.live_track_count(), 0);
    assert!(node.preview.current().is_none());
    assert!(node.remote.current().is_none());
    assert_eq!(node.negotiator.open_links(), 0);
    assert!(!relay.is_connected("nursery"));
    let leaves = relay.frames_of_kind("LEAVE");
    assert_eq!(leaves.len(), 1);
    assert!(matches!(leaves[0], RelayMessage::Leave { payload: None, .. }));
    assert!(node.controller.status().await.is_none());
}

#[tokio::test]
async fn leave_from_remote_closes_its_sessions() {
    let relay = MemoryRelay::new();
    let node = spawn_node(&relay, "nursery", camera());
    node.ready().await;

    let parent = raw_peer(&relay, "parent").await;
    let parent_stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &parent_stream).await;
    node.eventually("connected", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::Connected)
    })
    .await;

    parent
        .send(RelayMessage::leave(SignalingIdentity::from("nursery")))
        .await;
    let snapshot = node
        .eventually("session closed", |s| s.sessions.is_empty())
        .await;
    assert_eq!(snapshot.focused, None);
    assert_eq!(node.capture.inner.live_track_count(), 0);
    assert!(node.remote.current().is_none());
    assert_eq!(relay.frames_of_kind("LEAVE").len(), 1);
    node.controller.shutdown().await;
}

#[tokio::test]
async fn hang_up_ends_the_call_on_both_sides() {
    let relay = MemoryRelay::new();
    let camera_node = spawn_node(&relay, "xyz789", camera());
    camera_node.ready().await;
    let monitor = spawn_node(
        &relay,
        "abc123",
        NodeOptions {
            role: Role::Monitor,
            ..Default::default()
        },
    );
    monitor.ready().await;

    let handle = monitor.controller.call_peer("xyz789").await.unwrap();
    camera_node
        .eventually("camera connected", |s| {
            s.session(&handle.connection_id)
                .is_some_and(|c| c.state == CallState::Connected)
        })
        .await;

    assert!(monitor.controller.hang_up().await);
    monitor
        .eventually("monitor idle", |s| s.sessions.is_empty())
        .await;
    camera_node
        .eventually("camera idle", |s| s.sessions.is_empty())
        .await;
    assert_eq!(camera_node.capture.inner.live_track_count(), 0);
    assert_eq!(monitor.capture.inner.live_track_count(), 0);

    monitor.controller.shutdown().await;
    camera_node.controller.shutdown().await;
}

#[tokio::test]
async fn hanging_up_one_call_keeps_the_other() {
    let relay = MemoryRelay::new();
    let camera_node = spawn_node(&relay, "xyz789", camera());
    camera_node.ready().await;
    let monitor = spawn_node(
        &relay,
        "abc123",
        NodeOptions {
            role: Role::Monitor,
            ..Default::default()
        },
    );
    monitor.ready().await;

    let first = monitor.controller.call_peer("xyz789").await.unwrap();
    let second = monitor.controller.call_peer("xyz789").await.unwrap();
    let both_connected = |s: &guardian_angel_lib::session::ManagerSnapshot| {
        [&first, &second].iter().all(|h| {
            s.session(&h.connection_id)
                .is_some_and(|c| c.state == CallState::Connected)
        })
    };
    camera_node.eventually("camera has both calls", both_connected).await;
    monitor.eventually("monitor has both calls", both_connected).await;

    // Hang-up ends the focused call, which is the newest one
    assert!(monitor.controller.hang_up().await);
    camera_node
        .eventually("second call gone on camera", |s| {
            s.session(&second.connection_id).is_none()
        })
        .await;

    let leave = relay.frames_of_kind("LEAVE");
    assert_eq!(leave.len(), 1);
    assert!(matches!(
        &leave[0],
        RelayMessage::Leave { payload: Some(p), .. } if p.connection_id == second.connection_id
    ));

    sleep(Duration::from_millis(100)).await;
    for node in [&camera_node, &monitor] {
        let snapshot = node.controller.status().await.unwrap();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(
            snapshot.session(&first.connection_id).unwrap().state,
            CallState::Connected
        );
    }

    monitor.controller.shutdown().await;
    camera_node.controller.shutdown().await;
}

#[tokio::test]
async fn unanswered_call_is_abandoned_after_timeout() {
    let relay = MemoryRelay::new();
    let _parent = raw_peer(&relay, "silent").await;
    let node = spawn_node(
        &relay,
        "abc123",
        NodeOptions {
            call_timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        },
    );
    node.ready().await;

    let handle = node.controller.call_peer("silent").await.unwrap();
    let snapshot = node.controller.status().await.unwrap();
    assert_eq!(
        snapshot.session(&handle.connection_id).unwrap().state,
        CallState::Calling
    );

    node.eventually("call abandoned", |s| s.sessions.is_empty())
        .await;
    let leaves = relay.frames_of_kind("LEAVE");
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].dst(), Some(&SignalingIdentity::from("silent")));
    assert_eq!(node.capture.inner.live_track_count(), 0);
    node.controller.shutdown().await;
}

#[tokio::test]
async fn monitor_ignores_inbound_offers() {
    let relay = MemoryRelay::new();
    let node = spawn_node(
        &relay,
        "abc123",
        NodeOptions {
            role: Role::Monitor,
            ..Default::default()
        },
    );
    node.ready().await;

    let parent = raw_peer(&relay, "stranger").await;
    let stream = capture_stream().await;
    parent.offer("abc123", &stream).await;
    sleep(Duration::from_millis(150)).await;

    let snapshot = node.controller.status().await.unwrap();
    assert!(snapshot.sessions.is_empty());
    assert_eq!(node.capture.asked(), 0);
    assert!(relay.frames_of_kind("ANSWER").is_empty());
    node.controller.shutdown().await;
}

#[tokio::test]
async fn denied_permission_fails_the_inbound_call() {
    let relay = MemoryRelay::new();
    let node = spawn_node(
        &relay,
        "nursery",
        NodeOptions {
            role: Role::Camera,
            capture: Some(GatedCapture::denying()),
            ..Default::default()
        },
    );
    node.ready().await;

    let parent = raw_peer(&relay, "parent").await;
    let stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &stream).await;

    node.eventually("failed", |s| {
        s.session(&connection_id)
            .is_some_and(|c| matches!(c.state, CallState::Failed { .. }))
    })
    .await;
    assert!(relay.frames_of_kind("ANSWER").is_empty());
    assert!(node.preview.current().is_none());
    node.controller.shutdown().await;
}

#[tokio::test]
async fn local_candidates_are_trickled_to_the_remote() {
    let relay = MemoryRelay::new();
    let mut parent = raw_peer(&relay, "parent").await;
    let node = spawn_node(&relay, "abc123", NodeOptions::default());
    node.ready().await;

    let handle = node.controller.call_peer("parent").await.unwrap();
    match parent.next_of_kind("CANDIDATE").await {
        RelayMessage::Candidate { src, payload, .. } => {
            assert_eq!(src, Some(SignalingIdentity::from("abc123")));
            assert_eq!(payload.connection_id, handle.connection_id);
            assert!(payload.candidate.candidate.contains("typ host"));
        }
        other => panic!("unexpected frame {:?}", other),
    }
    node.controller.shutdown().await;
}

#[tokio::test]
async fn link_trouble_is_reported_and_failure_ends_the_call() {
    let relay = MemoryRelay::new();
    let node = spawn_node(&relay, "nursery", camera());
    let mut events = node.emitter.subscribe();
    node.ready().await;

    let mut parent = raw_peer(&relay, "parent").await;
    let parent_stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &parent_stream).await;
    node.eventually("connected", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::Connected)
    })
    .await;

    node.negotiator
        .report_link(&connection_id, LinkState::Interrupted);
    next_event(&mut events, "problem", |e| {
        matches!(e, AppEvent::ConnectionProblem { .. })
    })
    .await;
    next_event(&mut events, "recovering", |e| {
        matches!(e, AppEvent::ConnectionRecovering { .. })
    })
    .await;

    node.negotiator.report_link(&connection_id, LinkState::Connected);
    next_event(&mut events, "recovered", |e| {
        matches!(e, AppEvent::ConnectionRecovered { .. })
    })
    .await;
    let snapshot = node.controller.status().await.unwrap();
    assert_eq!(
        snapshot.session(&connection_id).unwrap().state,
        CallState::Connected
    );

    node.negotiator.report_link(&connection_id, LinkState::Failed);
    next_event(&mut events, "failed", |e| {
        matches!(e, AppEvent::ConnectionFailed { .. })
    })
    .await;
    parent.next_of_kind("LEAVE").await;
    node.eventually("session closed", |s| s.sessions.is_empty())
        .await;
    assert_eq!(node.capture.inner.live_track_count(), 0);
    node.controller.shutdown().await;
}

#[tokio::test]
async fn relay_loss_invalidates_identity_but_keeps_the_call() {
    let relay = MemoryRelay::new();
    let node = spawn_node(&relay, "nursery", camera());
    let mut events = node.emitter.subscribe();
    node.ready().await;

    let parent = raw_peer(&relay, "parent").await;
    let parent_stream = capture_stream().await;
    let connection_id = parent.offer("nursery", &parent_stream).await;
    node.eventually("connected", |s| {
        s.session(&connection_id)
            .is_some_and(|c| c.state == CallState::Connected)
    })
    .await;

    relay.disconnect("nursery");
    next_event(&mut events, "relay lost", |e| matches!(e, AppEvent::RelayLost)).await;
    assert_eq!(node.controller.peer_id(), None);
    assert!(!node.controller.is_connected());

    let snapshot = node.controller.status().await.unwrap();
    assert!(!snapshot.relay_open);
    assert_eq!(
        snapshot.session(&connection_id).unwrap().state,
        CallState::Connected
    );

    assert!(node.controller.hang_up().await);
    let snapshot = node.controller.status().await.unwrap();
    assert!(snapshot.sessions.is_empty());
    assert!(relay.frames_of_kind("LEAVE").is_empty());
    assert_eq!(node.capture.inner.live_track_count(), 0);
    node.controller.shutdown().await;
}

//! End-to-end controller tests over the in-memory fake transport.
//!
//! Uses tokio's test-util time control features to verify:
//! - The full join sequence: register, channel, callback, stream, live
//! - Broadcaster-side viewer tracking and track operations
//! - Deliberate end-of-broadcast handling
//! - Teardown idempotence and the single-identity invariant

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use sc_test_utils::{fixtures, FakeSink, FakeTransport};
use stream_controller::actors::{
    BroadcastActor, BroadcastActorHandle, BroadcastPhase, BroadcastStatus, CallState, SourceMode,
    ViewerActor, ViewerActorHandle, ViewerPhase, ViewerStatus,
};
use stream_controller::errors::SessionError;
use stream_controller::media::{MediaTrack, TrackKind};
use stream_controller::sink::{SinkEvent, SpectrumSource};
use stream_controller::telemetry::QualityBucket;
use tokio::sync::watch;

/// Generous bound for a condition that should arrive in virtual time.
const WAIT: Duration = Duration::from_secs(120);

async fn wait_broadcast(
    status: &mut watch::Receiver<BroadcastStatus>,
    pred: impl FnMut(&BroadcastStatus) -> bool,
) -> BroadcastStatus {
    tokio::time::timeout(WAIT, status.wait_for(pred))
        .await
        .expect("broadcast condition not reached in time")
        .expect("broadcast actor dropped its status sender")
        .clone()
}

async fn wait_viewer(
    status: &mut watch::Receiver<ViewerStatus>,
    pred: impl FnMut(&ViewerStatus) -> bool,
) -> ViewerStatus {
    tokio::time::timeout(WAIT, status.wait_for(pred))
        .await
        .expect("viewer condition not reached in time")
        .expect("viewer actor dropped its status sender")
        .clone()
}

/// Spawn a live broadcaster and return its handle and session.
async fn live_broadcast(
    transport: &FakeTransport,
) -> (BroadcastActorHandle, stream_controller::actors::StreamSession) {
    fixtures::init_test_logging();
    let (broadcast, _task) = BroadcastActor::spawn(
        fixtures::test_config(),
        Arc::new(transport.clone()),
        None,
    );
    let session = broadcast
        .start(fixtures::camera_stream(), SourceMode::Camera, "My Live Stream")
        .await
        .unwrap();
    let mut status = broadcast.status();
    wait_broadcast(&mut status, |s| s.phase == BroadcastPhase::Live).await;
    (broadcast, session)
}

/// Spawn a viewer for `stream_id` and wait until it is live.
async fn live_viewer(
    transport: &FakeTransport,
    sink: &FakeSink,
    stream_id: &str,
) -> ViewerActorHandle {
    let (viewer, _task) = ViewerActor::spawn(
        stream_id,
        fixtures::test_config(),
        Arc::new(transport.clone()),
        Arc::new(sink.clone()),
    );
    let mut status = viewer.status();
    wait_viewer(&mut status, |s| s.phase == ViewerPhase::Live).await;
    viewer
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_and_view_end_to_end() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, session) = live_broadcast(&transport).await;
    assert!(session
        .share_url
        .ends_with(&format!("#/viewer/{}", session.stream_id)));
    assert_eq!(
        session.broadcaster_identity.as_str(),
        format!("ss-{}", session.stream_id)
    );

    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let snapshot = viewer.status().borrow().clone();
    assert!(snapshot.has_audio);
    assert!(snapshot.has_video);
    assert!(snapshot.playing);
    assert_eq!(snapshot.retry_count, 0);
    assert!(sink.is_attached());

    // The broadcaster tracks the viewer through to connected.
    let mut bstatus = broadcast.status();
    let snapshot = wait_broadcast(&mut bstatus, |s| {
        s.viewers.len() == 1 && s.viewers.iter().all(|v| v.call_state == CallState::Connected)
    })
    .await;
    assert!(snapshot.viewers.iter().all(|v| {
        v.viewer_identity.as_str().starts_with("v-")
    }));

    // The viewer announced itself over the registration channel.
    let payloads = transport.sent_payloads();
    assert!(payloads
        .iter()
        .any(|p| p.get("type").and_then(|t| t.as_str()) == Some("register")));
}

#[tokio::test(start_paused = true)]
async fn test_start_rejects_empty_stream() {
    let transport = FakeTransport::new();
    let (broadcast, _task) = BroadcastActor::spawn(
        fixtures::test_config(),
        Arc::new(transport.clone()),
        None,
    );

    let result = broadcast
        .start(
            stream_controller::media::MediaStream::empty(),
            SourceMode::Camera,
            "empty",
        )
        .await;
    assert!(matches!(result, Err(SessionError::EmptyMedia)));
    assert_eq!(transport.registration_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_broadcaster_conflict_regenerates_stream_id_once() {
    let transport = FakeTransport::new();
    transport.conflict_next_registrations(1);

    let (broadcast, _task) = BroadcastActor::spawn(
        fixtures::test_config(),
        Arc::new(transport.clone()),
        None,
    );
    let session = broadcast
        .start(fixtures::camera_stream(), SourceMode::Camera, "conflicted")
        .await
        .unwrap();

    let mut status = broadcast.status();
    let snapshot = wait_broadcast(&mut status, |s| s.phase == BroadcastPhase::Live).await;

    // Exactly one regeneration: a second registration under a new id.
    assert_eq!(transport.registration_count(), 2);
    let live_session = snapshot.session.unwrap();
    assert_ne!(live_session.stream_id, session.stream_id);
    assert!(live_session
        .share_url
        .ends_with(&format!("#/viewer/{}", live_session.stream_id)));
    assert!(snapshot.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_conflict_is_terminal() {
    let transport = FakeTransport::new();
    transport.conflict_next_registrations(2);

    let (broadcast, _task) = BroadcastActor::spawn(
        fixtures::test_config(),
        Arc::new(transport.clone()),
        None,
    );
    broadcast
        .start(fixtures::camera_stream(), SourceMode::Camera, "doomed")
        .await
        .unwrap();

    let mut status = broadcast.status();
    let snapshot = wait_broadcast(&mut status, |s| s.phase == BroadcastPhase::Error).await;
    assert!(snapshot.error.is_some());
    assert_eq!(transport.registration_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_empty_remote_stream_is_retried_not_attached() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();
    transport.set_strip_media(true);

    let (_broadcast, session) = live_broadcast(&transport).await;
    let (viewer, _task) = ViewerActor::spawn(
        session.stream_id.clone(),
        fixtures::test_config(),
        Arc::new(transport.clone()),
        Arc::new(sink.clone()),
    );

    let mut status = viewer.status();
    wait_viewer(&mut status, |s| {
        matches!(s.phase, ViewerPhase::Retrying { attempt: 1, .. })
    })
    .await;
    assert_eq!(sink.attach_count(), 0);

    // Media restored: the scheduled retry goes live.
    transport.set_strip_media(false);
    let snapshot = wait_viewer(&mut status, |s| s.phase == ViewerPhase::Live).await;
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(sink.attach_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_live_link_failure_schedules_retry_and_recovers() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (_broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = viewer.status();

    transport.fail_active_links();
    wait_viewer(&mut status, |s| {
        matches!(s.phase, ViewerPhase::Retrying { attempt: 1, .. })
    })
    .await;

    // One scheduled retry later the viewer is live again, budget reset.
    let snapshot = wait_viewer(&mut status, |s| s.phase == ViewerPhase::Live).await;
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(sink.attach_count(), 2);

    // Never two live viewer identities, even across the churn.
    assert_eq!(transport.max_concurrent_viewers(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_broadcaster_relay_drop_reconnects_in_place() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, session) = live_broadcast(&transport).await;
    let _viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = broadcast.status();

    // Hold the re-opened link back so the degraded phase is observable.
    transport.set_hold_registration_open(true);
    transport.disconnect(session.broadcaster_identity.as_str());

    let snapshot = wait_broadcast(&mut status, |s| s.phase == BroadcastPhase::Starting).await;
    assert_eq!(transport.reconnect_count(), 1);
    assert!(snapshot.session.is_some());
    assert!(snapshot.error.is_none());

    // The identity was kept: a link re-open, not a fresh registration.
    transport.release_registrations();
    wait_broadcast(&mut status, |s| s.phase == BroadcastPhase::Live).await;
    assert_eq!(transport.registration_count(), 2);
    assert!(sink.is_attached());
}

#[tokio::test(start_paused = true)]
async fn test_viewer_relay_drop_degrades_then_retries() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (_broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = viewer.status();

    let viewer_identity = transport
        .live_identities()
        .into_iter()
        .find(|id| id.starts_with("v-"))
        .unwrap();
    transport.disconnect(&viewer_identity);

    // The drop degrades quality and feeds the retry scheduler.
    let snapshot = wait_viewer(&mut status, |s| {
        matches!(s.phase, ViewerPhase::Retrying { attempt: 1, .. })
    })
    .await;
    assert_eq!(snapshot.quality, Some(QualityBucket::Poor));
    assert!(!sink.is_attached());

    // The scheduled retry lands a fresh identity and goes live again.
    let snapshot = wait_viewer(&mut status, |s| s.phase == ViewerPhase::Live).await;
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(sink.attach_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_stop_ends_viewer() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = viewer.status();

    broadcast.stop().await.unwrap();

    let snapshot = wait_viewer(&mut status, |s| s.phase == ViewerPhase::Ended).await;
    assert_eq!(snapshot.error.as_deref(), Some("Broadcast has ended"));
    assert!(!sink.is_attached());

    // Terminal: no retry fires on its own.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(viewer.status().borrow().phase, ViewerPhase::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_ended_video_track_ends_session() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (_broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = viewer.status();

    transport.end_video_tracks();

    let snapshot = wait_viewer(&mut status, |s| s.phase == ViewerPhase::Ended).await;
    assert_eq!(snapshot.error.as_deref(), Some("Broadcast has ended"));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_from_ended_resets_budget() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (_broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = viewer.status();

    transport.close_active_calls();
    wait_viewer(&mut status, |s| s.phase == ViewerPhase::Ended).await;

    viewer.connect().await.unwrap();
    let snapshot = wait_viewer(&mut status, |s| s.phase == ViewerPhase::Live).await;
    assert_eq!(snapshot.retry_count, 0);
    assert!(snapshot.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;

    viewer.stop().await.unwrap();
    viewer.stop().await.unwrap();
    assert_eq!(viewer.status().borrow().phase, ViewerPhase::Ended);
    assert!(!sink.is_attached());

    broadcast.stop().await.unwrap();
    broadcast.stop().await.unwrap();
    assert_eq!(broadcast.status().borrow().phase, BroadcastPhase::Idle);
    assert!(transport.live_identities().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_replace_track_reaches_active_calls() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, session) = live_broadcast(&transport).await;
    let _viewer = live_viewer(&transport, &sink, &session.stream_id).await;

    let replacement = MediaTrack::new(TrackKind::Video);
    let replacement_id = replacement.id().to_string();
    broadcast.replace_track(replacement).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.replaced_track_ids(), vec![replacement_id]);
}

#[tokio::test(start_paused = true)]
async fn test_track_toggle_is_shared_with_calls() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, session) = live_broadcast(&transport).await;
    let _viewer = live_viewer(&transport, &sink, &session.stream_id).await;

    broadcast
        .set_track_enabled(TrackKind::Audio, false)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The stream delivered to the viewer shares the enabled flags.
    let delivered = sink.attached_stream().unwrap();
    let audio_enabled = delivered
        .tracks()
        .iter()
        .filter(|t| t.kind() == TrackKind::Audio)
        .all(MediaTrack::is_enabled);
    assert!(!audio_enabled);
    assert!(delivered
        .tracks()
        .iter()
        .filter(|t| t.kind() == TrackKind::Video)
        .all(MediaTrack::is_enabled));
}

#[tokio::test(start_paused = true)]
async fn test_video_only_broadcast_plays_without_audio() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, _task) = BroadcastActor::spawn(
        fixtures::test_config(),
        Arc::new(transport.clone()),
        None,
    );
    let session = broadcast
        .start(fixtures::video_only_stream(), SourceMode::Screen, "my screen")
        .await
        .unwrap();
    let mut bstatus = broadcast.status();
    wait_broadcast(&mut bstatus, |s| s.phase == BroadcastPhase::Live).await;

    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let snapshot = viewer.status().borrow().clone();
    assert!(snapshot.has_video);
    assert!(!snapshot.has_audio);

    // No audio track, no meter: the levels stay at rest.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let audio = viewer.status().borrow().audio;
    assert_eq!(audio.level, 0.0);
    assert_eq!(audio.peak, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_audio_only_broadcast_ignores_video_track_signals() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (broadcast, _task) = BroadcastActor::spawn(
        fixtures::test_config(),
        Arc::new(transport.clone()),
        None,
    );
    let session = broadcast
        .start(fixtures::audio_only_stream(), SourceMode::Camera, "radio")
        .await
        .unwrap();
    let mut bstatus = broadcast.status();
    wait_broadcast(&mut bstatus, |s| s.phase == BroadcastPhase::Live).await;

    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let snapshot = viewer.status().borrow().clone();
    assert!(snapshot.has_audio);
    assert!(!snapshot.has_video);

    // There is no video track whose end could tear the session down.
    transport.end_video_tracks();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(viewer.status().borrow().phase, ViewerPhase::Live);
}

#[tokio::test(start_paused = true)]
async fn test_set_title_updates_session() {
    let transport = FakeTransport::new();
    let (broadcast, _session) = live_broadcast(&transport).await;

    broadcast.set_title("Renamed").await.unwrap();
    let mut status = broadcast.status();
    let snapshot = wait_broadcast(&mut status, |s| {
        s.session.as_ref().is_some_and(|sess| sess.title == "Renamed")
    })
    .await;
    assert_eq!(snapshot.phase, BroadcastPhase::Live);
}

#[tokio::test(start_paused = true)]
async fn test_duration_clock_advances() {
    let transport = FakeTransport::new();
    let (broadcast, _session) = live_broadcast(&transport).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    let duration = broadcast.status().borrow().duration_secs;
    assert!((9..=11).contains(&duration), "duration was {duration}");
}

struct FixedSpectrum(Vec<u8>);

impl SpectrumSource for FixedSpectrum {
    fn spectrum(&self) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_outbound_audio_meter_reports_levels() {
    let transport = FakeTransport::new();
    let (broadcast, _task) = BroadcastActor::spawn(
        fixtures::test_config(),
        Arc::new(transport.clone()),
        Some(Arc::new(FixedSpectrum(vec![255; 16]))),
    );
    broadcast
        .start(fixtures::camera_stream(), SourceMode::Camera, "loud")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let audio = broadcast.status().borrow().audio;
    assert!(audio.level > 0.99);
    assert!(audio.peak >= audio.level);
}

#[tokio::test(start_paused = true)]
async fn test_playback_telemetry_tracks_buffer_margin() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (_broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = viewer.status();

    sink.set_buffer_ahead(0.1);
    let snapshot = wait_viewer(&mut status, |s| {
        s.quality == Some(QualityBucket::Poor) && s.stats.is_some()
    })
    .await;
    let stats = snapshot.stats.unwrap();
    assert!(stats.buffer_ahead_secs < 0.3);
    assert_eq!(stats.resolution, Some((1280, 720)));

    sink.set_buffer_ahead(3.0);
    wait_viewer(&mut status, |s| s.quality == Some(QualityBucket::Good)).await;
}

#[tokio::test(start_paused = true)]
async fn test_sink_stall_and_recovery() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();

    let (_broadcast, session) = live_broadcast(&transport).await;
    let viewer = live_viewer(&transport, &sink, &session.stream_id).await;
    let mut status = viewer.status();

    sink.emit(SinkEvent::Waiting);
    wait_viewer(&mut status, |s| s.buffering).await;

    sink.emit(SinkEvent::Playing);
    let snapshot = wait_viewer(&mut status, |s| !s.buffering).await;
    assert!(snapshot.playing);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_playback_still_goes_live() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();
    sink.set_play_blocked(true);

    let (_broadcast, session) = live_broadcast(&transport).await;
    let (viewer, _task) = ViewerActor::spawn(
        session.stream_id.clone(),
        fixtures::test_config(),
        Arc::new(transport.clone()),
        Arc::new(sink.clone()),
    );

    let mut status = viewer.status();
    let snapshot = wait_viewer(&mut status, |s| s.phase == ViewerPhase::Live).await;
    assert!(!snapshot.playing);
    assert!(sink.is_attached());
}

//! Pre-configured test data for controller tests.

use std::collections::HashMap;

use stream_controller::config::SessionConfig;
use stream_controller::media::{MediaStream, MediaTrack, TrackKind};

/// A camera-style stream: one audio and one video track.
#[must_use]
pub fn camera_stream() -> MediaStream {
    MediaStream::new(vec![
        MediaTrack::new(TrackKind::Audio),
        MediaTrack::new(TrackKind::Video),
    ])
}

/// A screen-capture-style stream: video only.
#[must_use]
pub fn video_only_stream() -> MediaStream {
    MediaStream::new(vec![MediaTrack::new(TrackKind::Video)])
}

/// An audio-only stream.
#[must_use]
pub fn audio_only_stream() -> MediaStream {
    MediaStream::new(vec![MediaTrack::new(TrackKind::Audio)])
}

/// Default configuration with a test share origin.
#[must_use]
pub fn test_config() -> SessionConfig {
    let vars = HashMap::from([(
        "SC_SHARE_ORIGIN".to_string(),
        "https://stream.test".to_string(),
    )]);
    SessionConfig::from_vars(&vars).expect("test config should be valid")
}

/// Install a fmt subscriber honoring `RUST_LOG`, once per process. Later
/// calls are no-ops, so every test can call it unconditionally.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

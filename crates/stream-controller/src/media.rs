//! Local media stream and track handles.
//!
//! A `MediaTrack` is a cheap handle: clones share the same `enabled` flag,
//! so toggling a track on the broadcaster's local stream is observed by
//! every active call holding a clone. Actual media flows inside the
//! transport collaborator; these types only carry routing metadata and
//! enablement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Handle to one media track. Clones share the enabled flag.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Create an enabled track of the given kind with a fresh id.
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// A bundle of media tracks, read-shared across active calls.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    /// An empty stream, used by viewers to answer receive-only.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    #[must_use]
    pub fn video_track_ids(&self) -> Vec<String> {
        self.tracks
            .iter()
            .filter(|t| t.kind() == TrackKind::Video)
            .map(|t| t.id().to_string())
            .collect()
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    /// Swap the first track of the same kind for `track`.
    ///
    /// Returns false (and leaves the stream untouched) when no track of
    /// that kind exists.
    pub fn replace_track(&mut self, track: MediaTrack) -> bool {
        match self.tracks.iter_mut().find(|t| t.kind() == track.kind()) {
            Some(slot) => {
                *slot = track;
                true
            }
            None => false,
        }
    }

    /// Toggle every track of one kind. Clones held by active calls share
    /// the flag, so the change is visible everywhere at once.
    pub fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }
}

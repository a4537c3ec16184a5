//! Command and status types shared by the session controller actors.
//!
//! Commands enter an actor through its mailbox; continuous state leaves
//! through a `watch` channel as whole-status snapshots, so observers never
//! see a half-applied transition.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::errors::SessionError;
use crate::identity::PeerIdentity;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::telemetry::{AudioLevels, PlaybackStats, QualityBucket};
use crate::transport::LinkState;

/// Where the broadcast media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Camera,
    Screen,
    File,
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceMode::Camera => "camera",
            SourceMode::Screen => "screen",
            SourceMode::File => "file",
        };
        f.write_str(name)
    }
}

/// One running broadcast, created on start and destroyed on stop.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub stream_id: String,
    pub broadcaster_identity: PeerIdentity,
    pub title: String,
    pub source_mode: SourceMode,
    pub started_at: DateTime<Utc>,
    /// Viewer-facing address for this stream.
    pub share_url: String,
}

/// Call state of one connected viewer, as seen by the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl From<LinkState> for CallState {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::New | LinkState::Connecting => CallState::Connecting,
            LinkState::Connected => CallState::Connected,
            LinkState::Disconnected => CallState::Disconnected,
            LinkState::Failed | LinkState::Closed => CallState::Closed,
        }
    }
}

/// One viewer the broadcaster is serving.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerConnection {
    pub viewer_identity: PeerIdentity,
    pub joined_at: DateTime<Utc>,
    pub call_state: CallState,
}

/// Broadcast lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPhase {
    #[default]
    Idle,
    /// Registration submitted, not yet routable.
    Starting,
    Live,
    Error,
}

/// Broadcast status snapshot.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStatus {
    pub phase: BroadcastPhase,
    pub session: Option<StreamSession>,
    /// Connected and connecting viewers, ordered by join time.
    pub viewers: Vec<ViewerConnection>,
    pub duration_secs: u64,
    /// Outbound audio meter reading.
    pub audio: AudioLevels,
    /// User-facing message for the Error phase.
    pub error: Option<String>,
}

/// Viewer lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewerPhase {
    /// Establishing: registration, channel, callback or stream pending.
    #[default]
    Connecting,
    Live,
    /// A reconnection attempt is scheduled.
    Retrying {
        attempt: u32,
        seconds_left: u64,
    },
    /// Terminal until an explicit `connect()`.
    Ended,
}

/// Viewer status snapshot.
#[derive(Debug, Clone, Default)]
pub struct ViewerStatus {
    pub phase: ViewerPhase,
    /// Consecutive failed attempts in the current budget window.
    pub retry_count: u32,
    pub playing: bool,
    pub buffering: bool,
    pub has_audio: bool,
    pub has_video: bool,
    pub live_secs: u64,
    pub quality: Option<QualityBucket>,
    pub stats: Option<PlaybackStats>,
    pub audio: AudioLevels,
    /// User-facing message for the Ended phase.
    pub error: Option<String>,
}

/// Commands accepted by the broadcast actor.
pub enum BroadcastCommand {
    Start {
        stream: MediaStream,
        mode: SourceMode,
        title: String,
        respond_to: oneshot::Sender<Result<StreamSession, SessionError>>,
    },
    Stop {
        respond_to: oneshot::Sender<()>,
    },
    ReplaceTrack {
        track: MediaTrack,
    },
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
    },
    SetTitle {
        title: String,
    },
}

/// Commands accepted by the viewer actor.
pub enum ViewerCommand {
    /// Start over with a fresh attempt budget.
    Connect,
    /// Skip the pending backoff delay.
    RetryNow,
    Stop {
        respond_to: oneshot::Sender<()>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_state_from_link_state() {
        assert_eq!(CallState::from(LinkState::New), CallState::Connecting);
        assert_eq!(CallState::from(LinkState::Connecting), CallState::Connecting);
        assert_eq!(CallState::from(LinkState::Connected), CallState::Connected);
        assert_eq!(
            CallState::from(LinkState::Disconnected),
            CallState::Disconnected
        );
        assert_eq!(CallState::from(LinkState::Failed), CallState::Closed);
        assert_eq!(CallState::from(LinkState::Closed), CallState::Closed);
    }

    #[test]
    fn test_default_snapshots_are_inert() {
        let status = BroadcastStatus::default();
        assert_eq!(status.phase, BroadcastPhase::Idle);
        assert!(status.session.is_none());
        assert!(status.viewers.is_empty());

        let status = ViewerStatus::default();
        assert_eq!(status.phase, ViewerPhase::Connecting);
        assert_eq!(status.retry_count, 0);
    }
}

//! Seam over the rendering surface a viewer hands its stream to.
//!
//! The controller attaches the remote stream, asks for playback, and
//! samples buffer margin and resolution for the stats ticker. Rendering
//! itself is the embedder's business.

use tokio::sync::mpsc;

use crate::media::MediaStream;

/// Playback events reported by the rendering surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Playback is running.
    Playing,
    /// Playback stalled waiting for data.
    Waiting,
    /// The surface failed; the attachment is dead.
    Error(String),
}

/// Outcome of a playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStart {
    Started,
    /// The surface refused to start unattended (platform policy). The
    /// attachment stays valid; playback begins on the next user gesture.
    Blocked,
}

/// Frequency-domain observation point for the audio level meter.
///
/// Returns one magnitude byte per bin, or `None` when the attached stream
/// carries no audio.
pub trait SpectrumSource: Send + Sync {
    fn spectrum(&self) -> Option<Vec<u8>>;
}

/// The rendering surface itself.
///
/// One attachment at a time: `attach` replaces any previous stream and
/// yields the event receiver for the new attachment. `detach` is
/// idempotent.
pub trait MediaSink: SpectrumSource + Send + Sync {
    fn attach(&self, stream: MediaStream) -> mpsc::UnboundedReceiver<SinkEvent>;

    fn detach(&self);

    /// Ask the surface to start playback.
    fn play(&self) -> PlaybackStart;

    /// Seconds of media buffered beyond the playback position.
    fn buffer_ahead(&self) -> f64;

    /// Current decoded resolution, once known.
    fn resolution(&self) -> Option<(u32, u32)>;
}

//! Lightweight playback telemetry: connection quality buckets, buffer
//! statistics, and the audio level meter.
//!
//! Everything here is pure computation; the controllers own the tickers
//! that drive sampling.

pub mod audio;
pub mod quality;

pub use audio::{AudioLevelMeter, AudioLevels};
pub use quality::QualityBucket;

use serde::Serialize;

/// One sample from the viewer's periodic playback probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackStats {
    /// Seconds of media buffered beyond the playback position.
    pub buffer_ahead_secs: f64,
    /// Decoded resolution, once the sink knows it.
    pub resolution: Option<(u32, u32)>,
    /// Quality bucket derived from the buffer margin.
    pub quality: QualityBucket,
}

impl PlaybackStats {
    /// Derive a sample from raw sink readings.
    #[must_use]
    pub fn from_sink_readings(buffer_ahead_secs: f64, resolution: Option<(u32, u32)>) -> Self {
        Self {
            buffer_ahead_secs,
            resolution,
            quality: QualityBucket::for_buffer_ahead(buffer_ahead_secs),
        }
    }
}

//! Coarse connection quality buckets.

use serde::Serialize;

use crate::transport::LinkState;

/// Three-level quality hint surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityBucket {
    Poor,
    Fair,
    Good,
}

impl QualityBucket {
    /// Bucket a buffer margin in seconds.
    ///
    /// Under 0.3s the player is one hiccup from stalling; under 1.5s it
    /// rides close to the edge; anything above is comfortable.
    #[must_use]
    pub fn for_buffer_ahead(secs: f64) -> Self {
        if secs < 0.3 {
            QualityBucket::Poor
        } else if secs < 1.5 {
            QualityBucket::Fair
        } else {
            QualityBucket::Good
        }
    }

    /// Bucket a link state change, where one applies.
    ///
    /// Only the two states with a clear quality reading map; transitional
    /// states leave the previous hint in place.
    #[must_use]
    pub fn for_link_state(state: LinkState) -> Option<Self> {
        match state {
            LinkState::Connected => Some(QualityBucket::Good),
            LinkState::Disconnected => Some(QualityBucket::Poor),
            _ => None,
        }
    }
}

impl std::fmt::Display for QualityBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityBucket::Poor => "poor",
            QualityBucket::Fair => "fair",
            QualityBucket::Good => "good",
        };
        f.write_str(name)
    }
}

//! Audio level meter with a slow-decaying peak indicator.

/// Peak decay per meter sample, in normalized level units.
const PEAK_DECAY_PER_SAMPLE: f32 = 0.003;

/// One meter reading, both values in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioLevels {
    /// Instantaneous level: mean spectrum magnitude, normalized.
    pub level: f32,
    /// Recent maximum, decaying slowly toward the current level.
    pub peak: f32,
}

/// Stateful meter fed with frequency-domain samples.
///
/// The peak never falls below the current level, so a sustained loud
/// signal holds it steady while silence lets it drift down one decay step
/// per sample.
#[derive(Debug, Default)]
pub struct AudioLevelMeter {
    peak: f32,
}

impl AudioLevelMeter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one spectrum frame into the meter and return the reading.
    ///
    /// An empty frame reads as silence; the peak still decays.
    pub fn sample(&mut self, spectrum: &[u8]) -> AudioLevels {
        let level = if spectrum.is_empty() {
            0.0
        } else {
            let sum: u32 = spectrum.iter().map(|&bin| u32::from(bin)).sum();
            (sum as f32 / spectrum.len() as f32) / 255.0
        };
        self.peak = level.max(self.peak - PEAK_DECAY_PER_SAMPLE);
        AudioLevels { level, peak: self.peak }
    }

    /// Drop accumulated peak state, for stream changeover.
    pub fn reset(&mut self) {
        self.peak = 0.0;
    }
}

//! In-memory fake rendering surface.
//!
//! Records attachments and playback requests, and lets tests steer the
//! readings the viewer's telemetry tickers sample.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedSender};

use stream_controller::media::MediaStream;
use stream_controller::sink::{MediaSink, PlaybackStart, SinkEvent, SpectrumSource};

struct SinkInner {
    attached: Option<MediaStream>,
    events: Option<UnboundedSender<SinkEvent>>,
    attach_count: usize,
    detach_count: usize,
    play_count: usize,
    play_blocked: bool,
    buffer_ahead: f64,
    resolution: Option<(u32, u32)>,
    spectrum: Vec<u8>,
}

impl Default for SinkInner {
    fn default() -> Self {
        Self {
            attached: None,
            events: None,
            attach_count: 0,
            detach_count: 0,
            play_count: 0,
            play_blocked: false,
            buffer_ahead: 2.0,
            resolution: Some((1280, 720)),
            spectrum: vec![100; 16],
        }
    }
}

/// Fake media sink. Clones share state.
#[derive(Clone, Default)]
pub struct FakeSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl FakeSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next playback requests, as an autoplay policy would.
    pub fn set_play_blocked(&self, blocked: bool) {
        self.inner.lock().unwrap().play_blocked = blocked;
    }

    pub fn set_buffer_ahead(&self, secs: f64) {
        self.inner.lock().unwrap().buffer_ahead = secs;
    }

    pub fn set_resolution(&self, resolution: Option<(u32, u32)>) {
        self.inner.lock().unwrap().resolution = resolution;
    }

    /// Spectrum frame returned while an audio-carrying stream is attached.
    pub fn set_spectrum(&self, spectrum: Vec<u8>) {
        self.inner.lock().unwrap().spectrum = spectrum;
    }

    /// Emit a playback event to the current attachment, if any.
    pub fn emit(&self, event: SinkEvent) {
        let inner = self.inner.lock().unwrap();
        if let Some(events) = &inner.events {
            let _ = events.send(event);
        }
    }

    #[must_use]
    pub fn attach_count(&self) -> usize {
        self.inner.lock().unwrap().attach_count
    }

    #[must_use]
    pub fn detach_count(&self) -> usize {
        self.inner.lock().unwrap().detach_count
    }

    #[must_use]
    pub fn play_count(&self) -> usize {
        self.inner.lock().unwrap().play_count
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().attached.is_some()
    }

    /// The currently attached stream, if any.
    #[must_use]
    pub fn attached_stream(&self) -> Option<MediaStream> {
        self.inner.lock().unwrap().attached.clone()
    }
}

impl SpectrumSource for FakeSink {
    fn spectrum(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        match &inner.attached {
            Some(stream) if stream.has_audio() => Some(inner.spectrum.clone()),
            _ => None,
        }
    }
}

impl MediaSink for FakeSink {
    fn attach(&self, stream: MediaStream) -> mpsc::UnboundedReceiver<SinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.attached = Some(stream);
        inner.events = Some(tx);
        inner.attach_count += 1;
        rx
    }

    fn detach(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.attached.take().is_some() {
            inner.detach_count += 1;
        }
        inner.events = None;
    }

    fn play(&self) -> PlaybackStart {
        let mut inner = self.inner.lock().unwrap();
        inner.play_count += 1;
        if inner.play_blocked {
            PlaybackStart::Blocked
        } else {
            PlaybackStart::Started
        }
    }

    fn buffer_ahead(&self) -> f64 {
        self.inner.lock().unwrap().buffer_ahead
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.inner.lock().unwrap().resolution
    }
}

//! In-memory fake transport for controller testing.
//!
//! Implements the `Transport` seam over a process-local hub: registered
//! identities, registration channels and media calls all live in one
//! mutex-guarded table, and events are delivered synchronously into the
//! unbounded event channels the controllers drain. Knobs inject the
//! failure modes the controllers must recover from.
//!
//! # Example
//!
//! ```rust,ignore
//! use sc_test_utils::FakeTransport;
//!
//! let transport = FakeTransport::new();
//! transport.occupy("ss-abc123");          // force an identity conflict
//! transport.set_strip_media(true);        // answered calls deliver no tracks
//! transport.fail_active_links();          // live links report failed
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::Instant;

use stream_controller::config::RelayEndpoint;
use stream_controller::identity::PeerIdentity;
use stream_controller::media::{MediaStream, MediaTrack};
use stream_controller::transport::{
    CallEvent, CallOps, ChannelEvent, ChannelOps, LinkState, MediaCall, PeerBinding, PeerEvent,
    PeerOps, SignalChannel, Transport, TransportErrorKind,
};

/// One `register()` invocation, for asserting retry schedules.
#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    pub identity: String,
    pub at: Instant,
}

struct PeerRecord {
    events: UnboundedSender<PeerEvent>,
    opened: bool,
}

struct ChannelRecord {
    opener: String,
    target: String,
    opener_events: UnboundedSender<ChannelEvent>,
    target_events: Option<UnboundedSender<ChannelEvent>>,
    closed: bool,
}

struct CallRecord {
    caller: String,
    callee: String,
    caller_events: UnboundedSender<CallEvent>,
    callee_events: UnboundedSender<CallEvent>,
    stream: MediaStream,
    link: LinkState,
    answered: bool,
    closed: bool,
    replaced_track_ids: Vec<String>,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<String, PeerRecord>,
    occupied: HashSet<String>,
    channels: HashMap<u64, ChannelRecord>,
    calls: HashMap<u64, CallRecord>,
    registrations: Vec<RegistrationRecord>,
    sent_payloads: Vec<serde_json::Value>,
    fail_next_registrations: u32,
    conflict_next_registrations: u32,
    strip_media: bool,
    hold_registration_open: bool,
    next_id: u64,
    max_live_viewers: usize,
    reconnects: u32,
}

impl HubInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn note_live_viewers(&mut self) {
        let live = self.peers.keys().filter(|id| id.starts_with("v-")).count();
        if live > self.max_live_viewers {
            self.max_live_viewers = live;
        }
    }

    fn close_channel(&mut self, id: u64, closed_by: &str) {
        if let Some(channel) = self.channels.get_mut(&id) {
            if channel.closed {
                return;
            }
            channel.closed = true;
            if channel.opener != closed_by {
                let _ = channel.opener_events.send(ChannelEvent::Closed);
            }
            if channel.target != closed_by {
                if let Some(target) = &channel.target_events {
                    let _ = target.send(ChannelEvent::Closed);
                }
            }
        }
    }

    fn close_call(&mut self, id: u64, closed_by: &str) {
        if let Some(call) = self.calls.get_mut(&id) {
            if call.closed {
                return;
            }
            call.closed = true;
            call.link = LinkState::Closed;
            if call.caller != closed_by {
                let _ = call.caller_events.send(CallEvent::Closed);
            }
            if call.callee != closed_by {
                let _ = call.callee_events.send(CallEvent::Closed);
            }
        }
    }
}

/// Fake transport hub. Clones share the hub.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<HubInner>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an identity as taken without a live binding behind it.
    pub fn occupy(&self, identity: &str) {
        self.inner
            .lock()
            .unwrap()
            .occupied
            .insert(identity.to_string());
    }

    /// Free a previously occupied identity.
    pub fn release(&self, identity: &str) {
        self.inner.lock().unwrap().occupied.remove(identity);
    }

    /// Make the next `n` registrations fail with a network error.
    pub fn fail_next_registrations(&self, n: u32) {
        self.inner.lock().unwrap().fail_next_registrations = n;
    }

    /// Make the next `n` registrations report the identity as taken,
    /// whatever identity they ask for.
    pub fn conflict_next_registrations(&self, n: u32) {
        self.inner.lock().unwrap().conflict_next_registrations = n;
    }

    /// When set, answered calls deliver a stream with zero tracks.
    pub fn set_strip_media(&self, strip: bool) {
        self.inner.lock().unwrap().strip_media = strip;
    }

    /// When set, registrations are accepted but never report open.
    pub fn set_hold_registration_open(&self, hold: bool) {
        self.inner.lock().unwrap().hold_registration_open = hold;
    }

    /// Report open for every registration still held back.
    pub fn release_registrations(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.hold_registration_open = false;
        for peer in inner.peers.values_mut() {
            if !peer.opened {
                peer.opened = true;
                let _ = peer.events.send(PeerEvent::Open);
            }
        }
    }

    /// Report `failed` on every active media link, both ends.
    pub fn fail_active_links(&self) {
        let mut inner = self.inner.lock().unwrap();
        for call in inner.calls.values_mut() {
            if call.answered && !call.closed {
                call.link = LinkState::Failed;
                let _ = call
                    .caller_events
                    .send(CallEvent::ConnectionState(LinkState::Failed));
                let _ = call
                    .callee_events
                    .send(CallEvent::ConnectionState(LinkState::Failed));
            }
        }
    }

    /// Close every active media call, as the broadcaster going away would.
    pub fn close_active_calls(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<u64> = inner
            .calls
            .iter()
            .filter(|(_, c)| !c.closed)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            inner.close_call(id, "");
        }
    }

    /// Signal `ended` for every video track on every answered call.
    pub fn end_video_tracks(&self) {
        let inner = self.inner.lock().unwrap();
        for call in inner.calls.values() {
            if call.answered && !call.closed {
                for track_id in call.stream.video_track_ids() {
                    let _ = call.callee_events.send(CallEvent::TrackEnded(track_id));
                }
            }
        }
    }

    /// Drop the relay link of one registered identity.
    pub fn disconnect(&self, identity: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get(identity) {
            let _ = peer.events.send(PeerEvent::Disconnected);
        }
    }

    /// Every `register()` call so far, in order.
    #[must_use]
    pub fn registrations(&self) -> Vec<RegistrationRecord> {
        self.inner.lock().unwrap().registrations.clone()
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.lock().unwrap().registrations.len()
    }

    #[must_use]
    pub fn is_registered(&self, identity: &str) -> bool {
        self.inner.lock().unwrap().peers.contains_key(identity)
    }

    /// Identities currently registered.
    #[must_use]
    pub fn live_identities(&self) -> Vec<String> {
        self.inner.lock().unwrap().peers.keys().cloned().collect()
    }

    /// Peak number of simultaneously registered viewer identities.
    #[must_use]
    pub fn max_concurrent_viewers(&self) -> usize {
        self.inner.lock().unwrap().max_live_viewers
    }

    #[must_use]
    pub fn active_call_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .values()
            .filter(|c| !c.closed)
            .count()
    }

    /// Track ids hot-swapped onto active calls, in order.
    #[must_use]
    pub fn replaced_track_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .calls
            .values()
            .flat_map(|c| c.replaced_track_ids.iter().cloned())
            .collect()
    }

    /// Every payload sent over a registration channel, in order.
    #[must_use]
    pub fn sent_payloads(&self) -> Vec<serde_json::Value> {
        self.inner.lock().unwrap().sent_payloads.clone()
    }

    /// Number of relay re-establish requests seen.
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.inner.lock().unwrap().reconnects
    }
}

impl Transport for FakeTransport {
    fn register(&self, identity: &PeerIdentity, _relays: &[RelayEndpoint]) -> PeerBinding {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.registrations.push(RegistrationRecord {
            identity: identity.to_string(),
            at: Instant::now(),
        });

        let key = identity.to_string();
        if inner.fail_next_registrations > 0 {
            inner.fail_next_registrations -= 1;
            let _ = events_tx.send(PeerEvent::Error(TransportErrorKind::Network(
                "injected registration failure".to_string(),
            )));
        } else if inner.conflict_next_registrations > 0 {
            inner.conflict_next_registrations -= 1;
            let _ = events_tx.send(PeerEvent::Error(TransportErrorKind::IdentityTaken));
        } else if inner.peers.contains_key(&key) || inner.occupied.contains(&key) {
            let _ = events_tx.send(PeerEvent::Error(TransportErrorKind::IdentityTaken));
        } else {
            let opened = !inner.hold_registration_open;
            inner.peers.insert(
                key.clone(),
                PeerRecord {
                    events: events_tx.clone(),
                    opened,
                },
            );
            inner.note_live_viewers();
            if opened {
                let _ = events_tx.send(PeerEvent::Open);
            }
        }

        PeerBinding {
            identity: identity.clone(),
            ops: Arc::new(FakePeerOps {
                hub: Arc::clone(&self.inner),
                identity: key,
            }),
            events: events_rx,
        }
    }
}

struct FakePeerOps {
    hub: Arc<Mutex<HubInner>>,
    identity: String,
}

impl PeerOps for FakePeerOps {
    fn open_channel(&self, remote: &PeerIdentity) -> SignalChannel {
        let (opener_tx, opener_rx) = mpsc::unbounded_channel();
        let mut inner = self.hub.lock().unwrap();
        let id = inner.next_id();
        let remote_key = remote.to_string();

        if let Some(target) = inner.peers.get(&remote_key) {
            let (target_tx, target_rx) = mpsc::unbounded_channel();
            let incoming = SignalChannel {
                remote: PeerIdentity::new(self.identity.clone()),
                ops: Arc::new(FakeChannelOps {
                    hub: Arc::clone(&self.hub),
                    id,
                    identity: remote_key.clone(),
                }),
                events: target_rx,
            };
            let _ = target.events.send(PeerEvent::IncomingChannel(incoming));
            let _ = opener_tx.send(ChannelEvent::Open);
            let _ = target_tx.send(ChannelEvent::Open);
            inner.channels.insert(
                id,
                ChannelRecord {
                    opener: self.identity.clone(),
                    target: remote_key,
                    opener_events: opener_tx,
                    target_events: Some(target_tx),
                    closed: false,
                },
            );
        } else {
            // No such identity registered; reported on the opener's peer
            // events, matching how the broker behaves.
            if let Some(own) = inner.peers.get(&self.identity) {
                let _ = own
                    .events
                    .send(PeerEvent::Error(TransportErrorKind::PeerUnavailable));
            }
            inner.channels.insert(
                id,
                ChannelRecord {
                    opener: self.identity.clone(),
                    target: remote_key,
                    opener_events: opener_tx,
                    target_events: None,
                    closed: true,
                },
            );
        }

        SignalChannel {
            remote: remote.clone(),
            ops: Arc::new(FakeChannelOps {
                hub: Arc::clone(&self.hub),
                id,
                identity: self.identity.clone(),
            }),
            events: opener_rx,
        }
    }

    fn call(&self, remote: &PeerIdentity, stream: MediaStream) -> MediaCall {
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let mut inner = self.hub.lock().unwrap();
        let id = inner.next_id();
        let remote_key = remote.to_string();

        if let Some(target) = inner.peers.get(&remote_key) {
            let (callee_tx, callee_rx) = mpsc::unbounded_channel();
            let incoming = MediaCall {
                remote: PeerIdentity::new(self.identity.clone()),
                ops: Arc::new(FakeCallOps {
                    hub: Arc::clone(&self.hub),
                    id,
                    identity: remote_key.clone(),
                }),
                events: callee_rx,
            };
            let _ = target.events.send(PeerEvent::IncomingCall(incoming));
            inner.calls.insert(
                id,
                CallRecord {
                    caller: self.identity.clone(),
                    callee: remote_key,
                    caller_events: caller_tx,
                    callee_events: callee_tx,
                    stream,
                    link: LinkState::Connecting,
                    answered: false,
                    closed: false,
                    replaced_track_ids: Vec::new(),
                },
            );
        } else {
            if let Some(own) = inner.peers.get(&self.identity) {
                let _ = own
                    .events
                    .send(PeerEvent::Error(TransportErrorKind::PeerUnavailable));
            }
            let (callee_tx, _callee_rx) = mpsc::unbounded_channel();
            inner.calls.insert(
                id,
                CallRecord {
                    caller: self.identity.clone(),
                    callee: remote_key,
                    caller_events: caller_tx,
                    callee_events: callee_tx,
                    stream,
                    link: LinkState::Closed,
                    answered: false,
                    closed: true,
                    replaced_track_ids: Vec::new(),
                },
            );
        }

        MediaCall {
            remote: remote.clone(),
            ops: Arc::new(FakeCallOps {
                hub: Arc::clone(&self.hub),
                id,
                identity: self.identity.clone(),
            }),
            events: caller_rx,
        }
    }

    fn reconnect(&self) {
        let mut inner = self.hub.lock().unwrap();
        inner.reconnects += 1;
        let hold = inner.hold_registration_open;
        if let Some(peer) = inner.peers.get_mut(&self.identity) {
            if hold {
                // Re-open is pending until `release_registrations`.
                peer.opened = false;
            } else {
                peer.opened = true;
                let _ = peer.events.send(PeerEvent::Open);
            }
        }
    }

    fn destroy(&self) {
        let mut inner = self.hub.lock().unwrap();
        if inner.peers.remove(&self.identity).is_none() {
            return;
        }
        let channel_ids: Vec<u64> = inner
            .channels
            .iter()
            .filter(|(_, c)| !c.closed && (c.opener == self.identity || c.target == self.identity))
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            inner.close_channel(id, &self.identity);
        }
        let call_ids: Vec<u64> = inner
            .calls
            .iter()
            .filter(|(_, c)| !c.closed && (c.caller == self.identity || c.callee == self.identity))
            .map(|(id, _)| *id)
            .collect();
        for id in call_ids {
            inner.close_call(id, &self.identity);
        }
    }
}

struct FakeChannelOps {
    hub: Arc<Mutex<HubInner>>,
    id: u64,
    identity: String,
}

impl ChannelOps for FakeChannelOps {
    fn send(&self, payload: serde_json::Value) {
        let mut inner = self.hub.lock().unwrap();
        inner.sent_payloads.push(payload.clone());
        if let Some(channel) = inner.channels.get(&self.id) {
            if channel.closed {
                return;
            }
            if channel.opener == self.identity {
                if let Some(target) = &channel.target_events {
                    let _ = target.send(ChannelEvent::Data(payload));
                }
            } else {
                let _ = channel.opener_events.send(ChannelEvent::Data(payload));
            }
        }
    }

    fn close(&self) {
        let mut inner = self.hub.lock().unwrap();
        inner.close_channel(self.id, &self.identity);
    }
}

struct FakeCallOps {
    hub: Arc<Mutex<HubInner>>,
    id: u64,
    identity: String,
}

impl CallOps for FakeCallOps {
    fn answer(&self, _stream: MediaStream) {
        let mut inner = self.hub.lock().unwrap();
        let strip = inner.strip_media;
        if let Some(call) = inner.calls.get_mut(&self.id) {
            if call.answered || call.closed {
                return;
            }
            call.answered = true;
            call.link = LinkState::Connected;
            let delivered = if strip {
                MediaStream::empty()
            } else {
                call.stream.clone()
            };
            let _ = call.callee_events.send(CallEvent::Stream(delivered));
            let _ = call
                .caller_events
                .send(CallEvent::ConnectionState(LinkState::Connected));
            let _ = call
                .callee_events
                .send(CallEvent::ConnectionState(LinkState::Connected));
        }
    }

    fn replace_track(&self, track: MediaTrack) -> bool {
        let mut inner = self.hub.lock().unwrap();
        if let Some(call) = inner.calls.get_mut(&self.id) {
            if call.closed {
                return false;
            }
            let track_id = track.id().to_string();
            if call.stream.replace_track(track) {
                call.replaced_track_ids.push(track_id);
                return true;
            }
        }
        false
    }

    fn link_state(&self) -> LinkState {
        let inner = self.hub.lock().unwrap();
        inner
            .calls
            .get(&self.id)
            .map_or(LinkState::Closed, |c| c.link)
    }

    fn close(&self) {
        let mut inner = self.hub.lock().unwrap();
        inner.close_call(self.id, &self.identity);
    }
}

//! Narrow seam over the real-time transport collaborator.
//!
//! The controllers never talk to a concrete network stack. They consume
//! this interface: `register` yields a [`PeerBinding`] whose event stream
//! reports open/incoming-channel/incoming-call/error/disconnected, and
//! whose ops place calls and open lightweight registration channels.
//! Address resolution, traversal and codec negotiation all live behind it.
//!
//! Event receivers are owned streams: the controller moves them into
//! forwarder tasks feeding its single event loop, which is what keeps all
//! transitions serialized.
//!
//! Contract notes:
//! - `destroy()` releases every resource owned by the registration and is
//!   idempotent; so are `close()` on channels and calls.
//! - `link_state()` exposes the underlying connection state of a call for
//!   inspection between events.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::RelayEndpoint;
use crate::identity::PeerIdentity;
use crate::media::{MediaStream, MediaTrack};

/// Transport-level failure kinds, as reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The requested identity is already registered.
    IdentityTaken,
    /// The remote identity is not registered.
    PeerUnavailable,
    /// Anything else: network, relay, negotiation.
    Network(String),
}

/// Underlying connection state of a media call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events on a registered peer identity.
pub enum PeerEvent {
    /// The registration is open; the identity is now routable.
    Open,
    /// A remote peer opened a registration channel to us.
    IncomingChannel(SignalChannel),
    /// A remote peer is calling us with media.
    IncomingCall(MediaCall),
    /// A transport-level error on this registration.
    Error(TransportErrorKind),
    /// The link to the signaling relay dropped.
    Disconnected,
}

/// Events on a registration channel.
pub enum ChannelEvent {
    Open,
    Data(serde_json::Value),
    Closed,
    Error(TransportErrorKind),
}

/// Events on a media call.
pub enum CallEvent {
    /// The remote side's stream arrived.
    Stream(MediaStream),
    /// The underlying connection state changed.
    ConnectionState(LinkState),
    /// A remote track signaled that it ended.
    TrackEnded(String),
    Closed,
    Error(TransportErrorKind),
}

/// Operations on a registered identity.
pub trait PeerOps: Send + Sync {
    /// Open a lightweight registration channel to a remote identity.
    fn open_channel(&self, remote: &PeerIdentity) -> SignalChannel;

    /// Place an outbound media call to a remote identity.
    fn call(&self, remote: &PeerIdentity, stream: MediaStream) -> MediaCall;

    /// Ask the collaborator to re-establish its relay link after a
    /// `Disconnected` event. Keeps the identity.
    fn reconnect(&self);

    /// Deregister the identity and release every owned resource.
    /// Idempotent: safe on an already-destroyed registration.
    fn destroy(&self);
}

/// Operations on a registration channel.
pub trait ChannelOps: Send + Sync {
    /// Best-effort send; errors surface as channel events, not here.
    fn send(&self, payload: serde_json::Value);

    /// Idempotent close.
    fn close(&self);
}

/// Operations on a media call.
pub trait CallOps: Send + Sync {
    /// Answer an inbound call with a local stream (empty for receive-only).
    fn answer(&self, stream: MediaStream);

    /// Hot-swap the outgoing track of matching kind without renegotiating.
    /// Returns false when no matching sender exists (no-op).
    fn replace_track(&self, track: MediaTrack) -> bool;

    /// Inspect the underlying connection state.
    fn link_state(&self) -> LinkState;

    /// Idempotent close.
    fn close(&self);
}

/// A registered peer identity: ops plus its event stream.
pub struct PeerBinding {
    pub identity: PeerIdentity,
    pub ops: Arc<dyn PeerOps>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// A registration channel: ops plus its event stream.
pub struct SignalChannel {
    pub remote: PeerIdentity,
    pub ops: Arc<dyn ChannelOps>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// A media call: ops plus its event stream.
pub struct MediaCall {
    pub remote: PeerIdentity,
    pub ops: Arc<dyn CallOps>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

/// The transport collaborator itself.
pub trait Transport: Send + Sync {
    /// Register an identity with the signaling namespace.
    ///
    /// Conflicts and relay failures are reported through the binding's
    /// event stream, not as a return error, mirroring how the collaborator
    /// behaves on the wire.
    fn register(&self, identity: &PeerIdentity, relays: &[RelayEndpoint]) -> PeerBinding;
}

impl LinkState {
    /// Whether this state means the call is gone for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_link_states() {
        assert!(LinkState::Failed.is_terminal());
        assert!(LinkState::Closed.is_terminal());
        assert!(!LinkState::Connecting.is_terminal());
        assert!(!LinkState::Connected.is_terminal());
        assert!(!LinkState::Disconnected.is_terminal());
    }
}

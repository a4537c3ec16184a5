//! `BroadcastActor` - one-to-many broadcast session controller.
//!
//! Owns the broadcast lifecycle: registers the deterministic identity
//! derived from a fresh stream id, waits for viewers to open registration
//! channels, and calls each viewer back with the outgoing stream. The
//! broadcaster always initiates the media call, never the viewer.
//!
//! # Lifecycle
//!
//! 1. `start()` validates the stream, creates the session and registers
//! 2. Runs until `stop()`, handle drop, or cancellation
//! 3. An identity conflict regenerates the stream id once; a second
//!    conflict parks the session in the Error phase

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::identity::{derive_broadcast_identity, generate_stream_id, share_url, PeerIdentity};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::sink::SpectrumSource;
use crate::telemetry::AudioLevelMeter;
use crate::transport::{CallEvent, CallOps, ChannelEvent, PeerEvent, PeerOps, Transport};

use super::messages::{
    BroadcastCommand, BroadcastPhase, BroadcastStatus, CallState, SourceMode, StreamSession,
    ViewerConnection,
};

/// Channel buffer size for the broadcast mailbox.
const BROADCAST_CHANNEL_BUFFER: usize = 64;

/// Handle to a `BroadcastActor`.
#[derive(Clone)]
pub struct BroadcastActorHandle {
    sender: mpsc::Sender<BroadcastCommand>,
    status: watch::Receiver<BroadcastStatus>,
    cancel_token: CancellationToken,
}

impl BroadcastActorHandle {
    /// Start broadcasting `stream`. Requires at least one track.
    ///
    /// Responds as soon as the session exists and registration is
    /// underway; watch the status for the Live transition.
    pub async fn start(
        &self,
        stream: MediaStream,
        mode: SourceMode,
        title: impl Into<String>,
    ) -> Result<StreamSession, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BroadcastCommand::Start {
                stream,
                mode,
                title: title.into(),
                respond_to: tx,
            })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))?
    }

    /// Stop broadcasting and release every session resource. Idempotent.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BroadcastCommand::Stop { respond_to: tx })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// Hot-swap the outgoing track of matching kind on every active call.
    pub async fn replace_track(&self, track: MediaTrack) -> Result<(), SessionError> {
        self.sender
            .send(BroadcastCommand::ReplaceTrack { track })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    /// Toggle every outgoing track of one kind (mic / camera mute).
    pub async fn set_track_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.sender
            .send(BroadcastCommand::SetTrackEnabled { kind, enabled })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    /// Rename the running session.
    pub async fn set_title(&self, title: impl Into<String>) -> Result<(), SessionError> {
        self.sender
            .send(BroadcastCommand::SetTitle {
                title: title.into(),
            })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    /// Subscribe to status snapshots.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<BroadcastStatus> {
        self.status.clone()
    }

    /// Cancel the actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal events re-injected into the actor loop by forwarder tasks.
enum BroadcastEvent {
    Peer {
        reg: u64,
        event: PeerEvent,
    },
    Channel {
        reg: u64,
        remote: PeerIdentity,
        event: ChannelEvent,
    },
    Call {
        reg: u64,
        remote: PeerIdentity,
        event: CallEvent,
    },
    /// Conflict backoff elapsed; re-register under the regenerated id.
    ConflictRetry {
        session: u64,
    },
    DurationTick {
        session: u64,
    },
    MeterTick {
        session: u64,
    },
}

/// One live registration with the transport.
struct Registration {
    reg_seq: u64,
    reg_scope: CancellationToken,
    ops: Arc<dyn PeerOps>,
}

/// State for one broadcast session, start to stop.
struct ActiveSession {
    session_seq: u64,
    /// Cancels session-lifetime tasks (tickers); parent of every
    /// registration scope.
    session_scope: CancellationToken,
    session: StreamSession,
    stream: MediaStream,
    started: Instant,
    registration: Option<Registration>,
    /// Whether the one allowed stream-id regeneration happened.
    regenerated: bool,
    viewers: HashMap<PeerIdentity, ViewerConnection>,
    calls: HashMap<PeerIdentity, Arc<dyn CallOps>>,
}

/// The `BroadcastActor` implementation.
pub struct BroadcastActor {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    /// Outbound audio observation point, when the embedder provides one.
    spectrum: Option<Arc<dyn SpectrumSource>>,
    commands: mpsc::Receiver<BroadcastCommand>,
    events_tx: mpsc::UnboundedSender<BroadcastEvent>,
    events_rx: mpsc::UnboundedReceiver<BroadcastEvent>,
    status: watch::Sender<BroadcastStatus>,
    cancel_token: CancellationToken,
    session_seq: u64,
    reg_seq: u64,
    phase: BroadcastPhase,
    error: Option<String>,
    active: Option<ActiveSession>,
    meter: AudioLevelMeter,
}

impl BroadcastActor {
    /// Spawn a new broadcast actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        spectrum: Option<Arc<dyn SpectrumSource>>,
    ) -> (BroadcastActorHandle, JoinHandle<()>) {
        let (sender, commands) = mpsc::channel(BROADCAST_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(BroadcastStatus::default());
        let cancel_token = CancellationToken::new();

        let actor = Self {
            config,
            transport,
            spectrum,
            commands,
            events_tx,
            events_rx,
            status: status_tx,
            cancel_token: cancel_token.clone(),
            session_seq: 0,
            reg_seq: 0,
            phase: BroadcastPhase::Idle,
            error: None,
            active: None,
            meter: AudioLevelMeter::new(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = BroadcastActorHandle {
            sender,
            status: status_rx,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.actor.broadcast")]
    async fn run(mut self) {
        debug!(target: "sc.actor.broadcast", "BroadcastActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "sc.actor.broadcast", "BroadcastActor received cancellation signal");
                    break;
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!(target: "sc.actor.broadcast", "BroadcastActor mailbox closed, exiting");
                            break;
                        }
                    }
                }

                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
            }
        }

        self.teardown_session();
        info!(target: "sc.actor.broadcast", "BroadcastActor stopped");
    }

    fn handle_command(&mut self, command: BroadcastCommand) {
        match command {
            BroadcastCommand::Start {
                stream,
                mode,
                title,
                respond_to,
            } => {
                let result = self.handle_start(stream, mode, title);
                let _ = respond_to.send(result);
            }

            BroadcastCommand::Stop { respond_to } => {
                self.teardown_session();
                let _ = respond_to.send(());
            }

            BroadcastCommand::ReplaceTrack { track } => self.handle_replace_track(track),

            BroadcastCommand::SetTrackEnabled { kind, enabled } => {
                if let Some(active) = &self.active {
                    debug!(
                        target: "sc.actor.broadcast",
                        kind = %kind,
                        enabled,
                        "Toggling outgoing tracks"
                    );
                    active.stream.set_kind_enabled(kind, enabled);
                }
            }

            BroadcastCommand::SetTitle { title } => {
                if let Some(active) = self.active.as_mut() {
                    active.session.title = title;
                    self.publish();
                }
            }
        }
    }

    fn handle_start(
        &mut self,
        stream: MediaStream,
        mode: SourceMode,
        title: String,
    ) -> Result<StreamSession, SessionError> {
        if stream.is_empty() {
            return Err(SessionError::EmptyMedia);
        }
        self.teardown_session();

        self.session_seq += 1;
        let session_scope = self.cancel_token.child_token();
        let stream_id = generate_stream_id();
        let session = StreamSession {
            stream_id: stream_id.clone(),
            broadcaster_identity: derive_broadcast_identity(&stream_id),
            title,
            source_mode: mode,
            started_at: Utc::now(),
            share_url: share_url(&self.config.share_origin, &self.config.share_path, &stream_id),
        };

        info!(
            target: "sc.actor.broadcast",
            stream_id = %stream_id,
            mode = %mode,
            "Broadcast starting"
        );

        self.active = Some(ActiveSession {
            session_seq: self.session_seq,
            session_scope: session_scope.clone(),
            session: session.clone(),
            stream,
            started: Instant::now(),
            registration: None,
            regenerated: false,
            viewers: HashMap::new(),
            calls: HashMap::new(),
        });
        self.phase = BroadcastPhase::Starting;
        self.error = None;

        self.register();
        self.spawn_tickers(&session_scope);
        self.publish();
        Ok(session)
    }

    /// Register the current session identity with the transport.
    fn register(&mut self) {
        self.reg_seq += 1;
        let reg_seq = self.reg_seq;
        let events_tx = self.events_tx.clone();
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let reg_scope = active.session_scope.child_token();
        let binding = self
            .transport
            .register(&active.session.broadcaster_identity, &self.config.relay_endpoints);

        forward_peer_events(binding.events, reg_seq, events_tx, reg_scope.clone());
        active.registration = Some(Registration {
            reg_seq,
            reg_scope,
            ops: binding.ops,
        });
    }

    fn spawn_tickers(&self, scope: &CancellationToken) {
        let session = self.session_seq;

        let tx = self.events_tx.clone();
        let duration_scope = scope.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = duration_scope.cancelled() => return,
                    _ = ticker.tick() => {
                        if tx.send(BroadcastEvent::DurationTick { session }).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        if self.spectrum.is_some() {
            let tx = self.events_tx.clone();
            let meter_scope = scope.clone();
            let period = self.config.meter_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = meter_scope.cancelled() => return,
                        _ = ticker.tick() => {
                            if tx.send(BroadcastEvent::MeterTick { session }).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    }

    fn handle_event(&mut self, event: BroadcastEvent) {
        match event {
            BroadcastEvent::Peer { reg, event } => self.handle_peer_event(reg, event),
            BroadcastEvent::Channel { reg, remote, event } => {
                self.handle_channel_event(reg, remote, event);
            }
            BroadcastEvent::Call { reg, remote, event } => {
                self.handle_call_event(reg, remote, event);
            }

            BroadcastEvent::ConflictRetry { session } => {
                if self.is_current_session(session) {
                    self.register();
                    self.phase = BroadcastPhase::Starting;
                    self.publish();
                }
            }

            BroadcastEvent::DurationTick { session } => {
                if self.is_current_session(session) {
                    if let Some(active) = &self.active {
                        let elapsed = active.started.elapsed().as_secs();
                        self.status.send_modify(|s| s.duration_secs = elapsed);
                    }
                }
            }

            BroadcastEvent::MeterTick { session } => {
                if self.is_current_session(session) {
                    if let Some(spectrum) = self.spectrum.as_ref().and_then(|s| s.spectrum()) {
                        let levels = self.meter.sample(&spectrum);
                        self.status.send_modify(|s| s.audio = levels);
                    }
                }
            }
        }
    }

    fn is_current_session(&self, session: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.session_seq == session)
    }

    /// Whether `reg` is the current registration generation.
    fn is_current_registration(&self, reg: u64) -> bool {
        self.active
            .as_ref()
            .and_then(|a| a.registration.as_ref())
            .is_some_and(|r| r.reg_seq == reg)
    }

    fn handle_peer_event(&mut self, reg: u64, event: PeerEvent) {
        if !self.is_current_registration(reg) {
            debug!(target: "sc.actor.broadcast", reg, "Dropping stale registration event");
            return;
        }

        match event {
            PeerEvent::Open => {
                info!(target: "sc.actor.broadcast", "Registration open, accepting viewers");
                self.phase = BroadcastPhase::Live;
                self.publish();
            }

            PeerEvent::IncomingChannel(channel) => {
                debug!(
                    target: "sc.actor.broadcast",
                    viewer = %channel.remote,
                    "Viewer registering"
                );
                let scope = match self.active.as_ref().and_then(|a| a.registration.as_ref()) {
                    Some(registration) => registration.reg_scope.clone(),
                    None => return,
                };
                forward_channel_events(
                    channel.events,
                    reg,
                    channel.remote,
                    self.events_tx.clone(),
                    scope,
                );
            }

            PeerEvent::IncomingCall(call) => {
                debug!(
                    target: "sc.actor.broadcast",
                    remote = %call.remote,
                    "Ignoring inbound call; the broadcaster initiates media"
                );
            }

            PeerEvent::Error(kind) => self.handle_transport_error(kind),

            PeerEvent::Disconnected => {
                warn!(target: "sc.actor.broadcast", "Relay link lost, reconnecting");
                if let Some(registration) =
                    self.active.as_ref().and_then(|a| a.registration.as_ref())
                {
                    registration.ops.reconnect();
                }
                self.phase = BroadcastPhase::Starting;
                self.publish();
            }
        }
    }

    fn handle_transport_error(&mut self, kind: crate::transport::TransportErrorKind) {
        use crate::transport::TransportErrorKind;
        match kind {
            TransportErrorKind::IdentityTaken => self.handle_identity_conflict(),

            // A viewer vanished before the callback reached it. The next
            // registration from that viewer starts over.
            TransportErrorKind::PeerUnavailable => {
                debug!(target: "sc.actor.broadcast", "Callback target unavailable");
            }

            TransportErrorKind::Network(message) => {
                warn!(target: "sc.actor.broadcast", %message, "Transport error");
                self.phase = BroadcastPhase::Error;
                self.error = Some(SessionError::TransportFailure(message).user_message());
                self.publish();
            }
        }
    }

    /// The derived identity is taken. Regenerate the stream id once and
    /// re-register after a short pause; a second conflict is terminal.
    fn handle_identity_conflict(&mut self) {
        let events_tx = self.events_tx.clone();
        let delay = self.config.conflict_retry_delay();
        let origin = self.config.share_origin.clone();
        let path = self.config.share_path.clone();

        let Some(active) = self.active.as_mut() else {
            return;
        };

        if let Some(registration) = active.registration.take() {
            registration.reg_scope.cancel();
            registration.ops.destroy();
        }

        if active.regenerated {
            warn!(target: "sc.actor.broadcast", "Identity conflict persists after regeneration");
            self.phase = BroadcastPhase::Error;
            self.error = Some(
                SessionError::IdentityConflict(active.session.broadcaster_identity.to_string())
                    .user_message(),
            );
            self.publish();
            return;
        }
        active.regenerated = true;

        let stream_id = generate_stream_id();
        warn!(
            target: "sc.actor.broadcast",
            old_stream_id = %active.session.stream_id,
            new_stream_id = %stream_id,
            "Identity conflict, regenerating stream id"
        );
        active.session.stream_id = stream_id.clone();
        active.session.broadcaster_identity = derive_broadcast_identity(&stream_id);
        active.session.share_url = share_url(&origin, &path, &stream_id);

        let session = active.session_seq;
        let scope = active.session_scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = scope.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = events_tx.send(BroadcastEvent::ConflictRetry { session });
                }
            }
        });
        self.publish();
    }

    fn handle_channel_event(&mut self, reg: u64, remote: PeerIdentity, event: ChannelEvent) {
        if !self.is_current_registration(reg) {
            return;
        }

        match event {
            // Channel open means the viewer is reachable; call it back.
            ChannelEvent::Open => self.call_viewer(remote),

            ChannelEvent::Data(payload) => {
                debug!(
                    target: "sc.actor.broadcast",
                    viewer = %remote,
                    %payload,
                    "Registration payload"
                );
            }

            // The call lifecycle governs the viewer entry; a dropped
            // registration channel on its own changes nothing.
            ChannelEvent::Closed | ChannelEvent::Error(_) => {
                debug!(
                    target: "sc.actor.broadcast",
                    viewer = %remote,
                    "Registration channel gone"
                );
            }
        }
    }

    fn call_viewer(&mut self, viewer: PeerIdentity) {
        let events_tx = self.events_tx.clone();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(registration) = active.registration.as_ref() else {
            return;
        };

        info!(target: "sc.actor.broadcast", viewer = %viewer, "Calling viewer back");
        let call = registration.ops.call(&viewer, active.stream.clone());
        forward_call_events(
            call.events,
            registration.reg_seq,
            viewer.clone(),
            events_tx,
            registration.reg_scope.clone(),
        );
        active.calls.insert(viewer.clone(), call.ops);
        active.viewers.insert(
            viewer.clone(),
            ViewerConnection {
                viewer_identity: viewer,
                joined_at: Utc::now(),
                call_state: CallState::Connecting,
            },
        );
        self.publish();
    }

    fn handle_call_event(&mut self, reg: u64, remote: PeerIdentity, event: CallEvent) {
        if !self.is_current_registration(reg) {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };

        match event {
            CallEvent::ConnectionState(link) => {
                if let Some(viewer) = active.viewers.get_mut(&remote) {
                    viewer.call_state = CallState::from(link);
                    self.publish();
                }
            }

            CallEvent::Closed | CallEvent::Error(_) => {
                debug!(target: "sc.actor.broadcast", viewer = %remote, "Viewer call ended");
                active.calls.remove(&remote);
                active.viewers.remove(&remote);
                self.publish();
            }

            // Outbound calls carry no inbound media.
            CallEvent::Stream(_) | CallEvent::TrackEnded(_) => {}
        }
    }

    fn handle_replace_track(&mut self, track: MediaTrack) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        for (viewer, ops) in &active.calls {
            if !ops.replace_track(track.clone()) {
                debug!(
                    target: "sc.actor.broadcast",
                    viewer = %viewer,
                    kind = %track.kind(),
                    "No matching sender for track replacement"
                );
            }
        }
        // Keep the local stream in step so later joiners get the new track.
        if !active.stream.replace_track(track.clone()) {
            debug!(
                target: "sc.actor.broadcast",
                kind = %track.kind(),
                "No local track of this kind to replace"
            );
        }
    }

    /// Release every session resource and return to Idle. Idempotent.
    fn teardown_session(&mut self) {
        if let Some(active) = self.active.take() {
            info!(
                target: "sc.actor.broadcast",
                stream_id = %active.session.stream_id,
                viewers = active.viewers.len(),
                "Broadcast stopping"
            );
            active.session_scope.cancel();
            for ops in active.calls.values() {
                ops.close();
            }
            if let Some(registration) = active.registration {
                registration.ops.destroy();
            }
        }
        self.meter.reset();
        self.phase = BroadcastPhase::Idle;
        self.error = None;
        let _ = self.status.send(BroadcastStatus::default());
    }

    /// Publish a full status snapshot from current state.
    fn publish(&self) {
        let (session, viewers) = match &self.active {
            Some(active) => {
                let mut viewers: Vec<ViewerConnection> =
                    active.viewers.values().cloned().collect();
                viewers.sort_by_key(|v| v.joined_at);
                (Some(active.session.clone()), viewers)
            }
            None => (None, Vec::new()),
        };
        self.status.send_modify(|s| {
            s.phase = self.phase;
            s.session = session;
            s.viewers = viewers;
            s.error = self.error.clone();
        });
    }
}

fn forward_peer_events(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    reg: u64,
    tx: mpsc::UnboundedSender<BroadcastEvent>,
    scope: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        if tx.send(BroadcastEvent::Peer { reg, event }).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    });
}

fn forward_channel_events(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    reg: u64,
    remote: PeerIdentity,
    tx: mpsc::UnboundedSender<BroadcastEvent>,
    scope: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        let forwarded = BroadcastEvent::Channel {
                            reg,
                            remote: remote.clone(),
                            event,
                        };
                        if tx.send(forwarded).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    });
}

fn forward_call_events(
    mut events: mpsc::UnboundedReceiver<CallEvent>,
    reg: u64,
    remote: PeerIdentity,
    tx: mpsc::UnboundedSender<BroadcastEvent>,
    scope: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        let forwarded = BroadcastEvent::Call {
                            reg,
                            remote: remote.clone(),
                            event,
                        };
                        if tx.send(forwarded).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    });
}

//! `ViewerActor` - viewer session controller with bounded reconnection.
//!
//! Drives the join sequence for one viewer: register an ephemeral
//! identity, open the registration channel to the broadcaster, wait for
//! the callback call, answer receive-only, hand the remote stream to the
//! sink. Any failure along the way tears the attempt down and feeds the
//! backoff scheduler; a deliberate end of the broadcast is terminal until
//! an explicit `connect()`.
//!
//! # Lifecycle
//!
//! 1. Spawning starts the first attempt immediately
//! 2. Runs until `stop()`, handle drop, or cancellation
//! 3. Every attempt gets a fresh identity and a fresh cancellation scope;
//!    events from a torn down attempt are dropped by sequence number

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::errors::{SessionError, WaitStage};
use crate::identity::{derive_broadcast_identity, PeerIdentity};
use crate::media::MediaStream;
use crate::retry::{RetryPolicy, RetryTick, RetryTimer};
use crate::sink::{MediaSink, PlaybackStart, SinkEvent};
use crate::telemetry::{AudioLevelMeter, PlaybackStats, QualityBucket};
use crate::transport::{
    CallEvent, CallOps, ChannelEvent, ChannelOps, PeerEvent, PeerOps, Transport,
    TransportErrorKind,
};

use super::messages::{ViewerCommand, ViewerPhase, ViewerStatus};

/// Channel buffer size for the viewer mailbox.
const VIEWER_CHANNEL_BUFFER: usize = 64;

/// Handle to a `ViewerActor`.
#[derive(Clone)]
pub struct ViewerActorHandle {
    sender: mpsc::Sender<ViewerCommand>,
    status: watch::Receiver<ViewerStatus>,
    cancel_token: CancellationToken,
}

impl ViewerActorHandle {
    /// Start over with a fresh attempt budget. Valid from any phase,
    /// including Ended.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.sender
            .send(ViewerCommand::Connect)
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    /// Skip the pending backoff delay. The skipped wait does not count
    /// against the attempt budget.
    pub async fn retry_now(&self) -> Result<(), SessionError> {
        self.sender
            .send(ViewerCommand::RetryNow)
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    /// Tear down the session. Idempotent.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ViewerCommand::Stop { respond_to: tx })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// Subscribe to status snapshots.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ViewerStatus> {
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

/// Internal events re-injected into the actor loop.
enum ViewerEvent {
    Peer { attempt: u64, event: PeerEvent },
    Channel { attempt: u64, event: ChannelEvent },
    Call { attempt: u64, event: CallEvent },
    Sink { attempt: u64, event: SinkEvent },
    /// A bounded wait for this attempt expired.
    WaitExpired { attempt: u64, stage: WaitStage },
    Retry(RetryTick),
    StatsTick { attempt: u64 },
    MeterTick { attempt: u64 },
    LiveTick { attempt: u64 },
}

impl From<RetryTick> for ViewerEvent {
    fn from(tick: RetryTick) -> Self {
        ViewerEvent::Retry(tick)
    }
}

/// How far the current attempt has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitRegistration,
    AwaitChannel,
    AwaitCall,
    AwaitStream,
    Live,
}

impl Stage {
    /// The bounded wait guarding this stage, if any.
    fn wait_stage(self) -> Option<WaitStage> {
        match self {
            Stage::AwaitRegistration => Some(WaitStage::RegistrationOpen),
            Stage::AwaitChannel => Some(WaitStage::ChannelOpen),
            Stage::AwaitCall => Some(WaitStage::InboundCall),
            Stage::AwaitStream => Some(WaitStage::RemoteStream),
            Stage::Live => None,
        }
    }
}

/// Resources of one connection attempt.
struct Attempt {
    seq: u64,
    scope: CancellationToken,
    identity: PeerIdentity,
    peer_ops: Arc<dyn PeerOps>,
    channel_ops: Option<Arc<dyn ChannelOps>>,
    call_ops: Option<Arc<dyn CallOps>>,
    /// The remote stream, once received; used to match ended video tracks.
    remote_stream: Option<MediaStream>,
    attached: bool,
    stage: Stage,
    live_since: Option<Instant>,
}

/// The `ViewerActor` implementation.
pub struct ViewerActor {
    stream_id: String,
    broadcast_identity: PeerIdentity,
    config: SessionConfig,
    policy: RetryPolicy,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn MediaSink>,
    commands: mpsc::Receiver<ViewerCommand>,
    events_tx: mpsc::UnboundedSender<ViewerEvent>,
    events_rx: mpsc::UnboundedReceiver<ViewerEvent>,
    status: watch::Sender<ViewerStatus>,
    cancel_token: CancellationToken,
    seq: u64,
    /// Consecutive failed attempts; reset on reaching Live.
    retry_count: u32,
    attempt: Option<Attempt>,
    retry_timer: RetryTimer,
    meter: AudioLevelMeter,
}

impl ViewerActor {
    /// Spawn a viewer actor for `stream_id` and start connecting.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        stream_id: impl Into<String>,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn MediaSink>,
    ) -> (ViewerActorHandle, JoinHandle<()>) {
        let stream_id = stream_id.into();
        let (sender, commands) = mpsc::channel(VIEWER_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ViewerStatus::default());
        let cancel_token = CancellationToken::new();
        let policy = config.retry_policy();

        let actor = Self {
            broadcast_identity: derive_broadcast_identity(&stream_id),
            stream_id,
            config,
            policy,
            transport,
            sink,
            commands,
            events_tx,
            events_rx,
            status: status_tx,
            cancel_token: cancel_token.clone(),
            seq: 0,
            retry_count: 0,
            attempt: None,
            retry_timer: RetryTimer::new(),
            meter: AudioLevelMeter::new(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ViewerActorHandle {
            sender,
            status: status_rx,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.actor.viewer", fields(stream_id = %self.stream_id))]
    async fn run(mut self) {
        debug!(target: "sc.actor.viewer", stream_id = %self.stream_id, "ViewerActor started");
        self.begin_attempt();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "sc.actor.viewer", "ViewerActor received cancellation signal");
                    break;
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!(target: "sc.actor.viewer", "ViewerActor mailbox closed, exiting");
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

        self.teardown_attempt();
        self.retry_timer.disarm();
        info!(target: "sc.actor.viewer", stream_id = %self.stream_id, "ViewerActor stopped");
    }

    fn handle_command(&mut self, command: ViewerCommand) {
        match command {
            ViewerCommand::Connect => {
                info!(target: "sc.actor.viewer", "Reconnect requested, resetting attempt budget");
                self.retry_count = 0;
                self.begin_attempt();
            }

            ViewerCommand::RetryNow => {
                if self.retry_timer.is_armed() {
                    debug!(target: "sc.actor.viewer", "Skipping backoff on request");
                    self.retry_timer.disarm();
                    // The skipped wait must not cost an attempt.
                    self.retry_count = self.retry_count.saturating_sub(1);
                    self.begin_attempt();
                }
            }

            ViewerCommand::Stop { respond_to } => {
                self.end_session(None);
                let _ = respond_to.send(());
            }
        }
    }

    /// Tear down any previous attempt and start a fresh one.
    fn begin_attempt(&mut self) {
        self.retry_timer.disarm();
        self.teardown_attempt();

        self.seq += 1;
        self.retry_count += 1;
        let seq = self.seq;
        let scope = self.cancel_token.child_token();
        let identity = PeerIdentity::ephemeral();

        debug!(
            target: "sc.actor.viewer",
            attempt = self.retry_count,
            identity = %identity,
            "Connection attempt starting"
        );

        let binding = self.transport.register(&identity, &self.config.relay_endpoints);
        forward_peer_events(binding.events, seq, self.events_tx.clone(), scope.clone());

        self.attempt = Some(Attempt {
            seq,
            scope,
            identity,
            peer_ops: binding.ops,
            channel_ops: None,
            call_ops: None,
            remote_stream: None,
            attached: false,
            stage: Stage::AwaitRegistration,
            live_since: None,
        });
        self.spawn_wait(WaitStage::RegistrationOpen, self.config.registration_open_timeout());

        let retry_count = self.retry_count;
        self.status.send_modify(|s| {
            s.phase = ViewerPhase::Connecting;
            s.retry_count = retry_count;
            s.playing = false;
            s.buffering = false;
            s.has_audio = false;
            s.has_video = false;
            s.live_secs = 0;
            s.quality = None;
            s.stats = None;
            s.error = None;
        });
    }

    /// Arm the bounded wait for the current stage.
    fn spawn_wait(&self, stage: WaitStage, timeout: Duration) {
        let Some(attempt) = &self.attempt else {
            return;
        };
        let seq = attempt.seq;
        let scope = attempt.scope.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = scope.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let _ = tx.send(ViewerEvent::WaitExpired { attempt: seq, stage });
                }
            }
        });
    }

    fn handle_event(&mut self, event: ViewerEvent) {
        match event {
            ViewerEvent::Peer { attempt, event } => self.handle_peer_event(attempt, event),
            ViewerEvent::Channel { attempt, event } => self.handle_channel_event(attempt, event),
            ViewerEvent::Call { attempt, event } => self.handle_call_event(attempt, event),
            ViewerEvent::Sink { attempt, event } => self.handle_sink_event(attempt, event),

            ViewerEvent::WaitExpired { attempt, stage } => {
                if self.current_stage(attempt).and_then(Stage::wait_stage) == Some(stage) {
                    warn!(target: "sc.actor.viewer", %stage, "Wait expired");
                    self.fail_attempt(&SessionError::Timeout(stage));
                }
            }

            ViewerEvent::Retry(RetryTick::Countdown { seconds_left }) => {
                self.status.send_modify(|s| {
                    if let ViewerPhase::Retrying { attempt, .. } = s.phase {
                        s.phase = ViewerPhase::Retrying {
                            attempt,
                            seconds_left,
                        };
                    }
                });
            }

            ViewerEvent::Retry(RetryTick::Fire) => {
                // A fire already queued when a stop or manual retry won
                // the select pass is stale; only an armed timer may fire.
                if self.retry_timer.is_armed() {
                    self.begin_attempt();
                }
            }

            ViewerEvent::StatsTick { attempt } => {
                if self.current_stage(attempt) == Some(Stage::Live) {
                    let stats = PlaybackStats::from_sink_readings(
                        self.sink.buffer_ahead(),
                        self.sink.resolution(),
                    );
                    self.status.send_modify(|s| {
                        s.quality = Some(stats.quality);
                        s.stats = Some(stats);
                    });
                }
            }

            ViewerEvent::MeterTick { attempt } => {
                if self.current_stage(attempt) == Some(Stage::Live) {
                    if let Some(spectrum) = self.sink.spectrum() {
                        let levels = self.meter.sample(&spectrum);
                        self.status.send_modify(|s| s.audio = levels);
                    }
                }
            }

            ViewerEvent::LiveTick { attempt } => {
                if self.current_stage(attempt) == Some(Stage::Live) {
                    if let Some(live_since) =
                        self.attempt.as_ref().and_then(|a| a.live_since)
                    {
                        let elapsed = live_since.elapsed().as_secs();
                        self.status.send_modify(|s| s.live_secs = elapsed);
                    }
                }
            }
        }
    }

    /// Stage of the current attempt, or None when `seq` is stale.
    fn current_stage(&self, seq: u64) -> Option<Stage> {
        self.attempt
            .as_ref()
            .filter(|a| a.seq == seq)
            .map(|a| a.stage)
    }

    fn handle_peer_event(&mut self, seq: u64, event: PeerEvent) {
        let Some(stage) = self.current_stage(seq) else {
            debug!(target: "sc.actor.viewer", seq, "Dropping stale attempt event");
            return;
        };

        match event {
            PeerEvent::Open => {
                if stage != Stage::AwaitRegistration {
                    return;
                }
                debug!(target: "sc.actor.viewer", "Registered, opening channel to broadcaster");
                let events_tx = self.events_tx.clone();
                let broadcast_identity = self.broadcast_identity.clone();
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                let channel = attempt.peer_ops.open_channel(&broadcast_identity);
                forward_channel_events(channel.events, seq, events_tx, attempt.scope.clone());
                attempt.channel_ops = Some(channel.ops);
                attempt.stage = Stage::AwaitChannel;
                self.spawn_wait(WaitStage::ChannelOpen, self.config.channel_open_timeout());
            }

            // The broadcaster calls back once our registration channel is
            // open; accept while any pre-stream stage is pending.
            PeerEvent::IncomingCall(call) => {
                if !matches!(stage, Stage::AwaitChannel | Stage::AwaitCall) {
                    return;
                }
                info!(target: "sc.actor.viewer", "Inbound call from broadcaster");
                let events_tx = self.events_tx.clone();
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                forward_call_events(call.events, seq, events_tx, attempt.scope.clone());
                call.ops.answer(MediaStream::empty());
                attempt.call_ops = Some(call.ops);
                attempt.stage = Stage::AwaitStream;
                self.spawn_wait(WaitStage::RemoteStream, self.config.remote_stream_timeout());
            }

            PeerEvent::IncomingChannel(channel) => {
                debug!(
                    target: "sc.actor.viewer",
                    remote = %channel.remote,
                    "Ignoring unsolicited registration channel"
                );
            }

            PeerEvent::Error(TransportErrorKind::IdentityTaken) => {
                // Our random identity collided. Retry almost immediately
                // with a fresh one, without spending an attempt.
                warn!(target: "sc.actor.viewer", "Ephemeral identity collision");
                self.teardown_attempt();
                self.retry_count = self.retry_count.saturating_sub(1);
                self.retry_timer
                    .arm(self.config.collision_retry_delay(), self.events_tx.clone());
            }

            PeerEvent::Error(TransportErrorKind::PeerUnavailable) => {
                self.fail_attempt(&SessionError::PeerUnreachable(
                    self.broadcast_identity.to_string(),
                ));
            }

            PeerEvent::Error(TransportErrorKind::Network(message)) => {
                self.fail_attempt(&SessionError::TransportFailure(message));
            }

            PeerEvent::Disconnected => {
                if stage == Stage::Live {
                    self.status
                        .send_modify(|s| s.quality = Some(QualityBucket::Poor));
                    self.fail_attempt(&SessionError::TransportFailure(
                        "relay link lost".to_string(),
                    ));
                }
            }
        }
    }

    fn handle_channel_event(&mut self, seq: u64, event: ChannelEvent) {
        let Some(stage) = self.current_stage(seq) else {
            return;
        };

        match event {
            ChannelEvent::Open => {
                if stage != Stage::AwaitChannel {
                    return;
                }
                debug!(target: "sc.actor.viewer", "Registered with broadcaster, awaiting call");
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                if let Some(ops) = &attempt.channel_ops {
                    ops.send(serde_json::json!({
                        "type": "register",
                        "viewerId": attempt.identity.as_str(),
                    }));
                }
                attempt.stage = Stage::AwaitCall;
                self.spawn_wait(WaitStage::InboundCall, self.config.inbound_call_timeout());
            }

            ChannelEvent::Closed => {
                // The broadcaster dropping the registration channel while
                // we are live means the broadcast is over. Before live it
                // means the broadcaster went away mid-join; retry now
                // instead of waiting out the stage watchdog.
                if stage == Stage::Live {
                    self.end_session(Some(SessionError::StreamEnded.user_message()));
                } else {
                    self.fail_attempt(&SessionError::TransportFailure(
                        "registration channel closed".to_string(),
                    ));
                }
            }

            ChannelEvent::Error(kind) => {
                if stage != Stage::Live {
                    self.fail_attempt(&SessionError::TransportFailure(format!(
                        "registration channel: {kind:?}"
                    )));
                }
            }

            ChannelEvent::Data(payload) => {
                debug!(target: "sc.actor.viewer", %payload, "Channel data");
            }
        }
    }

    fn handle_call_event(&mut self, seq: u64, event: CallEvent) {
        let Some(stage) = self.current_stage(seq) else {
            return;
        };

        match event {
            CallEvent::Stream(stream) => {
                if stage == Stage::AwaitStream {
                    self.handle_remote_stream(stream);
                }
            }

            CallEvent::ConnectionState(link) => {
                if stage != Stage::Live {
                    return;
                }
                // Terminal link states of a live call are assumed
                // transient at the session level: retry.
                if link.is_terminal() {
                    self.fail_attempt(&SessionError::TransportFailure(
                        "media link failed".to_string(),
                    ));
                } else if let Some(quality) = QualityBucket::for_link_state(link) {
                    self.status.send_modify(|s| s.quality = Some(quality));
                }
            }

            CallEvent::TrackEnded(track_id) => {
                if stage != Stage::Live {
                    return;
                }
                let is_video = self
                    .attempt
                    .as_ref()
                    .and_then(|a| a.remote_stream.as_ref())
                    .is_some_and(|s| s.video_track_ids().contains(&track_id));
                if is_video {
                    info!(target: "sc.actor.viewer", %track_id, "Video track ended");
                    self.end_session(Some(SessionError::StreamEnded.user_message()));
                }
            }

            CallEvent::Closed => {
                if stage == Stage::Live {
                    self.end_session(Some(SessionError::StreamEnded.user_message()));
                } else {
                    self.fail_attempt(&SessionError::TransportFailure(
                        "call closed before media arrived".to_string(),
                    ));
                }
            }

            CallEvent::Error(kind) => {
                self.fail_attempt(&SessionError::TransportFailure(format!("call: {kind:?}")));
            }
        }
    }

    /// The remote stream arrived on the answered call.
    fn handle_remote_stream(&mut self, stream: MediaStream) {
        let has_audio = stream.has_audio();
        let has_video = stream.has_video();
        info!(
            target: "sc.actor.viewer",
            has_audio,
            has_video,
            "Remote stream received"
        );

        if stream.is_empty() {
            self.fail_attempt(&SessionError::EmptyMedia);
            return;
        }

        let events = self.sink.attach(stream.clone());
        let playing = match self.sink.play() {
            PlaybackStart::Started => true,
            PlaybackStart::Blocked => {
                // Platform refused unattended playback; still live, the
                // embedder surfaces a tap-to-play affordance.
                warn!(target: "sc.actor.viewer", "Playback blocked, awaiting user gesture");
                false
            }
        };

        let events_tx = self.events_tx.clone();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let seq = attempt.seq;
        forward_sink_events(events, seq, events_tx, attempt.scope.clone());
        attempt.remote_stream = Some(stream);
        attempt.attached = true;
        attempt.stage = Stage::Live;
        attempt.live_since = Some(Instant::now());
        let scope = attempt.scope.clone();

        // Live housekeeping: playback stats, wall clock, audio meter.
        self.spawn_ticker(seq, self.config.stats_interval(), &scope, |attempt| {
            ViewerEvent::StatsTick { attempt }
        });
        self.spawn_ticker(seq, Duration::from_secs(1), &scope, |attempt| {
            ViewerEvent::LiveTick { attempt }
        });
        if has_audio {
            self.meter.reset();
            self.spawn_ticker(seq, self.config.meter_interval(), &scope, |attempt| {
                ViewerEvent::MeterTick { attempt }
            });
        }

        self.retry_count = 0;
        self.status.send_modify(|s| {
            s.phase = ViewerPhase::Live;
            s.retry_count = 0;
            s.playing = playing;
            s.buffering = false;
            s.has_audio = has_audio;
            s.has_video = has_video;
            s.live_secs = 0;
            s.error = None;
        });
    }

    fn spawn_ticker(
        &self,
        seq: u64,
        period: Duration,
        scope: &CancellationToken,
        make_event: fn(u64) -> ViewerEvent,
    ) {
        let tx = self.events_tx.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval fires immediately; the first reading is wanted
            // anyway, so no tick is discarded here.
            loop {
                tokio::select! {
                    () = scope.cancelled() => return,
                    _ = ticker.tick() => {
                        if tx.send(make_event(seq)).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn handle_sink_event(&mut self, seq: u64, event: SinkEvent) {
        if self.current_stage(seq) != Some(Stage::Live) {
            return;
        }

        match event {
            SinkEvent::Playing => {
                self.status.send_modify(|s| {
                    s.playing = true;
                    s.buffering = false;
                });
            }
            SinkEvent::Waiting => {
                self.status.send_modify(|s| s.buffering = true);
            }
            SinkEvent::Error(message) => {
                self.fail_attempt(&SessionError::TransportFailure(format!("sink: {message}")));
            }
        }
    }

    /// A retryable failure: tear the attempt down and either schedule the
    /// next one or give up.
    fn fail_attempt(&mut self, error: &SessionError) {
        warn!(
            target: "sc.actor.viewer",
            attempt = self.retry_count,
            %error,
            "Attempt failed"
        );
        self.teardown_attempt();

        if self.policy.is_exhausted(self.retry_count) {
            let exhausted = SessionError::RetryExhausted(self.retry_count);
            info!(target: "sc.actor.viewer", attempts = self.retry_count, "Giving up");
            self.end_session(Some(exhausted.user_message()));
            return;
        }

        let delay = self.policy.delay_for(self.retry_count.saturating_sub(1));
        let attempt = self.retry_count;
        let seconds_left = delay.as_secs_f64().ceil() as u64;
        debug!(target: "sc.actor.viewer", ?delay, "Scheduling retry");
        self.status.send_modify(|s| {
            s.phase = ViewerPhase::Retrying {
                attempt,
                seconds_left,
            };
        });
        self.retry_timer.arm(delay, self.events_tx.clone());
    }

    /// Terminal stop: no timers left armed. `message` is the user-facing
    /// reason, absent for a deliberate local stop.
    fn end_session(&mut self, message: Option<String>) {
        self.retry_timer.disarm();
        self.teardown_attempt();
        self.status.send_modify(|s| {
            s.phase = ViewerPhase::Ended;
            s.playing = false;
            s.buffering = false;
            s.error = message.clone();
        });
    }

    /// Release every resource of the current attempt. Idempotent.
    fn teardown_attempt(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        attempt.scope.cancel();
        if let Some(ops) = attempt.call_ops {
            ops.close();
        }
        if let Some(ops) = attempt.channel_ops {
            ops.close();
        }
        attempt.peer_ops.destroy();
        if attempt.attached {
            self.sink.detach();
        }
        self.meter.reset();
    }
}

fn forward_peer_events(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    attempt: u64,
    tx: mpsc::UnboundedSender<ViewerEvent>,
    scope: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        if tx.send(ViewerEvent::Peer { attempt, event }).is_err() {
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
    attempt: u64,
    tx: mpsc::UnboundedSender<ViewerEvent>,
    scope: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        if tx.send(ViewerEvent::Channel { attempt, event }).is_err() {
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
    attempt: u64,
    tx: mpsc::UnboundedSender<ViewerEvent>,
    scope: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        if tx.send(ViewerEvent::Call { attempt, event }).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    });
}

fn forward_sink_events(
    mut events: mpsc::UnboundedReceiver<SinkEvent>,
    attempt: u64,
    tx: mpsc::UnboundedSender<ViewerEvent>,
    scope: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        if tx.send(ViewerEvent::Sink { attempt, event }).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::RelayEndpoint;
    use crate::media::MediaTrack;
    use crate::transport::{LinkState, MediaCall, PeerBinding, SignalChannel};

    use super::*;

    /// Transport that accepts every registration and counts them. Ops are
    /// inert; these tests drive the actor's handlers directly.
    #[derive(Clone, Default)]
    struct CountingTransport {
        registrations: Arc<AtomicUsize>,
    }

    impl Transport for CountingTransport {
        fn register(&self, identity: &PeerIdentity, _relays: &[RelayEndpoint]) -> PeerBinding {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            let (_events_tx, events) = mpsc::unbounded_channel();
            PeerBinding {
                identity: identity.clone(),
                ops: Arc::new(InertPeerOps),
                events,
            }
        }
    }

    struct InertPeerOps;

    impl PeerOps for InertPeerOps {
        fn open_channel(&self, remote: &PeerIdentity) -> SignalChannel {
            let (_events_tx, events) = mpsc::unbounded_channel();
            SignalChannel {
                remote: remote.clone(),
                ops: Arc::new(InertChannelOps),
                events,
            }
        }

        fn call(&self, remote: &PeerIdentity, _stream: MediaStream) -> MediaCall {
            let (_events_tx, events) = mpsc::unbounded_channel();
            MediaCall {
                remote: remote.clone(),
                ops: Arc::new(InertCallOps),
                events,
            }
        }

        fn reconnect(&self) {}

        fn destroy(&self) {}
    }

    struct InertChannelOps;

    impl ChannelOps for InertChannelOps {
        fn send(&self, _payload: serde_json::Value) {}

        fn close(&self) {}
    }

    struct InertCallOps;

    impl CallOps for InertCallOps {
        fn answer(&self, _stream: MediaStream) {}

        fn replace_track(&self, _track: MediaTrack) -> bool {
            false
        }

        fn link_state(&self) -> LinkState {
            LinkState::Closed
        }

        fn close(&self) {}
    }

    struct InertSink;

    impl crate::sink::SpectrumSource for InertSink {
        fn spectrum(&self) -> Option<Vec<u8>> {
            None
        }
    }

    impl MediaSink for InertSink {
        fn attach(&self, _stream: MediaStream) -> mpsc::UnboundedReceiver<SinkEvent> {
            let (_events_tx, events) = mpsc::unbounded_channel();
            events
        }

        fn detach(&self) {}

        fn play(&self) -> PlaybackStart {
            PlaybackStart::Started
        }

        fn buffer_ahead(&self) -> f64 {
            0.0
        }

        fn resolution(&self) -> Option<(u32, u32)> {
            None
        }
    }

    fn actor_under_test(
        transport: &CountingTransport,
    ) -> (ViewerActor, watch::Receiver<ViewerStatus>) {
        let config = SessionConfig::default();
        let policy = config.retry_policy();
        let (_commands_tx, commands) = mpsc::channel(VIEWER_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ViewerStatus::default());

        let actor = ViewerActor {
            broadcast_identity: derive_broadcast_identity("abc123"),
            stream_id: "abc123".to_string(),
            config,
            policy,
            transport: Arc::new(transport.clone()),
            sink: Arc::new(InertSink),
            commands,
            events_tx,
            events_rx,
            status: status_tx,
            cancel_token: CancellationToken::new(),
            seq: 0,
            retry_count: 0,
            attempt: None,
            retry_timer: RetryTimer::new(),
            meter: AudioLevelMeter::new(),
        };
        (actor, status_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_queued_behind_stop_does_not_reconnect() {
        let transport = CountingTransport::default();
        let (mut actor, status) = actor_under_test(&transport);

        actor.begin_attempt();
        actor.fail_attempt(&SessionError::Timeout(WaitStage::RegistrationOpen));
        assert!(actor.retry_timer.is_armed());
        let before = transport.registrations.load(Ordering::SeqCst);

        // The timer's fire can already sit in the event queue when a stop
        // command wins the same select pass.
        let (respond_to, _response) = oneshot::channel();
        actor.handle_command(ViewerCommand::Stop { respond_to });
        actor.handle_event(ViewerEvent::Retry(RetryTick::Fire));

        assert_eq!(status.borrow().phase, ViewerPhase::Ended);
        assert_eq!(transport.registrations.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_queued_behind_manual_retry_is_dropped() {
        let transport = CountingTransport::default();
        let (mut actor, status) = actor_under_test(&transport);

        actor.begin_attempt();
        actor.fail_attempt(&SessionError::Timeout(WaitStage::RegistrationOpen));

        // A manual retry disarms the timer and starts its own attempt; a
        // fire queued in the same pass must not start another.
        actor.handle_command(ViewerCommand::RetryNow);
        assert_eq!(transport.registrations.load(Ordering::SeqCst), 2);

        actor.handle_event(ViewerEvent::Retry(RetryTick::Fire));
        assert_eq!(transport.registrations.load(Ordering::SeqCst), 2);
        assert_eq!(status.borrow().retry_count, 1);
    }
}

//! Stream Controller Library
//!
//! This library provides the connection-establishment and resilience layer
//! for a one-broadcaster, many-viewers live streaming session:
//!
//! - Deterministic broadcaster addressing (stream id to peer identity)
//! - Registration-channel handshake with broadcaster-initiated callback
//! - Bounded exponential reconnection with a user-visible countdown
//! - Live playback telemetry (buffer quality, resolution, audio levels)
//! - Strict single-identity teardown between connection attempts
//!
//! # Architecture
//!
//! Each session controller is a tokio actor owning all of its state:
//!
//! ```text
//! BroadcastActor (one per broadcast)
//! ├── registers the derived identity with the transport
//! ├── calls each registering viewer back with the outgoing stream
//! └── tracks one ViewerConnection per active call
//!
//! ViewerActor (one per viewing session)
//! ├── registers a fresh ephemeral identity per attempt
//! ├── opens the registration channel and answers the callback
//! └── feeds failures into the backoff scheduler
//! ```
//!
//! # Key Design Decisions
//!
//! - **Broadcaster calls back**: viewers never place the media call; they
//!   register over a data channel and wait
//! - **Transport behind a seam**: controllers consume [`transport::Transport`]
//!   and never touch negotiation or traversal
//! - **Every wait is bounded**: registration, channel, callback and stream
//!   arrival all carry explicit timeouts
//! - **Attempt-scoped resources**: forwarder tasks and timers hang off one
//!   cancellation scope per attempt, so stale events are droppable by
//!   sequence number
//!
//! # Modules
//!
//! - [`actors`] - Broadcast and viewer session controllers
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error taxonomy with retry classification
//! - [`identity`] - Peer identity derivation and generation
//! - [`media`] - Local stream and track handles
//! - [`retry`] - Backoff policy and retry timer
//! - [`sink`] - Rendering surface seam
//! - [`telemetry`] - Quality buckets, playback stats, audio meter
//! - [`transport`] - Real-time transport seam

pub mod actors;
pub mod config;
pub mod errors;
pub mod identity;
pub mod media;
pub mod retry;
pub mod sink;
pub mod telemetry;
pub mod transport;

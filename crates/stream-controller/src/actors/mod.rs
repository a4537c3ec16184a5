//! Session controller actors.
//!
//! Each controller is one tokio task owning all of its state. Transport,
//! sink and timer events are re-injected into the task's event channel by
//! small forwarder tasks, tagged with the attempt they belong to, so every
//! transition runs on the actor's single loop and stale events from a torn
//! down attempt are dropped on arrival.

pub mod broadcast;
pub mod messages;
pub mod viewer;

pub use broadcast::{BroadcastActor, BroadcastActorHandle};
pub use messages::{
    BroadcastCommand, BroadcastPhase, BroadcastStatus, CallState, SourceMode, StreamSession,
    ViewerCommand, ViewerConnection, ViewerPhase, ViewerStatus,
};
pub use viewer::{ViewerActor, ViewerActorHandle};

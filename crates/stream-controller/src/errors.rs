//! Session controller error types.
//!
//! Every transport-level failure is caught at the controller boundary and
//! mapped onto one `SessionError` kind; none escape uncaught. The kind
//! decides the recovery path: retryable errors feed the reconnection
//! scheduler, terminal errors end the session and leave a user-visible
//! message behind.

use thiserror::Error;

/// A bounded external wait that a controller can be stuck in.
///
/// Expiry of any of these is handled exactly like an explicit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    /// Waiting for our own transport identity to report open.
    RegistrationOpen,
    /// Waiting for the registration channel to the broadcaster to open.
    ChannelOpen,
    /// Waiting for the broadcaster to call us back.
    InboundCall,
    /// Waiting for the remote stream to arrive on an answered call.
    RemoteStream,
}

impl std::fmt::Display for WaitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WaitStage::RegistrationOpen => "registration open",
            WaitStage::ChannelOpen => "registration channel open",
            WaitStage::InboundCall => "inbound call",
            WaitStage::RemoteStream => "remote stream",
        };
        f.write_str(name)
    }
}

/// Session controller error type.
///
/// Recovery mapping:
/// - `IdentityConflict`: regenerate the identity and retry (broadcaster:
///   once; viewer: immediately, without consuming retry budget)
/// - `PeerUnreachable`, `Timeout`, `EmptyMedia`, `TransportFailure`:
///   scheduled retry, not fatal until the attempt cap
/// - `StreamEnded`, `RetryExhausted`: terminal; explicit reconnect required
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested peer identity is already registered elsewhere.
    #[error("identity already registered: {0}")]
    IdentityConflict(String),

    /// The target identity is not registered with the transport.
    #[error("peer not registered: {0}")]
    PeerUnreachable(String),

    /// A bounded external wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(WaitStage),

    /// An inbound stream carried zero tracks.
    #[error("inbound stream carries no tracks")]
    EmptyMedia,

    /// The transport link failed after being established.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The broadcast ended deliberately.
    #[error("broadcast ended")]
    StreamEnded,

    /// The retry budget is spent.
    #[error("gave up after {0} attempts")]
    RetryExhausted(u32),

    /// Internal error (channel plumbing, invalid controller state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Whether this error feeds the reconnection scheduler.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::IdentityConflict(_)
            | SessionError::PeerUnreachable(_)
            | SessionError::Timeout(_)
            | SessionError::EmptyMedia
            | SessionError::TransportFailure(_) => true,
            SessionError::StreamEnded
            | SessionError::RetryExhausted(_)
            | SessionError::Internal(_) => false,
        }
    }

    /// A user-facing message with no transport internals.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            SessionError::IdentityConflict(_) => "Connection error: address in use".to_string(),
            SessionError::PeerUnreachable(_) | SessionError::Timeout(_) => {
                "Stream not available yet".to_string()
            }
            SessionError::EmptyMedia => "No media received".to_string(),
            SessionError::TransportFailure(_) => "Connection lost".to_string(),
            SessionError::StreamEnded => "Broadcast has ended".to_string(),
            SessionError::RetryExhausted(_) => {
                "Stream not found or connection failed after multiple attempts.".to_string()
            }
            SessionError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SessionError::IdentityConflict("ss-x".to_string()).is_retryable());
        assert!(SessionError::PeerUnreachable("ss-x".to_string()).is_retryable());
        assert!(SessionError::Timeout(WaitStage::InboundCall).is_retryable());
        assert!(SessionError::EmptyMedia.is_retryable());
        assert!(SessionError::TransportFailure("ice failed".to_string()).is_retryable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!SessionError::StreamEnded.is_retryable());
        assert!(!SessionError::RetryExhausted(8).is_retryable());
        assert!(!SessionError::Internal("mailbox closed".to_string()).is_retryable());
    }

    #[test]
    fn test_user_messages_hide_internals() {
        let err = SessionError::TransportFailure("dtls handshake at 192.168.1.4".to_string());
        assert!(!err.user_message().contains("192.168"));

        let err = SessionError::Internal("watch receiver dropped".to_string());
        assert_eq!(err.user_message(), "An internal error occurred");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SessionError::Timeout(WaitStage::RemoteStream)),
            "timed out waiting for remote stream"
        );
        assert_eq!(
            format!("{}", SessionError::RetryExhausted(8)),
            "gave up after 8 attempts"
        );
    }
}

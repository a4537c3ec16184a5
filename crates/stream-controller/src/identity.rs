//! Peer identity derivation and generation.
//!
//! The broadcaster's identity is deterministic: a fixed prefix plus the
//! stream id, so any holder of the stream id can address the broadcaster
//! without a discovery step. Viewer identities are ephemeral and random per
//! connection attempt.
//!
//! Collision probability for generated identifiers is near zero but not
//! zero; callers must handle an "already registered" rejection from the
//! transport.

use uuid::Uuid;

/// Fixed prefix for broadcaster identities within the signaling namespace.
pub const BROADCAST_PREFIX: &str = "ss-";

/// Opaque address used by the transport collaborator to route a direct
/// connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap a raw identity string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generate a fresh ephemeral viewer identity: a time-based base-36
    /// prefix plus a random suffix.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self(format!("v-{}-{}", base36(now_millis()), random_suffix(5)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity({})", self.0)
    }
}

/// Derive the broadcaster identity for a stream id.
///
/// Pure and deterministic: the same stream id always yields the same
/// identity, and distinct stream ids yield distinct identities.
#[must_use]
pub fn derive_broadcast_identity(stream_id: &str) -> PeerIdentity {
    PeerIdentity(format!("{BROADCAST_PREFIX}{stream_id}"))
}

/// Generate a new shareable stream id.
#[must_use]
pub fn generate_stream_id() -> String {
    format!("{}-{}", base36(now_millis()), random_suffix(6))
}

/// Build the viewer-facing address for a stream id.
///
/// The stream id is the sole shareable token; there is no further
/// authentication.
#[must_use]
pub fn share_url(origin: &str, path: &str, stream_id: &str) -> String {
    format!("{origin}{path}#/viewer/{stream_id}")
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        let digit = (value % 36) as usize;
        out.push(DIGITS.get(digit).copied().unwrap_or(b'0'));
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn random_suffix(len: usize) -> String {
    Uuid::new_v4().simple().to_string().chars().take(len).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_broadcast_identity("abc123");
        let b = derive_broadcast_identity("abc123");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "ss-abc123");
    }

    #[test]
    fn test_derive_distinct_stream_ids() {
        let a = derive_broadcast_identity("abc123");
        let b = derive_broadcast_identity("abc124");
        assert_ne!(a, b);
    }

    #[test]
    fn test_ephemeral_identities_are_unique() {
        let a = PeerIdentity::ephemeral();
        let b = PeerIdentity::ephemeral();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("v-"));
    }

    #[test]
    fn test_generated_stream_ids_are_unique() {
        let a = generate_stream_id();
        let b = generate_stream_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }

    #[test]
    fn test_share_url_format() {
        let url = share_url("https://example.test", "/app", "abc123");
        assert_eq!(url, "https://example.test/app#/viewer/abc123");
    }

    #[test]
    fn test_base36_round_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }
}

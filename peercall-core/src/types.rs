//! Core identifiers and call lifecycle types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-unique identity of one call session.
///
/// Generated when a manager is created and rotated on teardown, so signaling
/// messages that arrive after a call has ended correlate with nothing and are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application-level identifier of the other participant.
///
/// This is how signaling messages are addressed. It is not a transport
/// address; the transport address is learned through the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId(pub String);

impl PartyId {
    /// Create a new party identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a party identifier from its string representation
    pub fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        if s.trim().is_empty() {
            anyhow::bail!("party identifier must not be empty");
        }
        Ok(Self(s.trim().to_string()))
    }
}

impl std::fmt::Display for PartyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport-level address of a peer endpoint.
///
/// Produced by the peer transport when it opens; opaque to everything above
/// the transport layer. Distinct from [`PartyId`], which addresses signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl EndpointId {
    /// Create a new endpoint identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call being placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// Audio-only call
    Audio,
    /// Audio and video call
    Video,
}

impl CallType {
    /// Check whether this call type wants a camera
    pub fn has_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

/// Which side of the handshake this manager plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Requests the remote transport address and dials
    Initiator,
    /// Waits to be asked for its transport address and answers
    Responder,
}

/// Lifecycle phase of one call attempt.
///
/// Transitions are validated by the manager's single transition function;
/// there are no ad hoc in-progress flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call in progress
    Idle,
    /// Walking the media quality ladder
    AcquiringMedia,
    /// Bringing up the peer transport, possibly retrying
    OpeningTransport,
    /// Transport open, exchanging the peer-id handshake
    AwaitingHandshake,
    /// Live media link established
    Linked,
    /// Teardown in progress
    Closing,
    /// Terminal; the manager must not be reused
    Closed,
}

impl CallPhase {
    /// Check whether this phase is terminal or tearing down
    pub fn is_closing(self) -> bool {
        matches!(self, CallPhase::Closing | CallPhase::Closed)
    }
}

/// Closed classification of every failure the call core can see.
///
/// Produced at the adapter/driver boundary so upper layers never match on
/// library-specific error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Network/server/socket-layer trouble; eligible for bounded retry
    Transient,
    /// Permission denial, retry exhaustion, cancellation; never retried
    Fatal,
    /// Malformed or unaddressed signaling; logged and ignored
    Protocol,
}

impl FailureKind {
    /// Check whether this failure may be retried
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_serializes_as_string() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with('"') && json.ends_with('"'));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_party_id_from_string_repr() {
        let id = PartyId::from_string_repr("  alice ").unwrap();
        assert_eq!(id.as_str(), "alice");
        assert!(PartyId::from_string_repr("   ").is_err());
    }

    #[test]
    fn test_call_type_video() {
        assert!(CallType::Video.has_video());
        assert!(!CallType::Audio.has_video());
    }

    #[test]
    fn test_failure_kind_classification() {
        assert!(FailureKind::Transient.is_transient());
        assert!(!FailureKind::Fatal.is_transient());
        assert!(!FailureKind::Protocol.is_transient());
    }

    #[test]
    fn test_phase_closing() {
        assert!(CallPhase::Closing.is_closing());
        assert!(CallPhase::Closed.is_closing());
        assert!(!CallPhase::Linked.is_closing());
    }
}

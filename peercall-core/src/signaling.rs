//! Signaling wire protocol and transport adapter seam
//!
//! The relay is only used to exchange small coordination messages while two
//! parties establish a direct media path. The adapter is pure transport: it
//! carries [`SignalingMessage`]s to a named party and hands inbound ones to
//! the manager in the order the channel delivered them. Best-effort,
//! at-most-once, possibly reordered delivery is assumed; correctness comes
//! from session-identity correlation, not from the relay.

use crate::types::{EndpointId, PartyId, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The underlying channel is not currently able to deliver.
    ///
    /// Callers log this and carry on; an unavailable relay must never crash
    /// the call core.
    #[error("signaling channel unavailable: {0}")]
    Unavailable(String),

    /// A message could not be decoded from the wire
    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Messages exchanged over the signaling relay.
///
/// Wire shape is flat JSON tagged by `type`, e.g.
/// `{"type":"peer-id","sessionId":"…","peerId":"…"}`. Unknown types fail
/// decoding; the caller logs and drops them (forward compatibility, not an
/// error).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Reply carrying the sender's transport address
    #[serde(rename_all = "camelCase")]
    PeerId {
        /// Session this reply correlates with (echoed from the request)
        session_id: SessionId,
        /// The replying side's transport address
        peer_id: EndpointId,
    },

    /// Ask the remote party for its transport address
    #[serde(rename_all = "camelCase")]
    RequestPeerId {
        /// The requesting side's session identity, echoed in the reply
        session_id: SessionId,
    },

    /// The remote party ended or abandoned the call
    #[serde(rename_all = "camelCase")]
    CallCancelled {
        /// Sender's session identity
        session_id: SessionId,
    },

    /// Echo-based liveness probe
    #[serde(rename_all = "camelCase")]
    ConnectionTest {
        /// Sender's session identity
        session_id: SessionId,
        /// Sender's clock at send time, UTC milliseconds
        timestamp: i64,
    },

    /// Probe echo; the original timestamp is returned untouched
    #[serde(rename_all = "camelCase")]
    ConnectionTestResponse {
        /// Session identity echoed from the probe
        session_id: SessionId,
        /// The probe's original timestamp
        timestamp: i64,
    },

    /// Remote-reported error, informational only
    #[serde(rename_all = "camelCase")]
    Error {
        /// Sender's session identity
        session_id: SessionId,
        /// Human-readable description
        reason: String,
    },
}

impl SignalingMessage {
    /// The session identity embedded in the message
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::PeerId { session_id, .. }
            | Self::RequestPeerId { session_id }
            | Self::CallCancelled { session_id }
            | Self::ConnectionTest { session_id, .. }
            | Self::ConnectionTestResponse { session_id, .. }
            | Self::Error { session_id, .. } => *session_id,
        }
    }

    /// Message kind for tracing
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeerId { .. } => "peer-id",
            Self::RequestPeerId { .. } => "request-peer-id",
            Self::CallCancelled { .. } => "call-cancelled",
            Self::ConnectionTest { .. } => "connection-test",
            Self::ConnectionTestResponse { .. } => "connection-test-response",
            Self::Error { .. } => "error",
        }
    }

    /// Encode to the JSON wire form
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Malformed`] for unparsable input or an
    /// unknown `type`; callers log and drop such messages.
    pub fn decode(raw: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Transport seam between the call manager and whatever relay the host uses.
///
/// Implementations perform no interpretation of message semantics and no
/// reordering of their own. A send while the channel is down returns
/// [`SignalingError::Unavailable`]; it must not panic or block forever.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send a message to the named party
    async fn send(&self, to: &PartyId, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Receive the next inbound message, with its sender.
    ///
    /// Returns `None` when the channel is permanently closed.
    async fn recv(&self) -> Option<(PartyId, SignalingMessage)>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_shape() {
        let session_id = SessionId::new();
        let msg = SignalingMessage::PeerId {
            session_id,
            peer_id: EndpointId::new("ep-7"),
        };
        let json = msg.encode().unwrap();
        assert!(json.contains("\"type\":\"peer-id\""));
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"peerId\":\"ep-7\""));

        let back = SignalingMessage::decode(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_request_tag() {
        let msg = SignalingMessage::RequestPeerId {
            session_id: SessionId::new(),
        };
        let json = msg.encode().unwrap();
        assert!(json.contains("\"type\":\"request-peer-id\""));
    }

    #[test]
    fn test_probe_round_trip_keeps_timestamp() {
        let session_id = SessionId::new();
        let probe = SignalingMessage::ConnectionTest {
            session_id,
            timestamp: 1_722_000_000_123,
        };
        let json = probe.encode().unwrap();
        let decoded = SignalingMessage::decode(&json).unwrap();
        match decoded {
            SignalingMessage::ConnectionTest { timestamp, .. } => {
                assert_eq!(timestamp, 1_722_000_000_123);
            }
            other => unreachable!("expected connection-test, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"renegotiate","sessionId":"2d9f9a4e-8b1e-4c12-9f6a-30a5f2f9f111"}"#;
        assert!(SignalingMessage::decode(raw).is_err());
    }

    #[test]
    fn test_session_id_accessor_covers_all_variants() {
        let session_id = SessionId::new();
        let msgs = vec![
            SignalingMessage::PeerId {
                session_id,
                peer_id: EndpointId::new("x"),
            },
            SignalingMessage::RequestPeerId { session_id },
            SignalingMessage::CallCancelled { session_id },
            SignalingMessage::ConnectionTest {
                session_id,
                timestamp: 0,
            },
            SignalingMessage::ConnectionTestResponse {
                session_id,
                timestamp: 0,
            },
            SignalingMessage::Error {
                session_id,
                reason: "boom".to_string(),
            },
        ];
        for msg in msgs {
            assert_eq!(msg.session_id(), session_id);
        }
    }
}

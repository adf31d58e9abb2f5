//! Peercall - peer-to-peer call connection management
//!
//! This library negotiates, establishes, monitors, and tears down real-time
//! audio/video sessions between two parties using a signaling relay and a
//! direct peer transport. It owns the hard part of calling:
//!
//! - **Lifecycle state machine**: explicit named phases with a single
//!   validated transition function
//! - **Bounded retry**: transport bring-up retries transient failures with
//!   linear backoff, destroying and recreating the session each attempt
//! - **Media fallback ladder**: high, medium, minimum constraints, with an
//!   audio-only fallback for video calls
//! - **Deterministic teardown**: every resource released exactly once,
//!   from any failure path, with the session identity rotated so stale
//!   signaling is inert
//!
//! The surrounding application supplies three collaborators: a
//! [`SignalingTransport`] to reach the other party, a [`SessionFactory`]
//! producing transport drivers (the platform's WebRTC equivalent), and a
//! [`MediaSource`] for local capture. In-process implementations of all
//! three live in [`memory`] and [`media::SyntheticSource`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let hub = MemoryHub::new();
//!
//! let manager = CallManager::new(
//!     Arc::new(relay.attach(PartyId::new("alice"))),
//!     Arc::new(hub.clone()),
//!     Arc::new(SyntheticSource::new()),
//!     CallConfig::default(),
//! );
//!
//! let mut events = manager.events();
//! let _local = manager
//!     .start_call(PartyId::new("bob"), CallType::Video, Role::Initiator)
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         CallEvent::RemoteStream { .. } => println!("call is live"),
//!         CallEvent::Ended => break,
//!         _ => {}
//!     }
//! }
//! manager.end_call().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers and lifecycle types
pub mod types;

/// Local media acquisition and the quality fallback ladder
pub mod media;

/// Signaling wire protocol and transport adapter seam
pub mod signaling;

/// Peer transport session and live media link
pub mod session;

/// Call connection management
pub mod call;

/// In-process signaling relay and link transport
pub mod memory;

// Re-export main types at crate root
pub use call::{CallConfig, CallError, CallEvent, CallManager, SessionFactory};
pub use media::{
    AcquiredMedia, CaptureError, MediaConstraints, MediaError, MediaLadder, MediaSource,
    MediaStream, MediaTrack, QualityTier, SyntheticSource, TrackKind,
};
pub use memory::{MemoryHub, MemoryLinkDriver, MemoryRelay, MemoryRelayEndpoint};
pub use session::{
    DriverError, IncomingLink, LinkDriver, LinkEvent, MediaLink, PeerSession, SessionError,
    SessionState, TransportConfig,
};
pub use signaling::{SignalingError, SignalingMessage, SignalingTransport};
pub use types::{CallPhase, CallType, EndpointId, FailureKind, PartyId, Role, SessionId};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallConfig, CallError, CallEvent, CallManager, SessionFactory};
    pub use crate::media::{MediaSource, MediaStream, SyntheticSource};
    pub use crate::memory::{MemoryHub, MemoryRelay};
    pub use crate::session::{LinkDriver, TransportConfig};
    pub use crate::signaling::{SignalingMessage, SignalingTransport};
    pub use crate::types::{CallPhase, CallType, FailureKind, PartyId, Role, SessionId};
}

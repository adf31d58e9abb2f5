//! Peer transport session and live media link
//!
//! A [`PeerSession`] owns exactly one underlying point-to-point connection
//! attempt. It never retries itself: open failures are classified and
//! reported upward, and the call manager decides whether to destroy this
//! session and create a fresh one. A session is never reopened in place.
//!
//! The actual transport (the platform's WebRTC equivalent) is injected
//! behind the [`LinkDriver`] trait; this module only enforces the session
//! state machine, the open timeout, and idempotent close.

use crate::media::MediaStream;
use crate::types::{EndpointId, FailureKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Transport error with its classification attached.
///
/// Drivers classify at the boundary, so nothing above them ever matches on
/// library-specific error strings.
#[derive(Error, Debug, Clone)]
#[error("{reason}")]
pub struct DriverError {
    /// Closed failure classification
    pub kind: FailureKind,
    /// Human-readable description
    pub reason: String,
}

impl DriverError {
    /// A retryable network/server-layer failure
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            reason: reason.into(),
        }
    }

    /// A failure that must not be retried
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            reason: reason.into(),
        }
    }
}

/// Peer transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Ceiling on one open attempt; expiry is treated as a transient failure
    pub open_timeout: Duration,
    /// Relay/reflexive servers handed to the driver, driver-interpreted
    pub ice_servers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            ice_servers: Vec::new(),
        }
    }
}

/// Events published by a live [`MediaLink`]
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The remote party's stream arrived
    RemoteStream(MediaStream),
    /// The link reported an unrecoverable error
    Failed(String),
    /// The link closed
    Closed,
}

struct LinkShared {
    id: Uuid,
    events: broadcast::Sender<LinkEvent>,
    closed: AtomicBool,
    remote_stream: Mutex<Option<MediaStream>>,
    peer: Mutex<Option<Weak<LinkShared>>>,
}

/// The live media path between two transport sessions.
///
/// Owned by the session that produced it. Closing is idempotent and also
/// closes the paired remote half. A link closing does not imply its owning
/// manager is gone; the manager observes [`LinkEvent::Closed`] and runs its
/// own teardown.
#[derive(Clone)]
pub struct MediaLink {
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for MediaLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaLink")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MediaLink {
    /// Create an unpaired link half
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(LinkShared {
                id: Uuid::new_v4(),
                events,
                closed: AtomicBool::new(false),
                remote_stream: Mutex::new(None),
                peer: Mutex::new(None),
            }),
        }
    }

    /// Link identifier
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Cross-connect two halves so closing one closes the other
    pub fn pair(a: &MediaLink, b: &MediaLink) {
        *a.shared.peer.lock() = Some(Arc::downgrade(&b.shared));
        *b.shared.peer.lock() = Some(Arc::downgrade(&a.shared));
    }

    /// Subscribe to link events.
    ///
    /// Events published before subscribing are not replayed; check
    /// [`MediaLink::remote_stream`] and [`MediaLink::is_closed`] after
    /// subscribing to pick up state that already landed.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// The remote stream, if it has already been delivered
    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.shared.remote_stream.lock().clone()
    }

    /// Driver-facing: deliver the remote party's stream to this half
    pub fn deliver_remote_stream(&self, stream: MediaStream) {
        *self.shared.remote_stream.lock() = Some(stream.clone());
        let _ = self.shared.events.send(LinkEvent::RemoteStream(stream));
    }

    /// Driver-facing: report a link failure and close both halves
    pub fn fail(&self, reason: &str) {
        if !self.shared.closed.load(Ordering::SeqCst) {
            let _ = self
                .shared
                .events
                .send(LinkEvent::Failed(reason.to_string()));
        }
        self.close();
    }

    /// Close the link. Returns `true` if this call performed the close.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shared.events.send(LinkEvent::Closed);
        let peer = self.shared.peer.lock().take();
        if let Some(peer) = peer.and_then(|w| w.upgrade()) {
            MediaLink { shared: peer }.close();
        }
        true
    }

    /// Check whether the link has closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Default for MediaLink {
    fn default() -> Self {
        Self::new()
    }
}

/// An inbound connection attempt delivered to the answering side
#[derive(Debug)]
pub struct IncomingLink {
    /// Transport address of the dialing endpoint
    pub remote_endpoint: EndpointId,
    /// The dialer's stream, attached when it dialed
    pub remote_stream: MediaStream,
    /// The dialer's link half, to be paired by `answer`
    pub link: MediaLink,
}

/// Driver seam for the platform point-to-point transport.
///
/// Implementations classify their own errors into [`DriverError`] and keep
/// `close` idempotent. Incoming connection attempts flow through the channel
/// handed out by `take_incoming`; dropping that receiver ends delivery, which
/// is how listener deregistration works here — no manual listener removal.
#[async_trait]
pub trait LinkDriver: Send + Sync + 'static {
    /// Establish the local transport and return its address
    async fn open(&self, config: &TransportConfig) -> Result<EndpointId, DriverError>;

    /// Actively connect to a remote endpoint, attaching the local stream
    async fn dial(
        &self,
        remote: &EndpointId,
        local: &MediaStream,
    ) -> Result<MediaLink, DriverError>;

    /// Accept an inbound connection attempt, attaching the local stream
    async fn answer(
        &self,
        incoming: IncomingLink,
        local: &MediaStream,
    ) -> Result<MediaLink, DriverError>;

    /// Take the inbound-connection channel. Yields once; later calls return
    /// `None`.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingLink>>;

    /// Release all transport resources. Idempotent.
    async fn close(&self);
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, transport not yet started
    Unopened,
    /// Open attempt in flight
    Opening,
    /// Transport established, address known
    Open,
    /// A link has been dialed or answered
    Linked,
    /// Terminal; the session is never reused
    Closed,
}

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation not valid in the session's current state
    #[error("operation invalid in session state {0:?}")]
    InvalidState(SessionState),

    /// Error reported by the transport driver
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl SessionError {
    /// Classification of this error
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::InvalidState(_) => FailureKind::Fatal,
            SessionError::Driver(e) => e.kind,
        }
    }
}

/// One point-to-point transport attempt.
///
/// State machine: `Unopened → Opening → Open → {Linked, Closed}`, with
/// `Opening → Closed` on error. Re-opening happens only by destroying the
/// session and creating a new one.
pub struct PeerSession {
    driver: Arc<dyn LinkDriver>,
    state: Mutex<SessionState>,
    local_endpoint: Mutex<Option<EndpointId>>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Wrap a fresh driver instance in an unopened session
    pub fn new(driver: Arc<dyn LinkDriver>) -> Self {
        Self {
            driver,
            state: Mutex::new(SessionState::Unopened),
            local_endpoint: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The local transport address, once open
    pub fn local_endpoint(&self) -> Option<EndpointId> {
        self.local_endpoint.lock().clone()
    }

    /// Take the inbound-connection channel from the driver
    pub fn incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingLink>> {
        self.driver.take_incoming()
    }

    /// Establish the transport, bounded by the configured open timeout.
    ///
    /// A timeout classifies as transient. Any failure moves the session to
    /// `Closed` and releases the driver; the caller decides whether to retry
    /// with a new session.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not `Unopened` or the driver fails.
    pub async fn open(&self, config: &TransportConfig) -> Result<EndpointId, SessionError> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Unopened {
                return Err(SessionError::InvalidState(*state));
            }
            *state = SessionState::Opening;
        }

        let result = tokio::time::timeout(config.open_timeout, self.driver.open(config)).await;
        let outcome = match result {
            Ok(Ok(endpoint)) => Ok(endpoint),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DriverError::transient(format!(
                "transport open timed out after {:?}",
                config.open_timeout
            ))),
        };

        match outcome {
            Ok(endpoint) => {
                {
                    let mut state = self.state.lock();
                    if *state != SessionState::Opening {
                        // Closed while the open was in flight.
                        return Err(SessionError::InvalidState(*state));
                    }
                    *state = SessionState::Open;
                }
                *self.local_endpoint.lock() = Some(endpoint.clone());
                tracing::debug!(endpoint = %endpoint, "peer transport open");
                Ok(endpoint)
            }
            Err(err) => {
                tracing::debug!(kind = ?err.kind, error = %err, "peer transport open failed");
                self.close().await;
                Err(err.into())
            }
        }
    }

    /// Dial a remote endpoint with the local stream attached.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not `Open` or the driver fails.
    pub async fn dial(
        &self,
        remote: &EndpointId,
        local: &MediaStream,
    ) -> Result<MediaLink, SessionError> {
        {
            let state = self.state.lock();
            if *state != SessionState::Open {
                return Err(SessionError::InvalidState(*state));
            }
        }
        let link = self.driver.dial(remote, local).await?;
        *self.state.lock() = SessionState::Linked;
        tracing::debug!(remote = %remote, link = %link.id(), "dialed remote endpoint");
        Ok(link)
    }

    /// Answer an inbound connection attempt with the local stream attached.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not `Open` or the driver fails.
    pub async fn answer(
        &self,
        incoming: IncomingLink,
        local: &MediaStream,
    ) -> Result<MediaLink, SessionError> {
        {
            let state = self.state.lock();
            if *state != SessionState::Open {
                return Err(SessionError::InvalidState(*state));
            }
        }
        let remote = incoming.remote_endpoint.clone();
        let link = self.driver.answer(incoming, local).await?;
        *self.state.lock() = SessionState::Linked;
        tracing::debug!(remote = %remote, link = %link.id(), "answered inbound link");
        Ok(link)
    }

    /// Close the session and release the driver. Idempotent and safe to call
    /// from any state.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SessionState::Closed;
        self.driver.close().await;
        tracing::debug!("peer session closed");
    }
}

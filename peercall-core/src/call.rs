//! Call connection management
//!
//! [`CallManager`] owns the whole lifecycle of one call attempt: it acquires
//! local media, brings up a peer transport session with bounded linear
//! backoff, runs the transport-address handshake over the signaling relay,
//! and tears everything down exactly once no matter which stage failed.
//!
//! The lifecycle is an explicit state machine over [`CallPhase`]:
//!
//! ```text
//!     Idle
//!       │
//!       ▼
//!  AcquiringMedia ───────────────┐
//!       │                        │
//!       ▼                        │
//!  OpeningTransport ─(retry)─┐   │
//!       │                    │   │
//!       ▼                    │   │
//!  AwaitingHandshake         │   │
//!       │                    │   │
//!       ▼                    ▼   ▼
//!     Linked ─────────────► Closing ──► Closed
//! ```
//!
//! Every mutation funnels through one async mutex, so two signaling
//! dispatches, a timer firing, and an explicit hang-up can never race each
//! other. All state transitions go through a single validated transition
//! function; illegal moves are rejected rather than guarded by flags.

use crate::media::{self, MediaError, MediaLadder, MediaSource, MediaStream};
use crate::session::{IncomingLink, LinkDriver, LinkEvent, MediaLink, PeerSession, TransportConfig};
use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::types::{CallPhase, CallType, EndpointId, FailureKind, PartyId, Role, SessionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Media acquisition exhausted the quality ladder
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Transport bring-up failed on every allowed attempt
    #[error("transport bring-up failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        /// How many attempts were made
        attempts: u32,
        /// The last transient failure observed
        reason: String,
    },

    /// Transport bring-up hit a failure that must not be retried
    #[error("transport failed: {reason}")]
    Transport {
        /// Driver-reported description
        reason: String,
    },

    /// The manager already ran a call; it is single-use
    #[error("call manager is not idle")]
    NotIdle,

    /// The call was torn down while setup was still in flight
    #[error("call torn down during setup")]
    Cancelled,

    /// An internal lifecycle transition was rejected
    #[error("invalid call phase transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Phase the call was in
        from: CallPhase,
        /// Phase that was requested
        to: CallPhase,
    },
}

impl CallError {
    /// Classification of this error
    pub fn kind(&self) -> FailureKind {
        FailureKind::Fatal
    }
}

/// Application-facing call events.
///
/// The surrounding application only needs to consume `RemoteStream` and
/// `Error`; everything else is informational.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The remote party's media arrived; the call is live
    RemoteStream {
        /// Read-only handle to the remote stream
        stream: MediaStream,
    },
    /// A failure was surfaced. `Fatal` kinds end the call; others are
    /// warnings the call survives (e.g. degraded capture, failed probe).
    Error {
        /// Classification of the failure
        kind: FailureKind,
        /// Human-readable description
        reason: String,
    },
    /// A connectivity probe completed its round trip
    ProbeRtt {
        /// Measured round-trip time
        rtt: Duration,
    },
    /// The call ended, by either side or by failure
    Ended,
}

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Maximum transport bring-up attempts; the counter never exceeds this
    pub max_open_attempts: u32,
    /// Base backoff unit; the delay before attempt `n + 1` is `base × n`
    pub backoff_base: Duration,
    /// How long to wait for the remote transport address before failing
    pub handshake_timeout: Duration,
    /// Peer transport configuration, including the per-attempt open timeout
    pub transport: TransportConfig,
    /// Media constraint ladder
    pub ladder: MediaLadder,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_open_attempts: 3,
            backoff_base: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(20),
            transport: TransportConfig::default(),
            ladder: MediaLadder::default(),
        }
    }
}

/// Produces a fresh transport driver for each session attempt.
///
/// Retried bring-up never reuses a half-opened driver; each attempt gets a
/// new one from this factory and the failed one is destroyed.
pub trait SessionFactory: Send + Sync {
    /// Create a fresh, unopened driver
    fn create(&self) -> Arc<dyn LinkDriver>;
}

/// Mutable call state; every access goes through the manager's mutex.
struct CallCore {
    phase: CallPhase,
    session_id: SessionId,
    remote_party: Option<PartyId>,
    role: Option<Role>,
    local_stream: Option<MediaStream>,
    session: Option<Arc<PeerSession>>,
    local_endpoint: Option<EndpointId>,
    link: Option<MediaLink>,
    attempts: u32,
    pending_request: Option<(PartyId, SessionId)>,
    handshake_timer: Option<JoinHandle<()>>,
    watchers: Vec<JoinHandle<()>>,
}

impl CallCore {
    fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            session_id: SessionId::new(),
            remote_party: None,
            role: None,
            local_stream: None,
            session: None,
            local_endpoint: None,
            link: None,
            attempts: 0,
            pending_request: None,
            handshake_timer: None,
            watchers: Vec::new(),
        }
    }

    /// The single transition function. Rejects anything outside the
    /// lifecycle diagram.
    fn transition(&mut self, to: CallPhase) -> Result<(), CallError> {
        let from = self.phase;
        if !CallManager::is_valid_transition(from, to) {
            tracing::warn!(from = ?from, to = ?to, "rejected call phase transition");
            return Err(CallError::InvalidTransition { from, to });
        }
        self.phase = to;
        tracing::debug!(from = ?from, to = ?to, "call phase transition");
        Ok(())
    }
}

/// The peer-to-peer call connection manager.
///
/// One instance runs at most one call and is not reused afterwards; the
/// session identity rotated at teardown makes any late messages for the old
/// call inert. Construct with [`CallManager::new`], drive with
/// [`CallManager::start_call`], consume [`CallManager::events`], and end
/// with [`CallManager::end_call`].
pub struct CallManager {
    signaling: Arc<dyn SignalingTransport>,
    sessions: Arc<dyn SessionFactory>,
    media: Arc<dyn MediaSource>,
    config: CallConfig,
    events: broadcast::Sender<CallEvent>,
    shutdown: watch::Sender<bool>,
    core: Mutex<CallCore>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    weak: Weak<CallManager>,
}

impl CallManager {
    /// Create a manager wired to its collaborators.
    ///
    /// The signaling adapter is injected, never reached for ambiently. A
    /// background pump dispatches inbound messages into
    /// [`CallManager::handle_signal`] in delivery order.
    pub fn new(
        signaling: Arc<dyn SignalingTransport>,
        sessions: Arc<dyn SessionFactory>,
        media: Arc<dyn MediaSource>,
        config: CallConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(100);
        let (shutdown, _) = watch::channel(false);

        let manager = Arc::new_cyclic(|weak: &Weak<CallManager>| Self {
            signaling,
            sessions,
            media,
            config,
            events,
            shutdown,
            core: Mutex::new(CallCore::new()),
            pump: parking_lot::Mutex::new(None),
            weak: weak.clone(),
        });

        let weak = manager.weak.clone();
        let transport = manager.signaling.clone();
        let pump = tokio::spawn(async move {
            while let Some((from, message)) = transport.recv().await {
                let Some(manager) = weak.upgrade() else { return };
                manager.handle_signal(from, message).await;
            }
            tracing::debug!("signaling channel closed; dispatch pump exiting");
        });
        *manager.pump.lock() = Some(pump);

        manager
    }

    /// Subscribe to application-facing call events
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle phase
    pub async fn phase(&self) -> CallPhase {
        self.core.lock().await.phase
    }

    /// Current session identity; rotated when the call ends
    pub async fn session_id(&self) -> SessionId {
        self.core.lock().await.session_id
    }

    /// Check whether a phase transition is allowed by the lifecycle
    pub fn is_valid_transition(from: CallPhase, to: CallPhase) -> bool {
        matches!(
            (from, to),
            (CallPhase::Idle, CallPhase::AcquiringMedia)
                | (CallPhase::AcquiringMedia, CallPhase::OpeningTransport)
                | (CallPhase::OpeningTransport, CallPhase::AwaitingHandshake)
                | (CallPhase::AwaitingHandshake, CallPhase::Linked)
                | (CallPhase::Closing, CallPhase::Closed)
        ) || (to == CallPhase::Closing && !from.is_closing())
    }

    /// Start a call towards `remote`.
    ///
    /// Acquires local media down the quality ladder, brings up the peer
    /// transport (retrying transient failures with linear backoff), and
    /// starts the handshake. Resolves with the local stream once the
    /// handshake is underway; it does not wait for the remote side to
    /// answer. The link itself is reported later through
    /// [`CallEvent::RemoteStream`].
    ///
    /// # Errors
    ///
    /// Returns error if media acquisition fails outright, transport bring-up
    /// exhausts its attempts, or the call is torn down mid-setup. All
    /// resources are released before the error is returned.
    #[tracing::instrument(skip(self), fields(remote = %remote, call_type = ?call_type, role = ?role))]
    pub async fn start_call(
        &self,
        remote: PartyId,
        call_type: CallType,
        role: Role,
    ) -> Result<MediaStream, CallError> {
        {
            let mut core = self.core.lock().await;
            if core.phase != CallPhase::Idle {
                return Err(CallError::NotIdle);
            }
            core.transition(CallPhase::AcquiringMedia)?;
            core.remote_party = Some(remote.clone());
            core.role = Some(role);
        }
        tracing::info!("starting call");

        // Media first: the manager never opens transport or answers without
        // holding a local stream.
        let acquired =
            match media::acquire(self.media.as_ref(), call_type, &self.config.ladder).await {
                Ok(acquired) => acquired,
                Err(err) => {
                    self.end_call().await;
                    return Err(err.into());
                }
            };
        if acquired.is_degraded() {
            tracing::warn!("video capture unavailable; continuing audio-only");
            self.emit(CallEvent::Error {
                kind: FailureKind::Transient,
                reason: "video capture unavailable; call degraded to audio-only".to_string(),
            });
        }
        let stream = acquired.stream;

        {
            let mut core = self.core.lock().await;
            if core.phase != CallPhase::AcquiringMedia {
                // Torn down while capturing.
                stream.stop_all();
                return Err(CallError::Cancelled);
            }
            core.local_stream = Some(stream.clone());
            core.transition(CallPhase::OpeningTransport)?;
        }

        let endpoint = match self.bring_up_transport().await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.end_call().await;
                return Err(err);
            }
        };

        self.begin_handshake(&remote, endpoint, role).await?;
        Ok(stream)
    }

    /// Bring up the peer transport, retrying classified-transient failures.
    ///
    /// Each attempt gets a brand new session from the factory; a failed one
    /// is fully destroyed before the next is created. The delay before
    /// attempt `n + 1` is `backoff_base × n`. Teardown mid-backoff cancels
    /// the wait through the shutdown watch.
    async fn bring_up_transport(&self) -> Result<EndpointId, CallError> {
        let max_attempts = self.config.max_open_attempts.max(1);
        let mut shutdown = self.shutdown.subscribe();
        let mut last_reason = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            let session = {
                let mut core = self.core.lock().await;
                if core.phase != CallPhase::OpeningTransport {
                    return Err(CallError::Cancelled);
                }
                core.attempts = attempt;
                let session = Arc::new(PeerSession::new(self.sessions.create()));
                core.session = Some(session.clone());
                session
            };

            tracing::debug!(attempt, max_attempts, "opening peer transport");
            match session.open(&self.config.transport).await {
                Ok(endpoint) => {
                    // Success resets the retry counter.
                    self.core.lock().await.attempts = 0;
                    tracing::info!(attempt, endpoint = %endpoint, "peer transport open");
                    return Ok(endpoint);
                }
                Err(err) => {
                    session.close().await;
                    {
                        let mut core = self.core.lock().await;
                        if core.phase != CallPhase::OpeningTransport {
                            return Err(CallError::Cancelled);
                        }
                        core.session = None;
                    }
                    last_reason = err.to_string();
                    match err.kind() {
                        FailureKind::Transient if attempt < max_attempts => {
                            let delay = self.config.backoff_base * attempt;
                            tracing::warn!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %last_reason,
                                "transport bring-up failed; backing off"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                _ = shutdown.changed() => return Err(CallError::Cancelled),
                            }
                        }
                        FailureKind::Transient => {
                            tracing::warn!(
                                attempt,
                                error = %last_reason,
                                "transport bring-up failed on final attempt"
                            );
                        }
                        _ => {
                            tracing::error!(error = %last_reason, "transport bring-up failed fatally");
                            return Err(CallError::Transport {
                                reason: last_reason,
                            });
                        }
                    }
                }
            }
        }

        Err(CallError::RetriesExhausted {
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    /// Enter the handshake phase: announce or await the transport address.
    async fn begin_handshake(
        &self,
        remote: &PartyId,
        endpoint: EndpointId,
        role: Role,
    ) -> Result<(), CallError> {
        let mut core = self.core.lock().await;
        if core.phase != CallPhase::OpeningTransport {
            return Err(CallError::Cancelled);
        }
        core.local_endpoint = Some(endpoint.clone());
        core.transition(CallPhase::AwaitingHandshake)?;

        // The responder answers whatever dials in from here on.
        if role == Role::Responder {
            if let Some(rx) = core.session.as_ref().and_then(|s| s.incoming()) {
                core.watchers.push(self.spawn_incoming_watcher(rx));
            }
        }

        match role {
            Role::Initiator => {
                let request = SignalingMessage::RequestPeerId {
                    session_id: core.session_id,
                };
                tracing::info!(session = %core.session_id, "requesting remote transport address");
                if let Err(err) = self.signaling.send(remote, request).await {
                    // The handshake timer bounds how long we wait for a
                    // reply that may never come.
                    tracing::warn!(error = %err, "could not send transport address request");
                }
            }
            Role::Responder => {
                if let Some((requester, their_session)) = core.pending_request.take() {
                    let reply = SignalingMessage::PeerId {
                        session_id: their_session,
                        peer_id: endpoint,
                    };
                    tracing::info!(requester = %requester, "replying to early transport address request");
                    if let Err(err) = self.signaling.send(&requester, reply).await {
                        tracing::warn!(error = %err, "could not send transport address reply");
                    }
                }
            }
        }

        core.handshake_timer = Some(self.spawn_handshake_timer());
        Ok(())
    }

    /// Dispatch one inbound signaling message.
    ///
    /// Safe to call before `start_call` has returned (responder role) and
    /// after the call has ended, where it is a silent no-op. Messages whose
    /// session identity does not correlate with the current call are
    /// dropped; unknown shapes never reach here because decoding already
    /// rejected them.
    #[tracing::instrument(skip(self, message), fields(from = %from, kind = message.kind()))]
    pub async fn handle_signal(&self, from: PartyId, message: SignalingMessage) {
        let mut core = self.core.lock().await;
        if core.phase.is_closing() {
            tracing::trace!("dropping signal: call torn down");
            return;
        }

        match message {
            SignalingMessage::PeerId {
                session_id,
                peer_id,
            } => {
                if session_id != core.session_id {
                    tracing::debug!(stale = %session_id, "ignoring peer-id for another session");
                    return;
                }
                if core.phase != CallPhase::AwaitingHandshake || core.role != Some(Role::Initiator)
                {
                    tracing::debug!(phase = ?core.phase, "ignoring unexpected peer-id");
                    return;
                }
                self.dial_remote(&mut core, peer_id).await;
            }

            SignalingMessage::RequestPeerId {
                session_id: their_session,
            } => match core.phase {
                CallPhase::AwaitingHandshake | CallPhase::Linked => {
                    if let Some(endpoint) = core.local_endpoint.clone() {
                        let reply = SignalingMessage::PeerId {
                            session_id: their_session,
                            peer_id: endpoint,
                        };
                        tracing::info!("sharing local transport address");
                        if let Err(err) = self.signaling.send(&from, reply).await {
                            tracing::warn!(error = %err, "could not send transport address reply");
                        }
                    }
                }
                CallPhase::Idle | CallPhase::AcquiringMedia | CallPhase::OpeningTransport => {
                    // The request raced ahead of our bring-up; reply as soon
                    // as the transport is open.
                    tracing::debug!(phase = ?core.phase, "transport address requested before open; deferring");
                    core.pending_request = Some((from, their_session));
                }
                CallPhase::Closing | CallPhase::Closed => {}
            },

            SignalingMessage::CallCancelled { .. } => {
                tracing::info!("remote party cancelled the call");
                self.teardown_locked(&mut core).await;
            }

            SignalingMessage::ConnectionTest {
                session_id,
                timestamp,
            } => {
                let reply = SignalingMessage::ConnectionTestResponse {
                    session_id,
                    timestamp,
                };
                if let Err(err) = self.signaling.send(&from, reply).await {
                    tracing::warn!(error = %err, "could not echo connectivity probe");
                }
            }

            SignalingMessage::ConnectionTestResponse {
                session_id,
                timestamp,
            } => {
                if session_id != core.session_id {
                    tracing::debug!("ignoring probe echo for another session");
                    return;
                }
                let now = Utc::now().timestamp_millis();
                let rtt = Duration::from_millis(now.saturating_sub(timestamp).max(0) as u64);
                tracing::info!(rtt_ms = rtt.as_millis() as u64, "connectivity probe round trip");
                self.emit(CallEvent::ProbeRtt { rtt });
            }

            SignalingMessage::Error { reason, .. } => {
                tracing::warn!(reason = %reason, "remote reported a signaling error");
            }
        }
    }

    /// Send a connectivity probe to the remote party.
    ///
    /// Returns whether a probe was actually sent. The echo, if it arrives,
    /// is published as [`CallEvent::ProbeRtt`]; a lost probe affects
    /// nothing.
    pub async fn send_connection_test(&self) -> bool {
        let core = self.core.lock().await;
        if !matches!(
            core.phase,
            CallPhase::AwaitingHandshake | CallPhase::Linked
        ) {
            return false;
        }
        let Some(remote) = core.remote_party.clone() else {
            return false;
        };
        let probe = SignalingMessage::ConnectionTest {
            session_id: core.session_id,
            timestamp: Utc::now().timestamp_millis(),
        };
        match self.signaling.send(&remote, probe).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "could not send connectivity probe");
                self.emit(CallEvent::Error {
                    kind: FailureKind::Transient,
                    reason: format!("connectivity probe failed: {err}"),
                });
                false
            }
        }
    }

    /// End the call and release every resource.
    ///
    /// Idempotent and safe to call from any state, concurrently with any
    /// event. If the call had begun signaling, the remote party is notified
    /// best-effort before teardown.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) {
        let mut core = self.core.lock().await;
        if core.phase.is_closing() {
            return;
        }
        if matches!(
            core.phase,
            CallPhase::AwaitingHandshake | CallPhase::Linked
        ) {
            if let Some(remote) = core.remote_party.clone() {
                let notice = SignalingMessage::CallCancelled {
                    session_id: core.session_id,
                };
                if let Err(err) = self.signaling.send(&remote, notice).await {
                    tracing::debug!(error = %err, "could not notify remote of hang-up");
                }
            }
        }
        self.teardown_locked(&mut core).await;
    }

    /// Release everything, in order, defensively. Runs at most once; the
    /// `Closing` gate makes concurrent and re-entrant invocations no-ops.
    async fn teardown_locked(&self, core: &mut CallCore) {
        if core.phase.is_closing() {
            return;
        }
        let had_signaling = matches!(
            core.phase,
            CallPhase::AwaitingHandshake | CallPhase::Linked
        );
        let _ = core.transition(CallPhase::Closing);

        // Wake anything parked in a backoff or timer race.
        let _ = self.shutdown.send(true);

        // Each release step stands alone; none can prevent the others.
        if let Some(link) = core.link.take() {
            link.close();
        }
        if let Some(stream) = core.local_stream.take() {
            let stopped = stream.stop_all();
            tracing::debug!(stopped_tracks = stopped, "local media released");
        }
        if let Some(session) = core.session.take() {
            session.close().await;
        }
        core.local_endpoint = None;
        core.remote_party = None;
        core.role = None;
        core.pending_request = None;
        tracing::debug!(attempts = core.attempts, "retry counter reset");
        core.attempts = 0;

        // Rotate the session identity: late messages for the old call now
        // correlate with nothing.
        let old = core.session_id;
        core.session_id = SessionId::new();
        let _ = core.transition(CallPhase::Closed);
        tracing::info!(old_session = %old, "call torn down");

        if had_signaling {
            self.emit(CallEvent::Ended);
        }

        // Event plumbing goes last: one of these handles may belong to the
        // task currently running this teardown, and aborting it earlier
        // would leave the teardown half done.
        if let Some(timer) = core.handshake_timer.take() {
            timer.abort();
        }
        for watcher in core.watchers.drain(..) {
            watcher.abort();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    /// Dial the remote endpoint learned from the handshake. Lock held.
    async fn dial_remote(&self, core: &mut CallCore, remote_endpoint: EndpointId) {
        let (Some(session), Some(stream)) = (core.session.clone(), core.local_stream.clone())
        else {
            tracing::warn!("peer-id arrived but session or stream is missing");
            return;
        };
        tracing::info!(remote = %remote_endpoint, "dialing remote endpoint");
        match session.dial(&remote_endpoint, &stream).await {
            Ok(link) => self.install_link(core, link),
            Err(err) => {
                tracing::error!(error = %err, "dial failed");
                self.emit(CallEvent::Error {
                    kind: FailureKind::Fatal,
                    reason: format!("dial failed: {err}"),
                });
                self.teardown_locked(core).await;
            }
        }
    }

    /// Answer an inbound connection attempt (responder role).
    async fn accept_incoming(&self, incoming: IncomingLink) {
        let mut core = self.core.lock().await;
        if core.phase != CallPhase::AwaitingHandshake {
            tracing::debug!(phase = ?core.phase, "dropping inbound link");
            incoming.link.close();
            return;
        }
        let (Some(session), Some(stream)) = (core.session.clone(), core.local_stream.clone())
        else {
            incoming.link.close();
            return;
        };
        tracing::info!(remote = %incoming.remote_endpoint, "answering inbound link");
        match session.answer(incoming, &stream).await {
            Ok(link) => self.install_link(&mut core, link),
            Err(err) => {
                tracing::error!(error = %err, "answer failed");
                self.emit(CallEvent::Error {
                    kind: FailureKind::Fatal,
                    reason: format!("answer failed: {err}"),
                });
                self.teardown_locked(&mut core).await;
            }
        }
    }

    /// Adopt a live link: stop the handshake timer, go `Linked`, watch it.
    fn install_link(&self, core: &mut CallCore, link: MediaLink) {
        if let Some(timer) = core.handshake_timer.take() {
            timer.abort();
        }
        if core.transition(CallPhase::Linked).is_err() {
            link.close();
            return;
        }
        core.link = Some(link.clone());
        core.watchers.push(self.spawn_link_watcher(link));
    }

    fn spawn_incoming_watcher(
        &self,
        mut rx: mpsc::UnboundedReceiver<IncomingLink>,
    ) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                let Some(manager) = weak.upgrade() else { return };
                manager.accept_incoming(incoming).await;
            }
        })
    }

    fn spawn_link_watcher(&self, link: MediaLink) -> JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let mut events = link.subscribe();
            let mut stream_delivered = false;

            // Pick up state that landed before this watcher subscribed.
            if let Some(stream) = link.remote_stream() {
                stream_delivered = true;
                if let Some(manager) = weak.upgrade() {
                    manager.emit(CallEvent::RemoteStream { stream });
                }
            }
            if link.is_closed() {
                if let Some(manager) = weak.upgrade() {
                    manager.end_call().await;
                }
                return;
            }

            loop {
                match events.recv().await {
                    Ok(LinkEvent::RemoteStream(stream)) => {
                        if !stream_delivered {
                            stream_delivered = true;
                            if let Some(manager) = weak.upgrade() {
                                manager.emit(CallEvent::RemoteStream { stream });
                            }
                        }
                    }
                    Ok(LinkEvent::Failed(reason)) => {
                        let Some(manager) = weak.upgrade() else { return };
                        manager.emit(CallEvent::Error {
                            kind: FailureKind::Fatal,
                            reason: format!("media link failed: {reason}"),
                        });
                        manager.end_call().await;
                        return;
                    }
                    Ok(LinkEvent::Closed)
                    | Err(broadcast::error::RecvError::Closed) => {
                        let Some(manager) = weak.upgrade() else { return };
                        manager.end_call().await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
    }

    /// Arm the handshake timeout; fires only if still awaiting the address.
    fn spawn_handshake_timer(&self) -> JoinHandle<()> {
        let weak = self.weak.clone();
        let timeout = self.config.handshake_timeout;
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {}
                _ = shutdown.changed() => return,
            }
            let Some(manager) = weak.upgrade() else { return };
            let mut core = manager.core.lock().await;
            if core.phase == CallPhase::AwaitingHandshake {
                tracing::error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "handshake timed out"
                );
                manager.emit(CallEvent::Error {
                    kind: FailureKind::Fatal,
                    reason: "no reply to transport address request".to_string(),
                });
                manager.teardown_locked(&mut core).await;
            }
        })
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

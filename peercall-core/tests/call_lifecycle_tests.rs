//! Call lifecycle tests: retry bounds, teardown idempotence, stale signaling
//!
//! These tests drive a `CallManager` against scripted transport drivers so
//! every failure mode is deterministic.

use async_trait::async_trait;
use peercall_core::media::{CaptureError, MediaConstraints, MediaStream};
use peercall_core::prelude::*;
use peercall_core::session::{DriverError, IncomingLink, MediaLink};
use peercall_core::signaling::SignalingError;
use peercall_core::types::EndpointId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Signaling sink that records outbound messages and never delivers inbound.
#[derive(Default)]
struct NullSignaling {
    sent: Mutex<Vec<(PartyId, SignalingMessage)>>,
}

#[async_trait]
impl SignalingTransport for NullSignaling {
    async fn send(&self, to: &PartyId, message: SignalingMessage) -> Result<(), SignalingError> {
        self.sent.lock().unwrap().push((to.clone(), message));
        Ok(())
    }

    async fn recv(&self) -> Option<(PartyId, SignalingMessage)> {
        std::future::pending::<Option<(PartyId, SignalingMessage)>>().await
    }
}

/// Transport driver whose open outcome is fixed at creation.
struct ScriptedDriver {
    outcome: Mutex<Option<Result<EndpointId, DriverError>>>,
    closes: Arc<AtomicUsize>,
    dials: Arc<AtomicUsize>,
    closed_once: AtomicBool,
}

#[async_trait]
impl LinkDriver for ScriptedDriver {
    async fn open(
        &self,
        _config: &peercall_core::session::TransportConfig,
    ) -> Result<EndpointId, DriverError> {
        self.outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(DriverError::fatal("open script exhausted")))
    }

    async fn dial(
        &self,
        _remote: &EndpointId,
        _local: &MediaStream,
    ) -> Result<MediaLink, DriverError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(MediaLink::new())
    }

    async fn answer(
        &self,
        incoming: IncomingLink,
        _local: &MediaStream,
    ) -> Result<MediaLink, DriverError> {
        let link = MediaLink::new();
        MediaLink::pair(&incoming.link, &link);
        Ok(link)
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingLink>> {
        None
    }

    async fn close(&self) {
        if !self.closed_once.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Hands one scripted open outcome to each driver it creates.
struct ScriptedFactory {
    outcomes: Mutex<VecDeque<Result<EndpointId, DriverError>>>,
    created: AtomicUsize,
    closes: Arc<AtomicUsize>,
    dials: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    fn new(outcomes: Vec<Result<EndpointId, DriverError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            created: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            dials: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn transient_failures(n: usize) -> Vec<Result<EndpointId, DriverError>> {
        (0..n)
            .map(|_| Err(DriverError::transient("connection refused")))
            .collect()
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self) -> Arc<dyn LinkDriver> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().pop_front();
        Arc::new(ScriptedDriver {
            outcome: Mutex::new(outcome),
            closes: self.closes.clone(),
            dials: self.dials.clone(),
            closed_once: AtomicBool::new(false),
        })
    }
}

/// Capture source that records every stream it hands out.
struct RecordingSource {
    inner: SyntheticSource,
    streams: Mutex<Vec<MediaStream>>,
}

impl RecordingSource {
    fn new(inner: SyntheticSource) -> Arc<Self> {
        Arc::new(Self {
            inner,
            streams: Mutex::new(Vec::new()),
        })
    }

    fn streams(&self) -> Vec<MediaStream> {
        self.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for RecordingSource {
    async fn capture(&self, constraints: &MediaConstraints) -> Result<MediaStream, CaptureError> {
        let stream = self.inner.capture(constraints).await?;
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peercall=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn fast_config() -> CallConfig {
    CallConfig {
        max_open_attempts: 3,
        backoff_base: Duration::from_millis(10),
        handshake_timeout: Duration::from_secs(5),
        ..CallConfig::default()
    }
}

fn manager_with(
    factory: Arc<ScriptedFactory>,
    source: Arc<RecordingSource>,
    config: CallConfig,
) -> (Arc<CallManager>, Arc<NullSignaling>) {
    init_tracing();
    let signaling = Arc::new(NullSignaling::default());
    let manager = CallManager::new(signaling.clone(), factory, source, config);
    (manager, signaling)
}

#[tokio::test]
async fn test_third_attempt_succeeds_after_two_transient_failures() {
    let mut outcomes = ScriptedFactory::transient_failures(2);
    outcomes.push(Ok(EndpointId::new("ep-3")));
    let factory = ScriptedFactory::new(outcomes);
    let source = RecordingSource::new(SyntheticSource::new());
    let (manager, signaling) = manager_with(factory.clone(), source, fast_config());

    let stream = manager
        .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
        .await
        .unwrap();
    assert!(stream.has_audio());

    // Exactly three sessions were created; the two failed ones were
    // destroyed, and the third carried on into the handshake.
    assert_eq!(factory.created(), 3);
    assert_eq!(factory.closes(), 2);
    assert_eq!(manager.phase().await, CallPhase::AwaitingHandshake);

    // The handshake began: a request-peer-id went out to the remote party.
    let sent = signaling.sent.lock().unwrap().clone();
    assert!(sent.iter().any(|(to, msg)| {
        *to == PartyId::new("bob") && matches!(msg, SignalingMessage::RequestPeerId { .. })
    }));

    manager.end_call().await;
    assert_eq!(factory.closes(), 3, "all three sessions destroyed in the end");
}

#[tokio::test]
async fn test_retry_exhaustion_is_fatal_and_releases_media() {
    let factory = ScriptedFactory::new(ScriptedFactory::transient_failures(3));
    let source = RecordingSource::new(SyntheticSource::new());
    let (manager, _signaling) = manager_with(factory.clone(), source.clone(), fast_config());

    let err = manager
        .start_call(PartyId::new("bob"), CallType::Video, Role::Initiator)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(err.kind(), FailureKind::Fatal);

    assert_eq!(factory.created(), 3);
    assert_eq!(factory.closes(), 3);
    assert_eq!(manager.phase().await, CallPhase::Closed);

    // Every track of the acquired stream was stopped.
    for stream in source.streams() {
        assert!(stream.is_stopped(), "local media must be released");
    }
}

#[tokio::test]
async fn test_max_attempts_one_means_no_retry() {
    let factory = ScriptedFactory::new(ScriptedFactory::transient_failures(1));
    let source = RecordingSource::new(SyntheticSource::new());
    let config = CallConfig {
        max_open_attempts: 1,
        ..fast_config()
    };
    let (manager, _signaling) = manager_with(factory.clone(), source, config);

    let err = manager
        .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::RetriesExhausted { attempts: 1, .. }
    ));
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_fatal_transport_error_is_not_retried() {
    let factory = ScriptedFactory::new(vec![Err(DriverError::fatal("certificate rejected"))]);
    let source = RecordingSource::new(SyntheticSource::new());
    let (manager, _signaling) = manager_with(factory.clone(), source, fast_config());

    let err = manager
        .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Transport { .. }));
    assert_eq!(factory.created(), 1);
    assert_eq!(manager.phase().await, CallPhase::Closed);
}

#[tokio::test]
async fn test_media_denial_rejects_without_touching_transport() {
    let factory = ScriptedFactory::new(vec![Ok(EndpointId::new("ep-1"))]);
    let source = RecordingSource::new(SyntheticSource::unavailable());
    let (manager, _signaling) = manager_with(factory.clone(), source, fast_config());

    let err = manager
        .start_call(PartyId::new("bob"), CallType::Video, Role::Initiator)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Media(_)));
    assert_eq!(factory.created(), 0, "no transport before media");
    assert_eq!(manager.phase().await, CallPhase::Closed);
}

#[tokio::test]
async fn test_degraded_video_call_resolves_audio_only_with_warning() {
    let factory = ScriptedFactory::new(vec![Ok(EndpointId::new("ep-1"))]);
    let source = RecordingSource::new(SyntheticSource::without_camera());
    let (manager, _signaling) = manager_with(factory, source, fast_config());
    let mut events = manager.events();

    let stream = manager
        .start_call(PartyId::new("bob"), CallType::Video, Role::Initiator)
        .await
        .unwrap();
    assert!(stream.has_audio());
    assert!(!stream.has_video());

    match events.try_recv() {
        Ok(CallEvent::Error { kind, reason }) => {
            assert_eq!(kind, FailureKind::Transient);
            assert!(reason.contains("audio-only"));
        }
        other => panic!("expected degraded-mode warning, got {other:?}"),
    }

    manager.end_call().await;
}

#[tokio::test]
async fn test_teardown_is_idempotent_and_concurrent_safe() {
    let factory = ScriptedFactory::new(vec![Ok(EndpointId::new("ep-1"))]);
    let source = RecordingSource::new(SyntheticSource::new());
    let (manager, _signaling) = manager_with(factory.clone(), source.clone(), fast_config());

    manager
        .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
        .await
        .unwrap();

    // Two concurrent teardowns plus a later one: each resource is released
    // exactly once.
    tokio::join!(manager.end_call(), manager.end_call());
    manager.end_call().await;

    assert_eq!(manager.phase().await, CallPhase::Closed);
    assert_eq!(factory.closes(), 1, "transport destroyed exactly once");
    for stream in source.streams() {
        assert!(stream.is_stopped());
    }
}

#[tokio::test]
async fn test_stale_session_message_is_ignored() {
    let factory = ScriptedFactory::new(vec![Ok(EndpointId::new("ep-1"))]);
    let source = RecordingSource::new(SyntheticSource::new());
    let (manager, _signaling) = manager_with(factory.clone(), source, fast_config());

    manager
        .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
        .await
        .unwrap();
    let live_session = manager.session_id().await;

    // A peer-id for some other session produces no dial.
    manager
        .handle_signal(
            PartyId::new("bob"),
            SignalingMessage::PeerId {
                session_id: SessionId::new(),
                peer_id: EndpointId::new("ep-9"),
            },
        )
        .await;
    assert_eq!(factory.dials(), 0);
    assert_eq!(manager.phase().await, CallPhase::AwaitingHandshake);

    // After teardown, even the previously valid session id is inert.
    manager.end_call().await;
    assert_ne!(manager.session_id().await, live_session, "identity rotated");

    manager
        .handle_signal(
            PartyId::new("bob"),
            SignalingMessage::PeerId {
                session_id: live_session,
                peer_id: EndpointId::new("ep-9"),
            },
        )
        .await;
    assert_eq!(factory.dials(), 0);
    assert_eq!(manager.phase().await, CallPhase::Closed);
}

#[tokio::test]
async fn test_handshake_timeout_fails_the_call() {
    let factory = ScriptedFactory::new(vec![Ok(EndpointId::new("ep-1"))]);
    let source = RecordingSource::new(SyntheticSource::new());
    let config = CallConfig {
        handshake_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let (manager, _signaling) = manager_with(factory, source.clone(), config);
    let mut events = manager.events();

    manager
        .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
        .await
        .unwrap();

    // Nobody ever replies; the timeout surfaces a fatal error and the call
    // tears itself down.
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("handshake timeout did not fire")
        .unwrap();
    match event {
        CallEvent::Error { kind, .. } => assert_eq!(kind, FailureKind::Fatal),
        other => panic!("expected fatal error, got {other:?}"),
    }

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("teardown did not complete")
        .unwrap();
    assert!(matches!(event, CallEvent::Ended));
    assert_eq!(manager.phase().await, CallPhase::Closed);
    for stream in source.streams() {
        assert!(stream.is_stopped());
    }
}

#[tokio::test]
async fn test_manager_is_single_use() {
    let factory = ScriptedFactory::new(vec![Ok(EndpointId::new("ep-1"))]);
    let source = RecordingSource::new(SyntheticSource::new());
    let (manager, _signaling) = manager_with(factory, source, fast_config());

    manager
        .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
        .await
        .unwrap();
    manager.end_call().await;

    let err = manager
        .start_call(PartyId::new("carol"), CallType::Audio, Role::Initiator)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotIdle));
}

#[tokio::test]
async fn test_end_call_mid_backoff_cancels_promptly() {
    // All attempts fail and the backoff is long; an end_call during the
    // first backoff must cancel the bring-up well before the retries would
    // have finished.
    let factory = ScriptedFactory::new(ScriptedFactory::transient_failures(3));
    let source = RecordingSource::new(SyntheticSource::new());
    let config = CallConfig {
        backoff_base: Duration::from_secs(30),
        ..fast_config()
    };
    let (manager, _signaling) = manager_with(factory.clone(), source, config);

    let call = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .start_call(PartyId::new("bob"), CallType::Audio, Role::Initiator)
                .await
        })
    };

    // Let the first attempt fail and the backoff begin.
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.end_call().await;

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("start_call still blocked after cancellation")
        .unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert_eq!(factory.created(), 1);
}

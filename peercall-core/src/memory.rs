//! In-process signaling relay and link transport
//!
//! These adapters connect two call managers living in the same process: the
//! loopback CLI, the integration tests, and any host that embeds both ends
//! of a call. [`MemoryRelay`] is a mailbox hub implementing the signaling
//! seam; [`MemoryHub`] hands out [`LinkDriver`]s whose dial/answer pair up
//! [`MediaLink`] halves directly.
//!
//! Delivery is at-most-once and in order per sender, matching the guarantees
//! the call core is written against.

use crate::media::MediaStream;
use crate::session::{DriverError, IncomingLink, LinkDriver, MediaLink, TransportConfig};
use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{EndpointId, PartyId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Envelope = (PartyId, SignalingMessage);

#[derive(Default)]
struct RelayInner {
    mailboxes: Mutex<HashMap<PartyId, mpsc::UnboundedSender<Envelope>>>,
}

/// In-process signaling relay.
///
/// Each party attaches once and gets an endpoint implementing
/// [`SignalingTransport`]. Sends to a party that is not attached fail with
/// [`SignalingError::Unavailable`]; senders log and continue.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a party and return its transport endpoint.
    ///
    /// Re-attaching the same party replaces its mailbox; messages queued for
    /// the old endpoint are dropped.
    pub fn attach(&self, party: PartyId) -> MemoryRelayEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.mailboxes.lock().insert(party.clone(), tx);
        MemoryRelayEndpoint {
            party,
            relay: self.inner.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Number of currently attached parties
    pub fn attached(&self) -> usize {
        self.inner.mailboxes.lock().len()
    }
}

/// One party's connection to a [`MemoryRelay`]
pub struct MemoryRelayEndpoint {
    party: PartyId,
    relay: Arc<RelayInner>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl MemoryRelayEndpoint {
    /// The party this endpoint belongs to
    pub fn party(&self) -> &PartyId {
        &self.party
    }
}

impl Drop for MemoryRelayEndpoint {
    fn drop(&mut self) {
        self.relay.mailboxes.lock().remove(&self.party);
    }
}

#[async_trait]
impl SignalingTransport for MemoryRelayEndpoint {
    async fn send(&self, to: &PartyId, message: SignalingMessage) -> Result<(), SignalingError> {
        let sender = self.relay.mailboxes.lock().get(to).cloned();
        let Some(sender) = sender else {
            return Err(SignalingError::Unavailable(format!(
                "party {} is not attached",
                to
            )));
        };
        sender
            .send((self.party.clone(), message))
            .map_err(|_| SignalingError::Unavailable(format!("party {} detached", to)))
    }

    async fn recv(&self) -> Option<Envelope> {
        self.inbox.lock().await.recv().await
    }
}

#[derive(Default)]
struct HubInner {
    endpoints: Mutex<HashMap<EndpointId, mpsc::UnboundedSender<IncomingLink>>>,
    counter: AtomicU64,
}

/// In-process peer transport fabric.
///
/// Every driver created from the same hub can dial every other by endpoint
/// address. Dialing delivers an [`IncomingLink`] to the remote driver;
/// answering pairs the two [`MediaLink`] halves and exchanges streams.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh, unopened driver bound to this hub
    pub fn driver(&self) -> Arc<MemoryLinkDriver> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(MemoryLinkDriver {
            hub: self.inner.clone(),
            endpoint: Mutex::new(None),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            links: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of currently open endpoints
    pub fn endpoints(&self) -> usize {
        self.inner.endpoints.lock().len()
    }
}

impl crate::call::SessionFactory for MemoryHub {
    fn create(&self) -> Arc<dyn LinkDriver> {
        self.driver()
    }
}

/// One in-process transport endpoint
pub struct MemoryLinkDriver {
    hub: Arc<HubInner>,
    endpoint: Mutex<Option<EndpointId>>,
    incoming_tx: mpsc::UnboundedSender<IncomingLink>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingLink>>>,
    links: Mutex<Vec<MediaLink>>,
    closed: AtomicBool,
}

impl MemoryLinkDriver {
    /// The endpoint address, once open
    pub fn endpoint(&self) -> Option<EndpointId> {
        self.endpoint.lock().clone()
    }
}

#[async_trait]
impl LinkDriver for MemoryLinkDriver {
    async fn open(&self, _config: &TransportConfig) -> Result<EndpointId, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::fatal("driver already closed"));
        }
        let n = self.hub.counter.fetch_add(1, Ordering::SeqCst);
        let endpoint = EndpointId::new(format!("mem-{n}"));
        self.hub
            .endpoints
            .lock()
            .insert(endpoint.clone(), self.incoming_tx.clone());
        *self.endpoint.lock() = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn dial(
        &self,
        remote: &EndpointId,
        local: &MediaStream,
    ) -> Result<MediaLink, DriverError> {
        let local_endpoint = self
            .endpoint
            .lock()
            .clone()
            .ok_or_else(|| DriverError::fatal("driver is not open"))?;
        let target = self.hub.endpoints.lock().get(remote).cloned();
        let Some(target) = target else {
            return Err(DriverError::transient(format!(
                "no such endpoint: {remote}"
            )));
        };

        let link = MediaLink::new();
        let incoming = IncomingLink {
            remote_endpoint: local_endpoint,
            remote_stream: local.clone(),
            link: link.clone(),
        };
        target
            .send(incoming)
            .map_err(|_| DriverError::transient(format!("endpoint {remote} went away")))?;
        self.links.lock().push(link.clone());
        Ok(link)
    }

    async fn answer(
        &self,
        incoming: IncomingLink,
        local: &MediaStream,
    ) -> Result<MediaLink, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::fatal("driver already closed"));
        }
        let link = MediaLink::new();
        MediaLink::pair(&incoming.link, &link);
        // The answering side's stream flows to the dialer, and vice versa.
        incoming.link.deliver_remote_stream(local.clone());
        link.deliver_remote_stream(incoming.remote_stream);
        self.links.lock().push(link.clone());
        Ok(link)
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingLink>> {
        self.incoming_rx.lock().take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(endpoint) = self.endpoint.lock().take() {
            self.hub.endpoints.lock().remove(&endpoint);
        }
        let links = std::mem::take(&mut *self.links.lock());
        for link in links {
            link.close();
        }
    }
}

//! Request/response signaling channel
//!
//! The channel talks to the server through a [`ChannelLink`], a pair of
//! envelope queues. [`SignalingChannel::connect`] backs the link with a
//! WebSocket; tests back it with an in-memory peer from [`ChannelLink::pair`].

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::message::Envelope;
use super::pending::PendingRequests;
use super::websocket;
use crate::config::SignalingConfig;
use crate::{Error, Result};

/// Default bound on a single acknowledgment round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle of a [`SignalingChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    /// Never connected, or the server went away
    Disconnected,
    /// Released locally with [`SignalingChannel::close`]
    Closed,
}

/// One end of a message link: what we send and what we receive
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelLink {
    /// Two connected ends. Whatever one sends, the other receives.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: a_tx,
                inbound: a_rx,
            },
            Self {
                outbound: b_tx,
                inbound: b_rx,
            },
        )
    }
}

type HandlerQueue = mpsc::UnboundedSender<Value>;

struct Shared {
    pending: PendingRequests,
    handlers: Mutex<HashMap<String, Vec<HandlerQueue>>>,
    state: Mutex<ChannelState>,
}

impl Shared {
    fn new(state: ChannelState) -> Self {
        Self {
            pending: PendingRequests::new(),
            handlers: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn deliver(&self, event: &str, data: Value) {
        let mut handlers = self.handlers.lock();
        let Some(queues) = handlers.get_mut(event) else {
            trace!(event = %event, "No handler registered for event");
            return;
        };
        queues.retain(|queue| queue.send(data.clone()).is_ok());
    }

    /// Remote side went away. Returns false if the channel was already released.
    fn mark_disconnected(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ChannelState::Connected {
            return false;
        }
        *state = ChannelState::Disconnected;
        drop(state);
        self.pending.close();
        true
    }
}

/// Persistent, message-based connection to the media server
pub struct SignalingChannel {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl SignalingChannel {
    /// Open a WebSocket to the server.
    ///
    /// An unreachable server does not produce an error: the returned channel is
    /// `Disconnected` and every send fails with `SignalingUnavailable`.
    pub async fn connect(config: &SignalingConfig) -> Self {
        info!(url = %config.url, "Connecting to signaling server");

        match websocket::open(&config.url, config.connect_timeout()).await {
            Ok(link) => {
                info!(url = %config.url, "Connected to signaling server");
                Self::from_link(link, config.request_timeout())
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, "Signaling server unreachable");
                Self::disconnected(config.request_timeout())
            }
        }
    }

    /// Build a connected channel over an existing link. Must run inside a tokio runtime.
    #[must_use]
    pub fn from_link(link: ChannelLink, request_timeout: Duration) -> Self {
        let shared = Arc::new(Shared::new(ChannelState::Connected));
        let dispatcher = tokio::spawn(dispatch(link.inbound, Arc::clone(&shared)));

        Self {
            shared,
            outbound: Mutex::new(Some(link.outbound)),
            dispatcher: Mutex::new(Some(dispatcher)),
            request_timeout,
        }
    }

    /// A channel that never connected
    #[must_use]
    pub fn disconnected(request_timeout: Duration) -> Self {
        let shared = Arc::new(Shared::new(ChannelState::Disconnected));
        shared.pending.close();

        Self {
            shared,
            outbound: Mutex::new(None),
            dispatcher: Mutex::new(None),
            request_timeout,
        }
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of requests still awaiting acknowledgment
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Send an event without waiting for any reply.
    pub fn emit(&self, event: &str, payload: Value) -> Result<()> {
        debug!(event = %event, "Emitting signaling event");
        self.send(Envelope::event(event, payload))
    }

    /// Send an event and wait for its acknowledgment, bounded by the request timeout.
    pub async fn request(&self, event: &str, payload: Value) -> Result<Value> {
        let (id, rx) = self
            .shared
            .pending
            .register()
            .ok_or_else(|| self.unavailable())?;

        let guard = self.shared.pending.guard(id);

        debug!(event = %event, request_id = id, "Sending signaling request");
        self.send(Envelope::request(event, payload, id))?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => {
                guard.disarm();
                trace!(event = %event, request_id = id, "Received acknowledgment");
                Ok(reply)
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(self.unavailable())
            }
            Err(_) => {
                drop(guard);
                warn!(
                    event = %event,
                    request_id = id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Signaling request timed out"
                );
                Err(Error::Timeout {
                    event: event.to_string(),
                    after: self.request_timeout,
                })
            }
        }
    }

    /// Register a persistent handler for an inbound event.
    ///
    /// Events of the same name reach the handler strictly in arrival order;
    /// each registration runs on its own task so different events never block
    /// each other.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if self.state() == ChannelState::Closed {
            warn!(event = %event, "Ignoring handler registration on closed channel");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if shared.state() == ChannelState::Closed {
                    break;
                }
                handler(data);
            }
        });

        self.shared
            .handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(tx);
    }

    /// Release the channel: pending acknowledgments are discarded and no
    /// handler fires afterwards. Safe to call more than once.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }

        let dropped = self.shared.pending.close();
        self.shared.handlers.lock().clear();
        self.outbound.lock().take();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }

        info!(dropped_requests = dropped, "Signaling channel closed");
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(self.unavailable());
        };
        tx.send(envelope)
            .map_err(|_| Error::SignalingUnavailable("signaling link dropped".to_string()))
    }

    fn unavailable(&self) -> Error {
        match self.state() {
            ChannelState::Closed => Error::Cancelled,
            ChannelState::Disconnected => {
                Error::SignalingUnavailable("not connected to signaling server".to_string())
            }
            ChannelState::Connected => {
                Error::SignalingUnavailable("acknowledgment channel dropped".to_string())
            }
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

async fn dispatch(mut inbound: mpsc::UnboundedReceiver<Envelope>, shared: Arc<Shared>) {
    while let Some(envelope) = inbound.recv().await {
        match envelope {
            Envelope::Ack { id, data } => {
                shared.pending.resolve(id, data);
            }
            Envelope::Event { event, data, id } => {
                if let Some(id) = id {
                    debug!(event = %event, request_id = id, "Server request delivered as plain event");
                }
                shared.deliver(&event, data);
            }
        }
    }

    if shared.mark_disconnected() {
        warn!("Signaling link closed by remote");
    }
}

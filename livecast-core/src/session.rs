//! Session orchestrator
//!
//! Owns all negotiation state for one streaming session: the device, the send
//! transport and its producer. `start_streaming` sequences the pipeline and
//! `stop_stream` tears it down; the current [`SessionStatus`] is the only
//! summary exposed to observers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::StreamConfig;
use crate::media::{MediaTrack, TransportBackend};
use crate::negotiation::{
    CapabilityNegotiator, Device, Producer, ProducerController, SendTransport, TransportManager,
};
use crate::signaling::{events, SignalingChannel};
use crate::status::{SessionStatus, StatusCell};
use crate::types::SessionId;
use crate::{Error, Result};

/// Latest statistics pushed by the server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpStats {
    pub received_at: DateTime<Utc>,
    pub stats: Value,
}

/// Result of a finished negotiation attempt
enum Outcome {
    Live(Producer),
    Failed { status: SessionStatus, reason: String },
}

#[derive(Default)]
struct Pipeline {
    transport: Option<SendTransport>,
    last: Option<(u64, Outcome)>,
}

impl Pipeline {
    /// What `attempt` ended with, if it was the last one to finish.
    fn outcome_of(&self, attempt: u64) -> Option<Result<Producer>> {
        let (finished, outcome) = self.last.as_ref()?;
        if *finished != attempt {
            return None;
        }
        Some(match outcome {
            Outcome::Live(producer) => Ok(producer.clone()),
            Outcome::Failed { status, reason } => Err(Error::from_failure(*status, reason.clone())),
        })
    }
}

#[derive(Default)]
struct Attempts {
    started: u64,
    running: bool,
}

pub struct Session {
    id: SessionId,
    channel: Arc<SignalingChannel>,
    status: StatusCell,
    negotiator: CapabilityNegotiator,
    manager: Arc<TransportManager>,
    producers: ProducerController,
    pipeline: Mutex<Pipeline>,
    attempts: parking_lot::Mutex<Attempts>,
    joined: Arc<watch::Sender<bool>>,
    stats: Arc<parking_lot::Mutex<Option<RtpStats>>>,
    closed: AtomicBool,
}

impl Session {
    /// Create a session over `channel` and subscribe to the server's room pushes.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(
        channel: Arc<SignalingChannel>,
        backend: Arc<dyn TransportBackend>,
        config: &StreamConfig,
    ) -> Self {
        let id = SessionId::new();
        let status = StatusCell::new();
        let manager = Arc::new(TransportManager::new(
            Arc::clone(&channel),
            backend,
            status.clone(),
            config.force_tcp,
        ));

        let (joined, _) = watch::channel(false);
        let joined = Arc::new(joined);
        let stats = Arc::new(parking_lot::Mutex::new(None));

        {
            let joined = Arc::clone(&joined);
            let session_id = id.clone();
            channel.on(events::JOINED, move |_| {
                info!(session_id = %session_id, "Joined room");
                joined.send_replace(true);
            });
        }
        {
            let stats = Arc::clone(&stats);
            let session_id = id.clone();
            channel.on(events::RTP_STATS, move |data| {
                debug!(session_id = %session_id, stats = %data, "RTP stats received");
                *stats.lock() = Some(RtpStats {
                    received_at: Utc::now(),
                    stats: data,
                });
            });
        }

        info!(session_id = %id, force_tcp = config.force_tcp, "Session created");

        Self {
            id,
            channel,
            status,
            negotiator: CapabilityNegotiator::new(),
            producers: ProducerController::new(Arc::clone(&manager)),
            manager,
            pipeline: Mutex::new(Pipeline::default()),
            attempts: parking_lot::Mutex::new(Attempts::default()),
            joined,
            stats,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    /// Ask the server for room membership. A no-op once the room is joined.
    pub fn join_room(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        if self.is_room_joined() {
            debug!(session_id = %self.id, "Room already joined");
            return Ok(());
        }
        self.channel.emit(events::JOIN_ROOM, Value::Null)
    }

    #[must_use]
    pub fn is_room_joined(&self) -> bool {
        *self.joined.borrow()
    }

    /// Wait for the server's `joined` push.
    pub async fn wait_until_joined(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.joined.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|joined| *joined))
            .await
            .map(|joined| joined.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => Err(Error::Timeout {
                event: events::JOINED.to_string(),
                after: timeout,
            }),
        }
    }

    #[must_use]
    pub fn latest_stats(&self) -> Option<RtpStats> {
        self.stats.lock().clone()
    }

    #[must_use]
    pub fn device(&self) -> Option<Arc<Device>> {
        self.negotiator.device()
    }

    /// Number of capability requests this session has sent
    #[must_use]
    pub fn capability_requests(&self) -> usize {
        self.negotiator.requests_sent()
    }

    pub async fn producer(&self) -> Option<Producer> {
        self.pipeline
            .lock()
            .await
            .transport
            .as_ref()
            .and_then(SendTransport::producer)
            .cloned()
    }

    /// Run the negotiation pipeline and publish `track`.
    ///
    /// Re-entry is idempotent: a loaded device is reused and a live producer is
    /// returned as is. After a failure the failed transport is discarded and
    /// negotiation restarts from `Idle`. Calls are serialized, and a call that
    /// queued behind a running attempt gets that attempt's result instead of
    /// starting another one. The track stays owned by the caller.
    #[instrument(skip_all, fields(session_id = %self.id, kind = %track.kind()))]
    pub async fn start_streaming(&self, track: &MediaTrack) -> Result<Producer> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let in_flight = {
            let attempts = self.attempts.lock();
            attempts.running.then_some(attempts.started)
        };

        let mut pipeline = self.pipeline.lock().await;
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        if let Some(outcome) = in_flight.and_then(|attempt| pipeline.outcome_of(attempt)) {
            debug!(ok = outcome.is_ok(), "Returning result of the attempt already in flight");
            return outcome;
        }

        if self.status.get().is_live() {
            if let Some(producer) = pipeline.transport.as_ref().and_then(SendTransport::producer) {
                debug!(producer_id = %producer.id, "Already live, returning existing producer");
                return Ok(producer.clone());
            }
        }

        let attempt = {
            let mut attempts = self.attempts.lock();
            attempts.started += 1;
            attempts.running = true;
            attempts.started
        };

        let result = self.negotiate(&mut pipeline, track).await;
        let outcome = match &result {
            Ok(producer) => Outcome::Live(producer.clone()),
            Err(e) => Outcome::Failed {
                status: e.failure_status().unwrap_or_else(|| self.status.get()),
                reason: e.detail(),
            },
        };
        pipeline.last = Some((attempt, outcome));
        self.attempts.lock().running = false;

        result
    }

    async fn negotiate(&self, pipeline: &mut Pipeline, track: &MediaTrack) -> Result<Producer> {
        if self.status.get() != SessionStatus::Idle {
            info!(from = ?self.status.get(), "Restarting negotiation");
            self.status.reset()?;
        }
        if let Some(stale) = pipeline.transport.take() {
            debug!(transport_id = %stale.id(), state = %stale.state(), "Discarding previous transport");
        }

        let device = match self.negotiator.load(&self.channel).await {
            Ok(device) => device,
            Err(e) => {
                warn!(error = %e, "Capability negotiation failed");
                self.manager
                    .record_failure(SessionStatus::CapabilitiesError, &e);
                return Err(e);
            }
        };
        self.status.transition(SessionStatus::DeviceLoaded)?;

        let created = self.manager.create_transport(&device).await?;
        let transport = pipeline.transport.insert(created);

        self.producers.produce(transport, &device, track).await
    }

    /// Release the session: the channel is closed, in-flight steps end as
    /// `Cancelled`, the transport and producer are discarded and the status
    /// returns to `Idle`. Later `start_streaming` calls fail with `SessionClosed`.
    pub async fn stop_stream(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.status.close();
        self.channel.close();

        let discarded = self.pipeline.lock().await.transport.take();
        info!(
            session_id = %self.id,
            transport_id = ?discarded.as_ref().map(SendTransport::id),
            "Session stopped"
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status.get())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

//! Send transport lifecycle
//!
//! A transport is created by a server round trip, then connected lazily on the
//! first production attempt. Its legal orderings are encoded in
//! [`TransportState::apply`]; the [`TransportManager`] bridges each phase to a
//! signaling round trip and reports the verdict to the local backend.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::device::Device;
use super::producer::Producer;
use super::rtp::{DtlsParameters, RtpCapabilities, RtpParameters, TransportDescriptor};
use crate::media::{MediaKind, TransportBackend};
use crate::signaling::{events, is_empty_reply, reply_error, SignalingChannel};
use crate::status::{SessionStatus, StatusCell};
use crate::types::{ProducerId, TransportId};
use crate::{Error, Result};

/// Why a transport stopped being usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Connection,
    Produce,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Producing,
    Live,
    Failed(TransportFailure),
}

/// Inputs to the transport state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectRequested,
    ConnectAcked,
    ConnectFailed,
    ProduceRequested,
    ProduceAcked,
    ProduceFailed,
    AttachFailed,
}

impl TransportState {
    /// Next state for `event`, or `InvalidState` if the event is out of order.
    pub fn apply(self, event: TransportEvent) -> Result<Self> {
        use TransportEvent as E;
        use TransportState as S;

        let next = match (self, event) {
            (S::Created, E::ConnectRequested) => S::Connecting,
            (S::Connecting, E::ConnectAcked) => S::Connected,
            (S::Connecting, E::ConnectFailed) => S::Failed(TransportFailure::Connection),
            (S::Connected, E::ProduceRequested) => S::Producing,
            (S::Connected, E::AttachFailed) => S::Failed(TransportFailure::Stream),
            (S::Producing, E::ProduceAcked) => S::Live,
            (S::Producing, E::ProduceFailed) => S::Failed(TransportFailure::Produce),
            (state, event) => {
                return Err(Error::InvalidState(format!(
                    "transport cannot handle {event:?} while {state:?}"
                )))
            }
        };
        Ok(next)
    }

    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// DTLS handshake acknowledged by the server
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Producing | Self::Live)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// One outbound media pipe
#[derive(Debug)]
pub struct SendTransport {
    descriptor: TransportDescriptor,
    state: TransportState,
    producer: Option<Producer>,
    created_at: DateTime<Utc>,
}

impl SendTransport {
    #[must_use]
    pub fn new(descriptor: TransportDescriptor) -> Self {
        Self {
            descriptor,
            state: TransportState::Created,
            producer: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TransportId {
        &self.descriptor.id
    }

    #[must_use]
    pub const fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub const fn state(&self) -> TransportState {
        self.state
    }

    #[must_use]
    pub const fn producer(&self) -> Option<&Producer> {
        self.producer.as_ref()
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn advance(&mut self, event: TransportEvent) -> Result<()> {
        let next = self.state.apply(event)?;
        debug!(transport_id = %self.id(), from = %self.state, to = %next, "Transport state changed");
        self.state = next;
        Ok(())
    }

    pub(crate) fn attach_producer(&mut self, producer: Producer) {
        self.producer = Some(producer);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransportRequest<'a> {
    force_tcp: bool,
    rtp_capabilities: &'a RtpCapabilities,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportRequest<'a> {
    transport_id: &'a TransportId,
    dtls_parameters: &'a DtlsParameters,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProduceRequest<'a> {
    transport_id: &'a TransportId,
    kind: MediaKind,
    rtp_parameters: &'a RtpParameters,
}

/// Creates send transports and drives their connect and produce phases
pub struct TransportManager {
    channel: Arc<SignalingChannel>,
    backend: Arc<dyn TransportBackend>,
    status: StatusCell,
    force_tcp: bool,
}

impl TransportManager {
    pub fn new(
        channel: Arc<SignalingChannel>,
        backend: Arc<dyn TransportBackend>,
        status: StatusCell,
        force_tcp: bool,
    ) -> Self {
        Self {
            channel,
            backend,
            status,
            force_tcp,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn TransportBackend> {
        &self.backend
    }

    /// Ask the server for a send transport matching the device capabilities.
    #[instrument(skip_all, fields(force_tcp = self.force_tcp))]
    pub async fn create_transport(&self, device: &Device) -> Result<SendTransport> {
        match self.request_transport(device).await {
            Ok(descriptor) => {
                info!(
                    transport_id = %descriptor.id,
                    candidates = descriptor.ice_candidates.len(),
                    "Send transport created"
                );
                Ok(SendTransport::new(descriptor))
            }
            Err(e) => {
                warn!(error = %e, "Transport creation failed");
                self.record_failure(SessionStatus::TransportCreationFailed, &e);
                Err(e)
            }
        }
    }

    async fn request_transport(&self, device: &Device) -> Result<TransportDescriptor> {
        let payload = serde_json::to_value(CreateTransportRequest {
            force_tcp: self.force_tcp,
            rtp_capabilities: device.rtp_capabilities(),
        })?;

        let reply = self
            .channel
            .request(events::CREATE_WEBRTC_TRANSPORT, payload)
            .await?;

        if is_empty_reply(&reply) {
            return Err(Error::TransportCreation(
                "server returned no transport".to_string(),
            ));
        }
        if let Some(error) = reply_error(&reply) {
            return Err(Error::TransportCreation(error));
        }

        serde_json::from_value(reply)
            .map_err(|e| Error::TransportCreation(format!("malformed transport descriptor: {e}")))
    }

    /// DTLS handshake: forward local parameters and wait for the server's verdict.
    #[instrument(skip_all, fields(transport_id = %transport.id()))]
    pub async fn connect(&self, transport: &mut SendTransport) -> Result<()> {
        transport.advance(TransportEvent::ConnectRequested)?;
        self.status.transition(SessionStatus::TransportConnecting)?;

        let id = transport.id().clone();
        match self.connect_round_trip(transport.descriptor()).await {
            Ok(()) => {
                transport.advance(TransportEvent::ConnectAcked)?;
                self.backend.on_connected(&id);
                self.status.transition(SessionStatus::TransportConnected)?;
                info!("Transport connected");
                Ok(())
            }
            Err(e) => {
                transport.advance(TransportEvent::ConnectFailed)?;
                self.backend.on_connect_failed(&id, &e.to_string());
                warn!(error = %e, "Transport connection failed");
                self.record_failure(SessionStatus::TransportConnectionFailed, &e);
                Err(e)
            }
        }
    }

    async fn connect_round_trip(&self, descriptor: &TransportDescriptor) -> Result<()> {
        let dtls_parameters = self
            .backend
            .local_dtls_parameters(descriptor)
            .await
            .map_err(|e| Error::TransportConnection(format!("no local DTLS parameters: {e}")))?;

        let payload = serde_json::to_value(ConnectTransportRequest {
            transport_id: &descriptor.id,
            dtls_parameters: &dtls_parameters,
        })?;

        let reply = self
            .channel
            .request(events::CONNECT_TRANSPORT, payload)
            .await?;

        match reply_error(&reply) {
            Some(error) => Err(Error::TransportConnection(error)),
            None => Ok(()),
        }
    }

    /// Ask the server to accept a production on a connected transport.
    #[instrument(skip_all, fields(transport_id = %transport.id(), kind = %kind))]
    pub async fn produce(
        &self,
        transport: &mut SendTransport,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId> {
        transport.advance(TransportEvent::ProduceRequested)?;
        self.status.transition(SessionStatus::ProduceRequested)?;

        let id = transport.id().clone();
        match self.produce_round_trip(&id, kind, rtp_parameters).await {
            Ok(producer_id) => {
                transport.advance(TransportEvent::ProduceAcked)?;
                self.backend.on_produced(&id, &producer_id);
                self.status.transition(SessionStatus::Live)?;
                info!(producer_id = %producer_id, "Producer accepted");
                Ok(producer_id)
            }
            Err(e) => {
                transport.advance(TransportEvent::ProduceFailed)?;
                self.backend.on_produce_failed(&id, &e.to_string());
                warn!(error = %e, "Produce request failed");
                self.record_failure(SessionStatus::ProduceFailed, &e);
                Err(e)
            }
        }
    }

    async fn produce_round_trip(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId> {
        let payload = serde_json::to_value(ProduceRequest {
            transport_id,
            kind,
            rtp_parameters,
        })?;

        let reply = self.channel.request(events::PRODUCE, payload).await?;

        if let Some(error) = reply_error(&reply) {
            return Err(Error::Produce(error));
        }
        reply
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(ProducerId::from)
            .ok_or_else(|| Error::Produce("server reply carries no producer id".to_string()))
    }

    /// Publish the failure status for `error`, unless the session was torn down.
    ///
    /// Errors that name their own step keep it; signaling errors such as a
    /// timeout take the status of the step that observed them.
    pub(crate) fn record_failure(&self, step: SessionStatus, error: &Error) {
        if matches!(error, Error::Cancelled) {
            debug!(status = ?step, "Step cancelled, status left untouched");
            return;
        }
        let status = error.failure_status().unwrap_or(step);
        if let Err(e) = self.status.transition(status) {
            debug!(status = ?status, error = %e, "Could not publish failure status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransportEvent as E;
    use TransportState as S;

    fn run(events: &[TransportEvent]) -> Result<TransportState> {
        events
            .iter()
            .try_fold(S::Created, |state, event| state.apply(*event))
    }

    #[test]
    fn test_happy_path() {
        let state = run(&[
            E::ConnectRequested,
            E::ConnectAcked,
            E::ProduceRequested,
            E::ProduceAcked,
        ])
        .unwrap();
        assert_eq!(state, S::Live);
        assert!(state.is_connected());
    }

    #[test]
    fn test_produce_requires_connect_ack() {
        assert!(run(&[E::ProduceRequested]).is_err());
        assert!(run(&[E::ConnectRequested, E::ProduceRequested]).is_err());
    }

    #[test]
    fn test_connect_runs_once() {
        assert!(run(&[E::ConnectRequested, E::ConnectAcked, E::ConnectRequested]).is_err());
    }

    #[test]
    fn test_failures_are_terminal() {
        let failed = run(&[E::ConnectRequested, E::ConnectFailed]).unwrap();
        assert_eq!(failed, S::Failed(TransportFailure::Connection));
        assert!(failed.is_failed());
        for event in [
            E::ConnectRequested,
            E::ConnectAcked,
            E::ProduceRequested,
            E::ProduceAcked,
            E::AttachFailed,
        ] {
            assert!(failed.apply(event).is_err(), "{event:?} left a failed transport");
        }

        let rejected = run(&[
            E::ConnectRequested,
            E::ConnectAcked,
            E::ProduceRequested,
            E::ProduceFailed,
        ])
        .unwrap();
        assert_eq!(rejected, S::Failed(TransportFailure::Produce));
    }

    #[test]
    fn test_attach_failure_only_from_connected() {
        assert_eq!(
            run(&[E::ConnectRequested, E::ConnectAcked, E::AttachFailed]).unwrap(),
            S::Failed(TransportFailure::Stream)
        );
        assert!(run(&[E::AttachFailed]).is_err());
    }

    #[test]
    fn test_second_produce_rejected() {
        let live = run(&[
            E::ConnectRequested,
            E::ConnectAcked,
            E::ProduceRequested,
            E::ProduceAcked,
        ])
        .unwrap();
        assert!(live.apply(E::ProduceRequested).is_err());
    }
}

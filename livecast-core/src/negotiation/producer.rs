//! Production of a local track on a send transport

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::device::Device;
use super::transport::{SendTransport, TransportEvent, TransportManager, TransportState};
use crate::media::{MediaKind, MediaTrack};
use crate::status::SessionStatus;
use crate::types::{ProducerId, TrackId, TransportId};
use crate::{Error, Result};

/// Server-side handle for a track being sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Producer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub track_id: TrackId,
    pub transport_id: TransportId,
    pub created_at: DateTime<Utc>,
}

/// Runs the connect, attach and produce phases for one track
pub struct ProducerController {
    manager: Arc<TransportManager>,
}

impl ProducerController {
    pub fn new(manager: Arc<TransportManager>) -> Self {
        Self { manager }
    }

    /// Produce `track` on `transport`, connecting the transport first if needed.
    ///
    /// A transport carries at most one producer; asking again is an
    /// `InvalidState` error and sends nothing.
    #[instrument(skip_all, fields(transport_id = %transport.id(), kind = %track.kind()))]
    pub async fn produce(
        &self,
        transport: &mut SendTransport,
        device: &Device,
        track: &MediaTrack,
    ) -> Result<Producer> {
        match transport.state() {
            TransportState::Created | TransportState::Connected => {}
            TransportState::Producing | TransportState::Live => {
                return Err(Error::InvalidState(format!(
                    "transport {} already has a producer",
                    transport.id()
                )));
            }
            state => {
                return Err(Error::InvalidState(format!(
                    "transport {} cannot produce while {state}",
                    transport.id()
                )));
            }
        }

        if transport.state() == TransportState::Created {
            self.manager.connect(transport).await?;
        }

        let attached = self
            .manager
            .backend()
            .attach_track(transport.id(), track, device)
            .await;
        let rtp_parameters = match attached {
            Ok(parameters) => parameters,
            Err(e) => {
                let e = match e {
                    Error::Stream(_) => e,
                    other => Error::Stream(other.to_string()),
                };
                transport.advance(TransportEvent::AttachFailed)?;
                warn!(error = %e, "Could not attach track");
                self.manager.record_failure(SessionStatus::StreamError, &e);
                return Err(e);
            }
        };

        let kind = track.kind();
        let id = self
            .manager
            .produce(transport, kind, &rtp_parameters)
            .await?;

        let producer = Producer {
            id,
            kind,
            track_id: track.id().clone(),
            transport_id: transport.id().clone(),
            created_at: Utc::now(),
        };
        transport.attach_producer(producer.clone());

        info!(producer_id = %producer.id, track_id = %producer.track_id, "Track is live");
        Ok(producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SimulatedBackend;
    use crate::negotiation::rtp::TransportDescriptor;
    use crate::signaling::{events, ChannelLink, Envelope, SignalingChannel};
    use crate::status::StatusCell;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn device() -> Device {
        Device::load(json!({
            "codecs": [{"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}]
        }))
        .unwrap()
    }

    fn transport() -> SendTransport {
        let descriptor: TransportDescriptor = serde_json::from_value(json!({
            "id": "t1",
            "iceParameters": {"usernameFragment": "u", "password": "p"},
            "dtlsParameters": {"fingerprints": []}
        }))
        .unwrap();
        SendTransport::new(descriptor)
    }

    #[tokio::test]
    async fn test_second_produce_is_rejected_without_signaling() {
        let (client, mut server) = ChannelLink::pair();
        let channel = Arc::new(SignalingChannel::from_link(client, Duration::from_secs(5)));
        let produce_requests = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&produce_requests);
        tokio::spawn(async move {
            while let Some(Envelope::Event { event, id: Some(id), .. }) = server.inbound.recv().await {
                let reply = if event == events::PRODUCE {
                    counter.fetch_add(1, Ordering::SeqCst);
                    json!({"id": "p1"})
                } else {
                    json!({})
                };
                let _ = server.outbound.send(Envelope::ack(id, reply));
            }
        });

        let status = StatusCell::new();
        status.transition(SessionStatus::DeviceLoaded).unwrap();
        let manager = Arc::new(TransportManager::new(
            channel,
            Arc::new(SimulatedBackend::new()),
            status.clone(),
            false,
        ));
        let controller = ProducerController::new(manager);
        let device = device();
        let track = MediaTrack::new(MediaKind::Video, "cam");
        let mut transport = transport();

        let producer = controller.produce(&mut transport, &device, &track).await.unwrap();
        assert_eq!(producer.id.as_str(), "p1");
        assert_eq!(transport.state(), TransportState::Live);
        assert_eq!(transport.producer(), Some(&producer));
        assert_eq!(status.get(), SessionStatus::Live);

        let second = controller.produce(&mut transport, &device, &track).await;
        assert!(matches!(second, Err(Error::InvalidState(_))));
        assert_eq!(produce_requests.load(Ordering::SeqCst), 1);
        assert_eq!(status.get(), SessionStatus::Live);
    }
}

//! Transport machinery collaborator
//!
//! The negotiation core never touches ICE, DTLS or RTP packetization. It asks a
//! [`TransportBackend`] for the local parameters it has to forward to the
//! server, and reports the server's verdict back through the callbacks.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::MediaTrack;
use crate::negotiation::device::Device;
use crate::negotiation::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, RtcpParameters, RtpCodecParameters,
    RtpEncodingParameters, RtpHeaderExtensionParameters, RtpParameters, TransportDescriptor,
};
use crate::types::{ProducerId, TransportId};
use crate::{Error, Result};

/// First dynamic RTP payload type
const DYNAMIC_PAYLOAD_TYPE_BASE: u8 = 96;

#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// Local DTLS parameters for the handshake with the server's transport.
    async fn local_dtls_parameters(&self, remote: &TransportDescriptor) -> Result<DtlsParameters>;

    /// Server accepted the DTLS parameters.
    fn on_connected(&self, transport_id: &TransportId);

    /// Server rejected the DTLS parameters; the local transport is now failed.
    fn on_connect_failed(&self, transport_id: &TransportId, reason: &str);

    /// Attach a track to the transport and describe what will be sent.
    async fn attach_track(
        &self,
        transport_id: &TransportId,
        track: &MediaTrack,
        device: &Device,
    ) -> Result<RtpParameters>;

    /// Server accepted the production.
    fn on_produced(&self, transport_id: &TransportId, producer_id: &ProducerId);

    /// Server rejected the production.
    fn on_produce_failed(&self, transport_id: &TransportId, reason: &str);
}

/// Callback recorded by [`SimulatedBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Connected(TransportId),
    ConnectFailed(TransportId, String),
    Attached(TransportId, MediaTrackSummary),
    Produced(TransportId, ProducerId),
    ProduceFailed(TransportId, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrackSummary {
    pub kind: super::MediaKind,
    pub ssrc: u32,
}

/// Backend that fabricates plausible parameters without opening sockets
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    events: Mutex<Vec<BackendEvent>>,
}

impl SimulatedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks received so far, oldest first
    #[must_use]
    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().push(event);
    }
}

/// SHA-256 fingerprint in the colon-separated uppercase form used by SDP
fn fingerprint(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

fn random_ssrc() -> u32 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[async_trait]
impl TransportBackend for SimulatedBackend {
    async fn local_dtls_parameters(&self, remote: &TransportDescriptor) -> Result<DtlsParameters> {
        let role = match remote.dtls_parameters.role {
            DtlsRole::Client => DtlsRole::Server,
            DtlsRole::Server | DtlsRole::Auto => DtlsRole::Client,
        };
        let seed = uuid::Uuid::new_v4();

        debug!(transport_id = %remote.id, role = ?role, "Generated local DTLS parameters");
        Ok(DtlsParameters {
            role,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: fingerprint(seed.as_bytes()),
            }],
        })
    }

    fn on_connected(&self, transport_id: &TransportId) {
        info!(transport_id = %transport_id, "Local transport connected");
        self.record(BackendEvent::Connected(transport_id.clone()));
    }

    fn on_connect_failed(&self, transport_id: &TransportId, reason: &str) {
        warn!(transport_id = %transport_id, reason = %reason, "Local transport failed");
        self.record(BackendEvent::ConnectFailed(
            transport_id.clone(),
            reason.to_string(),
        ));
    }

    async fn attach_track(
        &self,
        transport_id: &TransportId,
        track: &MediaTrack,
        device: &Device,
    ) -> Result<RtpParameters> {
        if track.is_ended() {
            return Err(Error::Stream(format!("track {} has ended", track.id())));
        }

        let kind = track.kind();
        let codec = device
            .codec_for(kind)
            .ok_or_else(|| Error::Stream(format!("device cannot produce {kind}")))?;

        let header_extensions = device
            .rtp_capabilities()
            .header_extensions
            .iter()
            .filter(|ext| ext.kind == kind)
            .map(|ext| RtpHeaderExtensionParameters {
                uri: ext.uri.clone(),
                id: ext.preferred_id,
            })
            .collect();

        let ssrc = random_ssrc();
        self.record(BackendEvent::Attached(
            transport_id.clone(),
            MediaTrackSummary { kind, ssrc },
        ));

        Ok(RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec
                    .preferred_payload_type
                    .unwrap_or(DYNAMIC_PAYLOAD_TYPE_BASE),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            header_extensions,
            encodings: vec![RtpEncodingParameters { ssrc }],
            rtcp: RtcpParameters {
                cname: track.id().to_string(),
                reduced_size: true,
            },
        })
    }

    fn on_produced(&self, transport_id: &TransportId, producer_id: &ProducerId) {
        info!(transport_id = %transport_id, producer_id = %producer_id, "Local producer live");
        self.record(BackendEvent::Produced(
            transport_id.clone(),
            producer_id.clone(),
        ));
    }

    fn on_produce_failed(&self, transport_id: &TransportId, reason: &str) {
        warn!(transport_id = %transport_id, reason = %reason, "Local producer rejected");
        self.record(BackendEvent::ProduceFailed(
            transport_id.clone(),
            reason.to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use serde_json::json;

    fn device() -> Device {
        Device::load(json!({
            "codecs": [
                {"kind": "video", "mimeType": "video/H264", "clockRate": 90000, "preferredPayloadType": 125,
                 "parameters": {"packetization-mode": 1}},
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}
            ],
            "headerExtensions": [
                {"kind": "video", "uri": "urn:3gpp:video-orientation", "preferredId": 4},
                {"kind": "audio", "uri": "urn:ietf:params:rtp-hdrext:ssrc-audio-level", "preferredId": 10}
            ]
        }))
        .unwrap()
    }

    fn descriptor() -> TransportDescriptor {
        serde_json::from_value(json!({
            "id": "t-1",
            "iceParameters": {"usernameFragment": "u", "password": "p"},
            "dtlsParameters": {"role": "auto", "fingerprints": []}
        }))
        .unwrap()
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"seed");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.split(':').all(|byte| byte.len() == 2));
        assert_eq!(fp, fp.to_uppercase());
    }

    #[tokio::test]
    async fn test_dtls_role_is_complementary() {
        let backend = SimulatedBackend::new();
        let params = backend.local_dtls_parameters(&descriptor()).await.unwrap();
        assert_eq!(params.role, DtlsRole::Client);
        assert_eq!(params.fingerprints[0].algorithm, "sha-256");
    }

    #[tokio::test]
    async fn test_attach_uses_device_codec() {
        let backend = SimulatedBackend::new();
        let track = MediaTrack::new(MediaKind::Video, "cam");
        let params = backend
            .attach_track(&"t-1".into(), &track, &device())
            .await
            .unwrap();

        assert_eq!(params.codecs[0].mime_type, "video/H264");
        assert_eq!(params.codecs[0].payload_type, 125);
        assert_eq!(params.header_extensions.len(), 1);
        assert_eq!(params.header_extensions[0].id, 4);
        assert_eq!(params.rtcp.cname, track.id().to_string());
        assert!(matches!(backend.events()[0], BackendEvent::Attached(_, _)));
    }

    #[tokio::test]
    async fn test_attach_rejects_ended_track() {
        let backend = SimulatedBackend::new();
        let track = MediaTrack::new(MediaKind::Audio, "mic");
        track.stop();

        let result = backend.attach_track(&"t-1".into(), &track, &device()).await;
        assert!(matches!(result, Err(Error::Stream(_))));
        assert!(backend.events().is_empty());
    }
}

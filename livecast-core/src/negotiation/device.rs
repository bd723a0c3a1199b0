//! Capability negotiation
//!
//! Builds the local [`Device`] from the router's RTP capabilities. A session
//! holds at most one device; [`CapabilityNegotiator`] loads it once and shares
//! a single in-flight request between concurrent callers.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::rtp::{RtpCapabilities, RtpCodecCapability};
use crate::media::MediaKind;
use crate::signaling::{events, is_empty_reply, SignalingChannel};
use crate::{Error, Result};

/// Codecs the local media stack can send, matched case-insensitively on mime type
const SUPPORTED_MIME_TYPES: &[&str] = &[
    "audio/opus",
    "audio/PCMU",
    "audio/PCMA",
    "video/VP8",
    "video/VP9",
    "video/H264",
    "video/rtx",
];

/// Local negotiation context loaded with the router's capabilities
#[derive(Debug, Clone)]
pub struct Device {
    router_capabilities: RtpCapabilities,
    send_capabilities: RtpCapabilities,
    loaded_at: DateTime<Utc>,
}

impl Device {
    /// Construct a device from a raw capability descriptor.
    ///
    /// Empty, undecodable or inconsistent descriptors are all `Capabilities` errors.
    pub fn load(descriptor: Value) -> Result<Self> {
        if is_empty_reply(&descriptor) {
            return Err(Error::Capabilities(
                "router returned no RTP capabilities".to_string(),
            ));
        }

        let router_capabilities: RtpCapabilities = serde_json::from_value(descriptor)
            .map_err(|e| Error::Capabilities(format!("malformed capability descriptor: {e}")))?;

        for codec in &router_capabilities.codecs {
            validate_codec(codec)?;
        }

        let send_capabilities = RtpCapabilities {
            codecs: router_capabilities
                .codecs
                .iter()
                .filter(|codec| is_supported(codec))
                .cloned()
                .collect(),
            header_extensions: router_capabilities.header_extensions.clone(),
        };

        if !send_capabilities.codecs.iter().any(|codec| !codec.is_rtx()) {
            return Err(Error::Capabilities(
                "no media codec in common with the router".to_string(),
            ));
        }

        Ok(Self {
            router_capabilities,
            send_capabilities,
            loaded_at: Utc::now(),
        })
    }

    /// Capabilities advertised to the server when creating a transport
    #[must_use]
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.send_capabilities
    }

    #[must_use]
    pub const fn router_rtp_capabilities(&self) -> &RtpCapabilities {
        &self.router_capabilities
    }

    #[must_use]
    pub const fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// First usable send codec for `kind`
    #[must_use]
    pub fn codec_for(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.send_capabilities
            .codecs
            .iter()
            .find(|codec| codec.kind == kind && !codec.is_rtx())
    }

    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.codec_for(kind).is_some()
    }
}

fn validate_codec(codec: &RtpCodecCapability) -> Result<()> {
    let Some((prefix, name)) = codec.mime_type.split_once('/') else {
        return Err(Error::Capabilities(format!(
            "invalid mimeType '{}'",
            codec.mime_type
        )));
    };
    if name.is_empty() || !prefix.eq_ignore_ascii_case(codec.kind.as_str()) {
        return Err(Error::Capabilities(format!(
            "mimeType '{}' does not match kind '{}'",
            codec.mime_type, codec.kind
        )));
    }
    if codec.clock_rate == 0 {
        return Err(Error::Capabilities(format!(
            "codec '{}' has zero clockRate",
            codec.mime_type
        )));
    }
    Ok(())
}

fn is_supported(codec: &RtpCodecCapability) -> bool {
    SUPPORTED_MIME_TYPES
        .iter()
        .any(|mime| mime.eq_ignore_ascii_case(&codec.mime_type))
}

/// Loads the session's device exactly once
#[derive(Default)]
pub struct CapabilityNegotiator {
    device: OnceCell<Arc<Device>>,
    requests: AtomicUsize,
}

impl CapabilityNegotiator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the device, requesting the router capabilities if none is loaded.
    ///
    /// Calls made while a load is in flight wait for that load instead of
    /// sending their own request. A failed load leaves no device behind.
    pub async fn load(&self, channel: &SignalingChannel) -> Result<Arc<Device>> {
        if let Some(device) = self.device.get() {
            debug!("Device already loaded, skipping capability request");
            return Ok(Arc::clone(device));
        }

        let device = self
            .device
            .get_or_try_init(|| async move {
                self.requests.fetch_add(1, Ordering::SeqCst);
                let reply = channel
                    .request(events::GET_ROUTER_RTP_CAPABILITIES, Value::Null)
                    .await?;

                match Device::load(reply) {
                    Ok(device) => {
                        info!(
                            codecs = device.rtp_capabilities().codecs.len(),
                            header_extensions = device.rtp_capabilities().header_extensions.len(),
                            "Device loaded with router capabilities"
                        );
                        Ok(Arc::new(device))
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to load device");
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(Arc::clone(device))
    }

    #[must_use]
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.get().cloned()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.device.initialized()
    }

    /// Number of capability requests sent so far
    #[must_use]
    pub fn requests_sent(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{ChannelLink, Envelope};
    use serde_json::json;
    use std::time::Duration;

    fn router_capabilities() -> Value {
        json!({
            "codecs": [
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2, "preferredPayloadType": 100},
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000, "preferredPayloadType": 101},
                {"kind": "video", "mimeType": "video/rtx", "clockRate": 90000, "preferredPayloadType": 102, "parameters": {"apt": 101}},
                {"kind": "video", "mimeType": "video/AV1", "clockRate": 90000, "preferredPayloadType": 103}
            ],
            "headerExtensions": [
                {"kind": "video", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1}
            ]
        })
    }

    #[test]
    fn test_load_filters_unsupported_codecs() {
        let device = Device::load(router_capabilities()).unwrap();

        assert_eq!(device.router_rtp_capabilities().codecs.len(), 4);
        assert_eq!(device.rtp_capabilities().codecs.len(), 3);
        assert!(device.can_produce(MediaKind::Video));
        assert!(device.can_produce(MediaKind::Audio));
        assert_eq!(device.codec_for(MediaKind::Video).unwrap().codec_name(), "VP8");
    }

    #[test]
    fn test_empty_descriptor_is_capabilities_error() {
        assert!(matches!(Device::load(Value::Null), Err(Error::Capabilities(_))));
        assert!(matches!(Device::load(json!({})), Err(Error::Capabilities(_))));
    }

    #[test]
    fn test_malformed_descriptor_is_capabilities_error() {
        let wrong_shape = json!({"codecs": "opus"});
        assert!(matches!(Device::load(wrong_shape), Err(Error::Capabilities(_))));

        let kind_mismatch = json!({"codecs": [{"kind": "audio", "mimeType": "video/VP8", "clockRate": 90000}]});
        assert!(matches!(Device::load(kind_mismatch), Err(Error::Capabilities(_))));

        let zero_clock = json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus", "clockRate": 0}]});
        assert!(matches!(Device::load(zero_clock), Err(Error::Capabilities(_))));

        let only_rtx = json!({"codecs": [{"kind": "video", "mimeType": "video/rtx", "clockRate": 90000}]});
        assert!(matches!(Device::load(only_rtx), Err(Error::Capabilities(_))));
    }

    #[tokio::test]
    async fn test_concurrent_loads_send_one_request() {
        let (client, mut server) = ChannelLink::pair();
        let channel = SignalingChannel::from_link(client, Duration::from_secs(5));
        let negotiator = CapabilityNegotiator::new();

        let responder = tokio::spawn(async move {
            let mut requests = 0;
            while let Some(envelope) = server.inbound.recv().await {
                if let Envelope::Event { id: Some(id), .. } = envelope {
                    requests += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    server
                        .outbound
                        .send(Envelope::ack(id, router_capabilities()))
                        .unwrap();
                }
            }
            requests
        });

        let (a, b) = tokio::join!(negotiator.load(&channel), negotiator.load(&channel));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(negotiator.requests_sent(), 1);

        // Already loaded: no further request.
        negotiator.load(&channel).await.unwrap();
        assert_eq!(negotiator.requests_sent(), 1);

        channel.close();
        drop(channel);
        assert_eq!(responder.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_no_device() {
        let (client, mut server) = ChannelLink::pair();
        let channel = SignalingChannel::from_link(client, Duration::from_secs(5));
        let negotiator = CapabilityNegotiator::new();

        tokio::spawn(async move {
            while let Some(Envelope::Event { id: Some(id), .. }) = server.inbound.recv().await {
                let _ = server.outbound.send(Envelope::ack(id, Value::Null));
            }
        });

        assert!(matches!(
            negotiator.load(&channel).await,
            Err(Error::Capabilities(_))
        ));
        assert!(!negotiator.is_loaded());
        assert!(negotiator.device().is_none());
    }
}

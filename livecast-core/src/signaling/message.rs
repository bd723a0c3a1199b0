//! Signaling wire envelope
//!
//! Every frame is a JSON object tagged by `type`. An event that carries an `id`
//! is a request; the server answers it with an `ack` frame carrying the same id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Correlation id of a request awaiting acknowledgment
pub type RequestId = u64;

/// Event names exchanged with the media server
pub mod events {
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const JOINED: &str = "joined";
    pub const RTP_STATS: &str = "rtpStats";
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
    },
    Ack {
        id: RequestId,
        #[serde(default)]
        data: Value,
    },
}

impl Envelope {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: event.into(),
            data,
            id: None,
        }
    }

    pub fn request(event: impl Into<String>, data: Value, id: RequestId) -> Self {
        Self::Event {
            event: event.into(),
            data,
            id: Some(id),
        }
    }

    #[must_use]
    pub const fn ack(id: RequestId, data: Value) -> Self {
        Self::Ack { id, data }
    }

    /// Event name, `None` for acknowledgments
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Event { event, .. } => Some(event),
            Self::Ack { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Treat `null`, `{}` and `""` as an absent reply.
#[must_use]
pub fn is_empty_reply(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Extract the `error` field of an acknowledgment, if the server reported one.
#[must_use]
pub fn reply_error(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let env = Envelope::request(events::PRODUCE, json!({"kind": "video"}), 7);
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "event", "event": "produce", "data": {"kind": "video"}, "id": 7})
        );
    }

    #[test]
    fn test_event_without_payload_omits_data() {
        let env = Envelope::event(events::JOIN_ROOM, Value::Null);
        assert_eq!(env.to_json().unwrap(), r#"{"type":"event","event":"joinRoom"}"#);
    }

    #[test]
    fn test_parse_ack_without_data() {
        let env = Envelope::from_json(r#"{"type":"ack","id":3}"#).unwrap();
        assert_eq!(env, Envelope::ack(3, Value::Null));
        assert_eq!(env.event_name(), None);
    }

    #[test]
    fn test_empty_reply_detection() {
        assert!(is_empty_reply(&Value::Null));
        assert!(is_empty_reply(&json!({})));
        assert!(!is_empty_reply(&json!({"codecs": []})));
    }

    #[test]
    fn test_reply_error() {
        assert_eq!(
            reply_error(&json!({"error": "dtls failure"})),
            Some("dtls failure".to_string())
        );
        assert_eq!(reply_error(&json!({"id": "p1"})), None);
        assert_eq!(reply_error(&json!({"error": null})), None);
        assert_eq!(reply_error(&Value::Null), None);
    }
}

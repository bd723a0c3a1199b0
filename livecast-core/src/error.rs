use std::time::Duration;

use thiserror::Error;

use crate::status::SessionStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Timed out after {after:?} waiting for '{event}' acknowledgment")]
    Timeout { event: String, after: Duration },

    #[error("Request cancelled: signaling channel released")]
    Cancelled,

    #[error("Session closed")]
    SessionClosed,

    #[error("RTP capabilities error: {0}")]
    Capabilities(String),

    #[error("Transport creation failed: {0}")]
    TransportCreation(String),

    #[error("Transport connection failed: {0}")]
    TransportConnection(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Roster error: {0}")]
    Roster(#[from] reqwest::Error),
}

impl Error {
    /// The failure status a negotiation step ends in when it fails with this error.
    ///
    /// Transport-level errors (timeouts, cancellation) carry no status of their own;
    /// the step that observed them decides.
    #[must_use]
    pub const fn failure_status(&self) -> Option<SessionStatus> {
        match self {
            Self::Capabilities(_) => Some(SessionStatus::CapabilitiesError),
            Self::TransportCreation(_) => Some(SessionStatus::TransportCreationFailed),
            Self::TransportConnection(_) => Some(SessionStatus::TransportConnectionFailed),
            Self::Produce(_) => Some(SessionStatus::ProduceFailed),
            Self::Stream(_) => Some(SessionStatus::StreamError),
            _ => None,
        }
    }

    /// Rebuild the error a step would report for `status`.
    ///
    /// Used to hand a finished attempt's failure to callers that waited on it.
    /// Statuses that are not failures map to `InvalidState`.
    #[must_use]
    pub fn from_failure(status: SessionStatus, reason: String) -> Self {
        match status {
            SessionStatus::CapabilitiesError => Self::Capabilities(reason),
            SessionStatus::TransportCreationFailed => Self::TransportCreation(reason),
            SessionStatus::TransportConnectionFailed => Self::TransportConnection(reason),
            SessionStatus::ProduceFailed => Self::Produce(reason),
            SessionStatus::StreamError => Self::Stream(reason),
            _ => Self::InvalidState(reason),
        }
    }

    /// Message without the step prefix; other errors keep their full message.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Capabilities(reason)
            | Self::TransportCreation(reason)
            | Self::TransportConnection(reason)
            | Self::Produce(reason)
            | Self::Stream(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Failure reported by the media capture collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("No capture device for {0}")]
    DeviceNotFound(String),

    #[error("Nothing requested: constraints disable both audio and video")]
    EmptyConstraints,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_status_mapping() {
        assert_eq!(
            Error::Capabilities("empty".into()).failure_status(),
            Some(SessionStatus::CapabilitiesError)
        );
        assert_eq!(
            Error::Produce("rejected".into()).failure_status(),
            Some(SessionStatus::ProduceFailed)
        );
        assert_eq!(Error::Cancelled.failure_status(), None);
    }

    #[test]
    fn test_from_failure_keeps_the_step() {
        let original = Error::TransportConnection("dtls rejected".into());
        let status = original.failure_status().unwrap();
        let rebuilt = Error::from_failure(status, original.detail());

        assert!(matches!(&rebuilt, Error::TransportConnection(r) if r == "dtls rejected"));
        assert_eq!(rebuilt.to_string(), original.to_string());
        assert!(matches!(
            Error::from_failure(SessionStatus::Live, "x".into()),
            Error::InvalidState(_)
        ));
    }

    #[test]
    fn test_detail_of_timeout_is_full_message() {
        let timeout = Error::Timeout {
            event: "produce".into(),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.detail(), timeout.to_string());
    }
}

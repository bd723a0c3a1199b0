//! Local media collaborators
//!
//! Capture and the transport machinery live outside the negotiation core. The
//! core only needs a borrowed [`MediaTrack`] and a [`TransportBackend`] that can
//! produce DTLS/RTP parameters; simulated implementations of both are provided
//! for the command-line client and the tests.

mod backend;
mod capture;

pub use backend::{BackendEvent, MediaTrackSummary, SimulatedBackend, TransportBackend};
pub use capture::{MediaCapture, MediaConstraints, SyntheticCapture};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::TrackId;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown media kind '{other}'")),
        }
    }
}

/// Handle to a captured track.
///
/// The capture side owns the track's lifetime; clones share the same ended
/// flag, so the negotiation core observes when the owner stops it.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: TrackId,
    kind: MediaKind,
    label: String,
    ended: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: TrackId::new(uuid::Uuid::new_v4().to_string()),
            kind,
            label: label.into(),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// End the track. Only the capture owner should call this.
    pub fn stop(&self) {
        self.ended.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_parsing() {
        assert_eq!("Video".parse::<MediaKind>().unwrap(), MediaKind::Video);
        assert_eq!("audio".parse::<MediaKind>().unwrap(), MediaKind::Audio);
        assert!("screen".parse::<MediaKind>().is_err());
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
    }

    #[test]
    fn test_stop_is_visible_through_clones() {
        let track = MediaTrack::new(MediaKind::Video, "camera");
        let borrowed = track.clone();
        assert!(!borrowed.is_ended());
        track.stop();
        assert!(borrowed.is_ended());
        assert_eq!(borrowed.id(), track.id());
    }
}

//! Media capture collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{MediaKind, MediaTrack};
use crate::error::CaptureError;

/// What the caller wants captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Kind of the track published: video when requested, otherwise audio.
    #[must_use]
    pub const fn primary_kind(&self) -> Option<MediaKind> {
        if self.video {
            Some(MediaKind::Video)
        } else if self.audio {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire the local track to publish. Permission prompts happen here.
    async fn acquire_local_track(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaTrack, CaptureError>;
}

/// Capture that hands out test-pattern tracks without touching hardware
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    permission_granted: bool,
    available: Vec<MediaKind>,
}

impl SyntheticCapture {
    #[must_use]
    pub fn new() -> Self {
        Self {
            permission_granted: true,
            available: vec![MediaKind::Audio, MediaKind::Video],
        }
    }

    #[must_use]
    pub fn with_permission(mut self, granted: bool) -> Self {
        self.permission_granted = granted;
        self
    }

    #[must_use]
    pub fn with_devices(mut self, available: Vec<MediaKind>) -> Self {
        self.available = available;
        self
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire_local_track(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaTrack, CaptureError> {
        let kind = constraints
            .primary_kind()
            .ok_or(CaptureError::EmptyConstraints)?;

        if !self.permission_granted {
            warn!(kind = %kind, "Capture permission denied");
            return Err(CaptureError::PermissionDenied(kind.to_string()));
        }
        if !self.available.contains(&kind) {
            return Err(CaptureError::DeviceNotFound(kind.to_string()));
        }

        let track = MediaTrack::new(kind, format!("synthetic-{kind}"));
        info!(track_id = %track.id(), kind = %kind, "Acquired synthetic track");
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefers_video_track() {
        let capture = SyntheticCapture::new();
        let track = capture
            .acquire_local_track(&MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(track.kind(), MediaKind::Video);
        assert!(!track.is_ended());
    }

    #[tokio::test]
    async fn test_audio_only() {
        let capture = SyntheticCapture::new();
        let constraints = MediaConstraints {
            audio: true,
            video: false,
        };
        let track = capture.acquire_local_track(&constraints).await.unwrap();
        assert_eq!(track.kind(), MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_capture_errors() {
        let denied = SyntheticCapture::new().with_permission(false);
        assert_eq!(
            denied
                .acquire_local_track(&MediaConstraints::default())
                .await
                .unwrap_err(),
            CaptureError::PermissionDenied("video".into())
        );

        let no_camera = SyntheticCapture::new().with_devices(vec![MediaKind::Audio]);
        assert!(matches!(
            no_camera
                .acquire_local_track(&MediaConstraints::default())
                .await,
            Err(CaptureError::DeviceNotFound(_))
        ));

        let nothing = MediaConstraints {
            audio: false,
            video: false,
        };
        assert_eq!(
            SyntheticCapture::new()
                .acquire_local_track(&nothing)
                .await
                .unwrap_err(),
            CaptureError::EmptyConstraints
        );
    }
}

//! Local media capture contract.

use async_trait::async_trait;

use huddle_common::{CallKind, Result};

use crate::stream::{FacingMode, MediaStream};

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<FacingMode>,
}

impl MediaConstraints {
    /// Microphone, plus the front camera for video calls.
    pub fn for_call(kind: CallKind) -> Self {
        Self {
            audio: true,
            video: kind.has_video().then_some(FacingMode::User),
        }
    }

    /// A single camera track, used when switching cameras.
    pub fn camera(facing: FacingMode) -> Self {
        Self {
            audio: false,
            video: Some(facing),
        }
    }
}

/// Platform device access (camera, microphone).
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire devices. On failure nothing stays acquired.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream>;

    /// Stop every track of `stream` and release its devices.
    fn release(&self, stream: &MediaStream) {
        stream.stop_all();
    }
}

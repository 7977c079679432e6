//! Local media: the platform capture API as seen by the call engine.

use crate::error::Result;
use crate::models::{CallType, MediaKind};
use async_trait::async_trait;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl From<CallType> for MediaConstraints {
    fn from(call_type: CallType) -> Self {
        Self {
            audio: true,
            video: call_type.wants_video(),
        }
    }
}

/// A captured local track. Exclusively owned by one call session.
pub trait MediaTrack: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn is_enabled(&self) -> bool;

    /// Mutes or unmutes in place. A disabled track keeps its device open but
    /// sends nothing.
    fn set_enabled(&self, enabled: bool);

    /// Releases the capture device. Stopping twice is harmless.
    fn stop(&self);

    fn is_live(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Platform media API. Fails with `MediaAccessDenied` when the user or the
/// platform refuses camera or microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Vec<Arc<dyn MediaTrack>>>;
}

//! Voice message recording.
//!
//! Encoded audio arrives in chunks from the platform recorder and is
//! collected into one blob per recording. Nothing is uploaded until the clip
//! is explicitly sent.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_VOICE_MIME: &str = "audio/webm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceClip {
    pub data: Bytes,
    pub mime_type: String,
    pub duration: Duration,
}

impl VoiceClip {
    pub fn file_name(&self) -> String {
        let ext = self
            .mime_type
            .split('/')
            .nth(1)
            .and_then(|s| s.split(';').next())
            .unwrap_or("bin");
        format!("voice-{}.{}", uuid::Uuid::new_v4(), ext)
    }
}

#[derive(Debug)]
enum RecorderState {
    Idle,
    Recording { started: Instant, buffer: BytesMut },
    Recorded(VoiceClip),
}

#[derive(Debug)]
pub struct VoiceRecorder {
    mime_type: String,
    state: RecorderState,
}

impl Default for VoiceRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_VOICE_MIME)
    }
}

impl VoiceRecorder {
    pub fn new(mime_type: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            state: RecorderState::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording { .. })
    }

    /// Starts a new recording, discarding an unsent clip.
    pub fn start(&mut self) -> Result<()> {
        if self.is_recording() {
            return Err(Error::InvalidState("already recording".to_string()));
        }
        self.state = RecorderState::Recording {
            started: Instant::now(),
            buffer: BytesMut::new(),
        };
        Ok(())
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.state {
            RecorderState::Recording { buffer, .. } => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            _ => Err(Error::InvalidState("not recording".to_string())),
        }
    }

    /// Finishes the recording. The clip stays available until sent or
    /// cancelled.
    pub fn stop(&mut self) -> Result<VoiceClip> {
        let (started, buffer) = match std::mem::replace(&mut self.state, RecorderState::Idle) {
            RecorderState::Recording { started, buffer } => (started, buffer),
            other => {
                self.state = other;
                return Err(Error::InvalidState("not recording".to_string()));
            }
        };
        if buffer.is_empty() {
            return Err(Error::InvalidMessage("recording is empty".to_string()));
        }

        let clip = VoiceClip {
            data: buffer.freeze(),
            mime_type: self.mime_type.clone(),
            duration: started.elapsed(),
        };
        self.state = RecorderState::Recorded(clip.clone());
        Ok(clip)
    }

    /// The finished clip, handed over for sending.
    pub fn take_clip(&mut self) -> Option<VoiceClip> {
        match std::mem::replace(&mut self.state, RecorderState::Idle) {
            RecorderState::Recorded(clip) => Some(clip),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Discards the recording or the unsent clip.
    pub fn cancel(&mut self) {
        self.state = RecorderState::Idle;
    }

    pub fn elapsed(&self) -> Duration {
        match &self.state {
            RecorderState::Idle => Duration::ZERO,
            RecorderState::Recording { started, .. } => started.elapsed(),
            RecorderState::Recorded(clip) => clip.duration,
        }
    }
}

//! Message threads: delivery, read state, typing, reactions, attachments and
//! message requests.

pub mod gate;
pub mod list;
pub mod sync;
pub mod typing;
pub mod voice;

pub use gate::MessageRequestGate;
pub use list::ThreadList;
pub use sync::{Attachment, ComposeBuffer, ThreadSync};
pub use typing::{TypingDebouncer, TypingTracker};
pub use voice::{VoiceClip, VoiceRecorder};

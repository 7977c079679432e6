//! Audio/video calls: per-session negotiation and the controller that owns
//! the active session.

pub mod controller;
pub mod engine;

pub use controller::CallController;
pub use engine::{CallContext, CallEngine, CallInputs, CallSnapshot};

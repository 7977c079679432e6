//! Message request gate: direct conversation or pending request.

use crate::api::DataService;
use crate::error::{Error, Result};
use crate::models::{MessageThread, RequestState};
use std::sync::Arc;

pub struct MessageRequestGate {
    user_id: String,
    data: Arc<dyn DataService>,
}

impl MessageRequestGate {
    pub fn new(user_id: &str, data: Arc<dyn DataService>) -> Self {
        Self {
            user_id: user_id.to_string(),
            data,
        }
    }

    /// Opens a thread with `target`. Mutual follows and friends get a direct
    /// thread, anyone else receives a message request. Blocked users cannot
    /// be messaged at all.
    pub async fn start_thread(&self, target: &str) -> Result<MessageThread> {
        if target == self.user_id {
            return Err(Error::InvalidState("cannot message yourself".to_string()));
        }

        let relationship = self.data.relationship(target).await?;
        if relationship.blocked {
            return Err(Error::RequestPolicyDenied(target.to_string()));
        }

        let is_request = !relationship.is_mutual();
        let thread = self.data.create_thread(target, is_request).await?;
        log::info!(
            "Started {} thread {} with {}",
            if is_request { "request" } else { "direct" },
            thread.id,
            target
        );
        Ok(thread)
    }

    /// Promotes a pending request to a regular thread. Returns false when
    /// the thread was not pending, in which case nothing changes.
    pub async fn accept(&self, thread: &mut MessageThread) -> Result<bool> {
        self.check_recipient(thread)?;
        if thread.request_state != RequestState::Pending {
            return Ok(false);
        }
        self.data.accept_request(&thread.id).await?;
        thread.is_request = false;
        thread.request_state = RequestState::Accepted;
        Ok(true)
    }

    /// Declines a pending request. The thread is hidden for good.
    pub async fn reject(&self, thread: &mut MessageThread) -> Result<bool> {
        self.check_recipient(thread)?;
        if thread.request_state != RequestState::Pending {
            return Ok(false);
        }
        self.data.reject_request(&thread.id).await?;
        thread.request_state = RequestState::Rejected;
        Ok(true)
    }

    fn check_recipient(&self, thread: &MessageThread) -> Result<()> {
        if thread.initiator_id == self.user_id || !thread.participant_ids.contains(&self.user_id) {
            return Err(Error::InvalidState(format!(
                "only the recipient can answer request {}",
                thread.id
            )));
        }
        Ok(())
    }
}

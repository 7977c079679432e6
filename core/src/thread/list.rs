//! Thread list: direct conversations and pending requests, newest first.

use crate::models::{Message, MessageThread, RequestState};
use std::collections::{HashMap, HashSet};

pub struct ThreadList {
    user_id: String,
    threads: HashMap<String, MessageThread>,
    recorded: HashSet<String>,
}

impl ThreadList {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            threads: HashMap::new(),
            recorded: HashSet::new(),
        }
    }

    pub fn upsert(&mut self, thread: MessageThread) {
        self.threads.insert(thread.id.clone(), thread);
    }

    pub fn get(&self, thread_id: &str) -> Option<&MessageThread> {
        self.threads.get(thread_id)
    }

    pub fn get_mut(&mut self, thread_id: &str) -> Option<&mut MessageThread> {
        self.threads.get_mut(thread_id)
    }

    /// Conversations shown in the inbox, including requests we sent.
    pub fn direct(&self) -> Vec<MessageThread> {
        self.sorted(|t| match t.request_state {
            RequestState::Direct | RequestState::Accepted => true,
            RequestState::Pending => t.initiator_id == self.user_id,
            RequestState::Rejected => false,
        })
    }

    /// Requests from other users waiting for our answer.
    pub fn pending(&self) -> Vec<MessageThread> {
        self.sorted(|t| t.is_pending() && t.initiator_id != self.user_id)
    }

    fn sorted(&self, keep: impl Fn(&MessageThread) -> bool) -> Vec<MessageThread> {
        let mut threads: Vec<MessageThread> =
            self.threads.values().filter(|t| keep(t)).cloned().collect();
        threads.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        threads
    }

    /// Updates the summary of the message's thread. Incoming messages count
    /// as unread unless the thread is open. Returns false for a message id
    /// that was already recorded.
    pub fn record_message(&mut self, message: &Message, is_open: bool) -> bool {
        let Some(thread) = self.threads.get_mut(&message.thread_id) else {
            return false;
        };
        if !self.recorded.insert(message.id.clone()) {
            return false;
        }
        thread.touch(message);
        if message.sender_id != self.user_id && !is_open && !message.read {
            thread.unread_count += 1;
        }
        true
    }

    pub fn has_recorded(&self, message_id: &str) -> bool {
        self.recorded.contains(message_id)
    }

    pub fn clear_unread(&mut self, thread_id: &str) {
        if let Some(thread) = self.threads.get_mut(thread_id) {
            thread.unread_count = 0;
        }
    }

    pub fn unread_total(&self) -> u32 {
        self.direct().iter().map(|t| t.unread_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::message;
    use chrono::{Duration, Utc};

    #[test]
    fn test_lists_are_separate_and_newest_first() {
        let mut list = ThreadList::new("me");
        list.upsert(MessageThread::new("old", "me", "a", false));
        list.upsert(MessageThread::new("new", "b", "me", false));
        list.upsert(MessageThread::new("req", "c", "me", true));
        list.upsert(MessageThread::new("sent", "me", "d", true));

        let now = Utc::now();
        list.record_message(&message("m1", "old", "a", "hi", now - Duration::hours(1)), false);
        list.record_message(&message("m2", "new", "b", "yo", now), false);
        list.record_message(&message("m3", "req", "c", "hey", now), false);

        let direct: Vec<String> = list.direct().into_iter().map(|t| t.id).collect();
        assert_eq!(direct, vec!["new", "old", "sent"]);
        let pending: Vec<String> = list.pending().into_iter().map(|t| t.id).collect();
        assert_eq!(pending, vec!["req"]);
        assert_eq!(list.get("new").unwrap().unread_count, 1);
        assert_eq!(list.unread_total(), 2);
    }

    #[test]
    fn test_rejected_threads_are_hidden() {
        let mut list = ThreadList::new("me");
        let mut thread = MessageThread::new("req", "c", "me", true);
        thread.request_state = RequestState::Rejected;
        list.upsert(thread);
        assert!(list.direct().is_empty());
        assert!(list.pending().is_empty());
    }

    #[test]
    fn test_open_thread_does_not_count_unread() {
        let mut list = ThreadList::new("me");
        list.upsert(MessageThread::new("t1", "me", "a", false));
        list.record_message(&message("m1", "t1", "a", "hi", Utc::now()), true);
        list.record_message(&message("m2", "t1", "me", "hello", Utc::now()), false);
        assert_eq!(list.get("t1").unwrap().unread_count, 0);
        assert_eq!(list.get("t1").unwrap().last_message.as_deref(), Some("hello"));
    }

    #[test]
    fn test_redelivered_message_counts_once() {
        let mut list = ThreadList::new("me");
        list.upsert(MessageThread::new("t1", "a", "me", false));
        let hi = message("m1", "t1", "a", "hi", Utc::now());

        assert!(list.record_message(&hi, false));
        assert!(!list.record_message(&hi, false));
        assert!(list.has_recorded("m1"));
        assert_eq!(list.get("t1").unwrap().unread_count, 1);
    }
}

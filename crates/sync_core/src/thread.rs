use shared::{
    domain::MessageId,
    protocol::{DeliveryState, Message},
};

/// Full ordered reply list for one open thread.
///
/// Fetched once when the thread opens, then kept current by incremental
/// merges keyed on reply id. Closing the view never touches the parent's
/// reply-count/last-reply fields, which stay under main-channel control.
#[derive(Debug, Clone)]
pub struct ThreadView {
    parent_id: MessageId,
    replies: Vec<Message>,
}

impl ThreadView {
    pub fn new(parent_id: MessageId, replies: Vec<Message>) -> Self {
        Self { parent_id, replies }
    }

    pub fn parent_id(&self) -> &MessageId {
        &self.parent_id
    }

    pub fn replies(&self) -> &[Message] {
        &self.replies
    }

    pub fn reply_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.replies
            .iter_mut()
            .find(|reply| &reply.message_id == message_id)
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.replies
            .iter()
            .any(|reply| &reply.message_id == message_id)
    }

    /// Merge one incoming reply idempotently: update in place on an id
    /// match, append otherwise. Replies of other parents are ignored.
    /// Returns whether the view changed.
    pub fn merge_reply(&mut self, reply: Message) -> bool {
        if reply.thread_parent_id.as_ref() != Some(&self.parent_id) {
            return false;
        }
        let mut reply = reply;
        reply.state = DeliveryState::Confirmed;

        if let Some(existing) = self.reply_mut(&reply.message_id) {
            *existing = reply;
        } else {
            self.replies.push(reply);
        }
        true
    }

    pub fn remove_reply(&mut self, message_id: &MessageId) -> bool {
        let before = self.replies.len();
        self.replies.retain(|reply| &reply.message_id != message_id);
        self.replies.len() != before
    }
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;

use chrono::Utc;
use shared::{
    domain::{Conversation, MessageId, UserId, UserIdentity},
    error::SyncError,
    protocol::{DeliveryState, LastReply, Message},
};
use tracing::debug;

/// How one incoming push event landed in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Server echo of a local optimistic send; the pending entry was
    /// promoted to the confirmed copy in place.
    PromotedPending,
    /// A message with the same server id already existed; fields were
    /// merged into it.
    Updated,
    /// The event was a reply to a known parent; the parent's thread
    /// metadata was bumped and the reply itself was not inserted.
    ThreadBumped { parent_id: MessageId },
    /// Appended as a new confirmed message at the end of the list.
    Appended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The message was removed from the visible list.
    Removed,
    /// A reply was deleted; the parent's reply count was decremented
    /// (saturating at zero) and the visible list is unchanged.
    ReplyCountDecremented { parent_id: MessageId },
    NotFound,
}

/// Ordered visible message list for one conversation context.
///
/// The list is ordered by arrival/creation order and never re-sorted on
/// merge; duplicate and out-of-order push events converge through id- and
/// content-based matching rather than sequence numbers.
#[derive(Debug, Clone)]
pub struct MessageLog {
    local_user: UserId,
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            messages: Vec::new(),
        }
    }

    /// Seed the log from a full fetch, e.g. on context switch.
    pub fn load(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.message_id == message_id)
    }

    pub fn get_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|m| &m.message_id == message_id)
    }

    /// Validate and optimistically insert a local send.
    ///
    /// The only operation that may insert before a round-trip completes.
    pub fn stage_send(
        &mut self,
        body: &str,
        conversation: &Conversation,
        identity: &UserIdentity,
    ) -> Result<Message, SyncError> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Validation(
                "message body must not be empty".to_owned(),
            ));
        }

        let message = Message {
            message_id: MessageId::temporary(),
            conversation: conversation.clone(),
            sender_id: identity.user_id.clone(),
            sender_username: Some(identity.display_name.clone()),
            body: trimmed.to_owned(),
            thread_parent_id: None,
            sent_at: Utc::now(),
            reactions: Vec::new(),
            reply_count: 0,
            last_reply: None,
            state: DeliveryState::Pending,
        };
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Replace the pending entry for `temp_id` with the confirmed payload
    /// from the persistence response.
    ///
    /// The push echo may have promoted the entry already (the event can
    /// outrun the HTTP response); then the confirmed copy merges by server
    /// id instead, so both arrival orders settle on one entry. The fallback
    /// never content-matches: another pending row with the same body must
    /// not be promoted by this server id.
    pub fn confirm_pending(&mut self, temp_id: &MessageId, confirmed: Message) {
        let mut confirmed = confirmed;
        confirmed.state = DeliveryState::Confirmed;
        if let Some(existing) = self.get_mut(temp_id) {
            *existing = confirmed;
            return;
        }
        debug!(temp_id = %temp_id, "pending entry already promoted by push echo");
        if let Some(existing) = self.get_mut(&confirmed.message_id) {
            *existing = confirmed;
            return;
        }
        self.messages.push(confirmed);
    }

    /// Remove a pending entry after a failed send. Never leaves a dangling
    /// pending row.
    pub fn rollback_pending(&mut self, temp_id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages
            .retain(|m| !(m.is_pending() && &m.message_id == temp_id));
        self.messages.len() != before
    }

    /// Idempotent entry point for all push-delivered message events.
    ///
    /// Matching precedence, evaluated in order:
    /// 1. pending entry from the local sender with matching content:
    ///    treat as the server echo and promote it;
    /// 2. existing entry with the same server id: merge fields in place;
    /// 3. reply to a known parent: bump the parent's thread metadata only;
    /// 4. otherwise append as a new confirmed message.
    pub fn merge_incoming(&mut self, incoming: Message) -> MergeOutcome {
        let mut incoming = incoming;
        incoming.state = DeliveryState::Confirmed;

        if incoming.sender_id == self.local_user {
            let echo = self.messages.iter_mut().find(|m| {
                m.is_pending() && m.sender_id == incoming.sender_id && m.body == incoming.body
            });
            if let Some(pending) = echo {
                *pending = incoming;
                return MergeOutcome::PromotedPending;
            }
        }

        if let Some(existing) = self.get_mut(&incoming.message_id) {
            existing.body = incoming.body;
            existing.reactions = incoming.reactions;
            existing.reply_count = incoming.reply_count;
            existing.last_reply = incoming.last_reply;
            existing.state = DeliveryState::Confirmed;
            return MergeOutcome::Updated;
        }

        if let Some(parent_id) = incoming.thread_parent_id.clone() {
            if let Some(parent) = self.get_mut(&parent_id) {
                parent.reply_count += 1;
                parent.last_reply = Some(incoming.as_last_reply());
                return MergeOutcome::ThreadBumped { parent_id };
            }
        }

        self.messages.push(incoming);
        MergeOutcome::Appended
    }

    /// Remove a message by id, or account for a reply deletion.
    ///
    /// `thread_parent_id` is set when the deleted message was a reply; the
    /// parent then keeps its place and only its reply count shrinks, never
    /// below zero.
    pub fn remove(
        &mut self,
        message_id: &MessageId,
        thread_parent_id: Option<&MessageId>,
    ) -> RemoveOutcome {
        if let Some(parent_id) = thread_parent_id {
            let Some(parent) = self.get_mut(parent_id) else {
                return RemoveOutcome::NotFound;
            };
            parent.reply_count = parent.reply_count.saturating_sub(1);
            return RemoveOutcome::ReplyCountDecremented {
                parent_id: parent_id.clone(),
            };
        }

        let Some(index) = self
            .messages
            .iter()
            .position(|m| &m.message_id == message_id)
        else {
            return RemoveOutcome::NotFound;
        };
        self.messages.remove(index);
        RemoveOutcome::Removed
    }

    /// Apply an authoritative thread-metadata update to a parent message.
    pub fn set_thread_meta(
        &mut self,
        parent_id: &MessageId,
        reply_count: u32,
        last_reply: Option<LastReply>,
    ) -> bool {
        let Some(parent) = self.get_mut(parent_id) else {
            return false;
        };
        parent.reply_count = reply_count;
        parent.last_reply = last_reply;
        true
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;

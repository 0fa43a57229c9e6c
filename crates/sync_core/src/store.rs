use async_trait::async_trait;
use shared::{
    domain::{Conversation, MessageId},
    error::SyncError,
    protocol::{Message, Reaction},
};

/// Persistence seam: the server of record.
///
/// Returned objects carry server-assigned identifiers and timestamps.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(
        &self,
        body: &str,
        conversation: &Conversation,
    ) -> Result<Message, SyncError>;

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), SyncError>;

    async fn create_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<Reaction, SyncError>;

    async fn delete_reaction(&self, reaction: &Reaction) -> Result<(), SyncError>;

    async fn list_messages(&self, conversation: &Conversation) -> Result<Vec<Message>, SyncError>;

    async fn list_replies(&self, parent_id: &MessageId) -> Result<Vec<Message>, SyncError>;
}

pub struct NullStore;

impl NullStore {
    fn unavailable() -> SyncError {
        SyncError::Network("message store unavailable".to_owned())
    }
}

#[async_trait]
impl MessageStore for NullStore {
    async fn create_message(
        &self,
        _body: &str,
        _conversation: &Conversation,
    ) -> Result<Message, SyncError> {
        Err(Self::unavailable())
    }

    async fn delete_message(&self, _message_id: &MessageId) -> Result<(), SyncError> {
        Err(Self::unavailable())
    }

    async fn create_reaction(
        &self,
        _message_id: &MessageId,
        _emoji: &str,
    ) -> Result<Reaction, SyncError> {
        Err(Self::unavailable())
    }

    async fn delete_reaction(&self, _reaction: &Reaction) -> Result<(), SyncError> {
        Err(Self::unavailable())
    }

    async fn list_messages(&self, _conversation: &Conversation) -> Result<Vec<Message>, SyncError> {
        Err(Self::unavailable())
    }

    async fn list_replies(&self, _parent_id: &MessageId) -> Result<Vec<Message>, SyncError> {
        Err(Self::unavailable())
    }
}

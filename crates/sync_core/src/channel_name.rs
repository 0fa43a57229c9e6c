use shared::domain::{Conversation, MessageId};

/// Canonical string identifying a pub/sub topic for one concern.
///
/// Both ends of a direct conversation derive the same name because the
/// participant pair is already canonicalized by sorted identity order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn for_conversation(conversation: &Conversation) -> Self {
        match conversation {
            Conversation::Channel { channel_id } => Self(format!("chat.channel.{channel_id}")),
            Conversation::Direct { low, high } => Self(format!("chat.direct.{low}.{high}")),
        }
    }

    pub fn for_thread(parent_id: &MessageId) -> Self {
        Self(format!("chat.thread.{parent_id}"))
    }

    pub fn for_typing(conversation: &Conversation) -> Self {
        Self(format!("typing.{}", Self::for_conversation(conversation).0))
    }

    /// Well-known membership channel shared by every signed-in client.
    pub fn presence() -> Self {
        Self("chat.presence".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[path = "tests/channel_name_tests.rs"]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Conversation, MessageId, ReactionId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Client-only optimistic entry with a temporary id.
    Pending,
    /// Carries a server-issued id and timestamp.
    Confirmed,
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Absent during the optimistic window before the server assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_id: Option<ReactionId>,
    pub message_id: MessageId,
    pub emoji: String,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Preview of the newest reply shown on a thread parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastReply {
    pub sender_name: String,
    pub preview: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation: Conversation,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_parent_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reply: Option<LastReply>,
    #[serde(default)]
    pub state: DeliveryState,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }

    /// Last-reply preview derived from this message when it lands as a reply.
    pub fn as_last_reply(&self) -> LastReply {
        LastReply {
            sender_name: self
                .sender_username
                .clone()
                .unwrap_or_else(|| self.sender_id.0.clone()),
            preview: self.body.clone(),
            sent_at: self.sent_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: String,
}

/// Closed set of push-delivered event shapes, decoded at the transport
/// boundary so downstream merge logic switches over known variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage {
        message: Message,
    },
    MessageDeleted {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_parent_id: Option<MessageId>,
    },
    ReactionAdded {
        reaction: Reaction,
    },
    ReactionRemoved {
        reaction: Reaction,
    },
    ThreadUpdated {
        parent_id: MessageId,
        reply_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_reply: Option<LastReply>,
    },
    Typing {
        user_id: UserId,
        display_name: String,
    },
    StopTyping {
        user_id: UserId,
        display_name: String,
    },
    MembershipSnapshot {
        members: Vec<Member>,
    },
    MemberAdded {
        member: Member,
    },
    MemberRemoved {
        member: Member,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushEventKind {
    NewMessage,
    MessageDeleted,
    ReactionAdded,
    ReactionRemoved,
    ThreadUpdated,
    Typing,
    StopTyping,
    MembershipSnapshot,
    MemberAdded,
    MemberRemoved,
    Error,
}

impl PushEvent {
    pub fn kind(&self) -> PushEventKind {
        match self {
            Self::NewMessage { .. } => PushEventKind::NewMessage,
            Self::MessageDeleted { .. } => PushEventKind::MessageDeleted,
            Self::ReactionAdded { .. } => PushEventKind::ReactionAdded,
            Self::ReactionRemoved { .. } => PushEventKind::ReactionRemoved,
            Self::ThreadUpdated { .. } => PushEventKind::ThreadUpdated,
            Self::Typing { .. } => PushEventKind::Typing,
            Self::StopTyping { .. } => PushEventKind::StopTyping,
            Self::MembershipSnapshot { .. } => PushEventKind::MembershipSnapshot,
            Self::MemberAdded { .. } => PushEventKind::MemberAdded,
            Self::MemberRemoved { .. } => PushEventKind::MemberRemoved,
            Self::Error(_) => PushEventKind::Error,
        }
    }
}

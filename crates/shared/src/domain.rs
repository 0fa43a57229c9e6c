use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(ReactionId);

const TEMPORARY_ID_PREFIX: &str = "temp-";

impl MessageId {
    /// Synthesize a client-local id for a message that has not yet been
    /// confirmed by the server.
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }
}

/// Authenticated local identity supplied by the session provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

/// The unit of message grouping: a shared channel or a direct user pair.
///
/// Direct pairs are canonicalized by sorted identity order so both
/// participants derive the same logical channel name independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversation {
    Channel { channel_id: ChannelId },
    Direct { low: UserId, high: UserId },
}

impl Conversation {
    pub fn channel(channel_id: ChannelId) -> Self {
        Self::Channel { channel_id }
    }

    pub fn direct(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self::Direct { low: a, high: b }
        } else {
            Self::Direct { low: b, high: a }
        }
    }
}

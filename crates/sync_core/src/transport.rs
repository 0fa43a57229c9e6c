use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::protocol::PushEvent;
use tokio::sync::broadcast;
use tracing::warn;

use crate::channel_name::ChannelName;

/// Broker seam: named event streams on named logical channels.
///
/// Delivery is at-most-once with in-order delivery per channel and no
/// ordering guarantee across channels. Errors at this boundary are
/// best-effort for callers: subscribe/unsubscribe failures are logged and
/// swallowed, never treated as fatal.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn subscribe(&self, name: &ChannelName) -> Result<broadcast::Receiver<String>>;
    async fn unsubscribe(&self, name: &ChannelName) -> Result<()>;
    async fn publish(&self, name: &ChannelName, event: &PushEvent) -> Result<()>;
}

pub struct NullTransport;

#[async_trait]
impl EventTransport for NullTransport {
    async fn subscribe(&self, name: &ChannelName) -> Result<broadcast::Receiver<String>> {
        Err(anyhow!("event transport unavailable for channel {name}"))
    }

    async fn unsubscribe(&self, name: &ChannelName) -> Result<()> {
        Err(anyhow!("event transport unavailable for channel {name}"))
    }

    async fn publish(&self, name: &ChannelName, _event: &PushEvent) -> Result<()> {
        Err(anyhow!("event transport unavailable for channel {name}"))
    }
}

/// Decode one wire payload into a known event shape.
///
/// A malformed payload is dropped, not surfaced: a missed event is
/// recoverable by the next full refetch on context switch.
pub fn decode_push_event(channel: &ChannelName, raw: &str) -> Option<PushEvent> {
    match serde_json::from_str::<PushEvent>(raw) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(channel = %channel, "dropping malformed push event: {err}");
            None
        }
    }
}

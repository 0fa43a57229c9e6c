use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::protocol::{PushEvent, PushEventKind};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    channel_name::ChannelName,
    transport::{decode_push_event, EventTransport},
};

/// One decoded event routed off a live subscription.
#[derive(Debug)]
pub struct RoutedEvent {
    pub channel: ChannelName,
    pub event: PushEvent,
}

pub type EventRoute = mpsc::Sender<RoutedEvent>;

struct SubscriptionRecord {
    pump: JoinHandle<()>,
}

/// Single-owner table of live transport subscriptions.
///
/// Replace semantics: at most one live record per logical channel name at
/// any instant. A new subscribe to an already-bound name tears the old
/// record down first; it is never ref-counted.
pub struct SubscriptionRegistry {
    transport: Arc<dyn EventTransport>,
    records: Mutex<HashMap<ChannelName, SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            transport,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Open a transport subscription for `name` and pump events of the
    /// bound kinds into `route`.
    ///
    /// Transport failures are logged and swallowed; the registry simply
    /// ends up with no record for `name`, and a later subscribe retries.
    pub async fn subscribe(
        &self,
        name: ChannelName,
        kinds: HashSet<PushEventKind>,
        route: EventRoute,
    ) {
        self.unsubscribe(&name).await;

        let receiver = match self.transport.subscribe(&name).await {
            Ok(receiver) => receiver,
            Err(err) => {
                warn!(channel = %name, "transport subscribe failed: {err}");
                return;
            }
        };

        let pump = tokio::spawn(pump_events(name.clone(), receiver, kinds, route));
        let previous = self
            .records
            .lock()
            .await
            .insert(name, SubscriptionRecord { pump });
        if let Some(record) = previous {
            record.pump.abort();
        }
    }

    /// Unbind and close the subscription for `name`; no-op on unknown names.
    ///
    /// A failed transport unsubscribe must not prevent a subsequent
    /// subscribe to the same name, so the record is dropped regardless.
    pub async fn unsubscribe(&self, name: &ChannelName) {
        let record = self.records.lock().await.remove(name);
        let Some(record) = record else {
            return;
        };
        record.pump.abort();
        if let Err(err) = self.transport.unsubscribe(name).await {
            warn!(channel = %name, "transport unsubscribe failed: {err}");
        }
    }

    /// Release every remaining record. Called on session teardown.
    pub async fn shutdown(&self) {
        let names: Vec<ChannelName> = self.records.lock().await.keys().cloned().collect();
        for name in names {
            self.unsubscribe(&name).await;
        }
    }

    pub async fn is_subscribed(&self, name: &ChannelName) -> bool {
        self.records.lock().await.contains_key(name)
    }

    pub async fn active_channels(&self) -> Vec<ChannelName> {
        self.records.lock().await.keys().cloned().collect()
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        for record in self.records.get_mut().values() {
            record.pump.abort();
        }
    }
}

async fn pump_events(
    channel: ChannelName,
    mut receiver: broadcast::Receiver<String>,
    kinds: HashSet<PushEventKind>,
    route: EventRoute,
) {
    loop {
        let raw = match receiver.recv().await {
            Ok(raw) => raw,
            // At-most-once delivery: dropped events are recovered by the
            // next full refetch, not replayed here.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(channel = %channel, skipped, "subscription lagged; events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(event) = decode_push_event(&channel, &raw) else {
            continue;
        };
        if !kinds.contains(&event.kind()) {
            continue;
        }
        let routed = RoutedEvent {
            channel: channel.clone(),
            event,
        };
        if route.send(routed).await.is_err() {
            break;
        }
    }
}

pub fn conversation_kinds() -> HashSet<PushEventKind> {
    HashSet::from([
        PushEventKind::NewMessage,
        PushEventKind::MessageDeleted,
        PushEventKind::ReactionAdded,
        PushEventKind::ReactionRemoved,
        PushEventKind::ThreadUpdated,
    ])
}

pub fn thread_kinds() -> HashSet<PushEventKind> {
    HashSet::from([
        PushEventKind::NewMessage,
        PushEventKind::MessageDeleted,
        PushEventKind::ReactionAdded,
        PushEventKind::ReactionRemoved,
    ])
}

pub fn typing_kinds() -> HashSet<PushEventKind> {
    HashSet::from([PushEventKind::Typing, PushEventKind::StopTyping])
}

pub fn presence_kinds() -> HashSet<PushEventKind> {
    HashSet::from([
        PushEventKind::MembershipSnapshot,
        PushEventKind::MemberAdded,
        PushEventKind::MemberRemoved,
    ])
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;

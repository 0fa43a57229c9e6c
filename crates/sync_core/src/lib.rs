use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use shared::{
    domain::{Conversation, MessageId, UserId, UserIdentity},
    error::SyncError,
    protocol::{Message, PushEvent, Reaction},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod channel_name;
pub mod presence;
pub mod reactions;
pub mod reconcile;
pub mod store;
pub mod subscription;
pub mod thread;
pub mod transport;
pub mod typing;

use channel_name::ChannelName;
use presence::PresenceSet;
use reactions::ReactionDelta;
use reconcile::{MessageLog, RemoveOutcome};
use store::{MessageStore, NullStore};
use subscription::{
    conversation_kinds, presence_kinds, thread_kinds, typing_kinds, RoutedEvent,
    SubscriptionRegistry,
};
use thread::ThreadView;
use transport::{EventTransport, NullTransport};
use typing::{TypingCoordinator, TypingSet};

const SESSION_EVENT_CAPACITY: usize = 1024;
const ROUTED_EVENT_CAPACITY: usize = 256;

/// Notifications pushed to the presentation layer. Snapshots are cloned so
/// the UI never holds a reference into session state.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConversationRefreshed {
        conversation: Conversation,
        messages: Vec<Message>,
    },
    MessageListChanged {
        messages: Vec<Message>,
    },
    PresenceChanged {
        online: Vec<UserId>,
    },
    TypingChanged {
        names: Vec<String>,
    },
    ThreadChanged {
        parent_id: MessageId,
        replies: Vec<Message>,
    },
    ThreadClosed {
        parent_id: MessageId,
    },
    Error(String),
}

struct ActiveConversation {
    conversation: Conversation,
    log: MessageLog,
}

#[derive(Default)]
struct SessionState {
    identity: Option<UserIdentity>,
    /// Bumped on every context switch; a fetch that resolves under an older
    /// epoch is discarded instead of overwriting the new context's state.
    epoch: u64,
    active: Option<ActiveConversation>,
    presence: PresenceSet,
    typing: TypingSet,
    thread: Option<ThreadView>,
    /// Ids whose deletion was applied locally; suppresses the push echo so
    /// a reply deletion cannot decrement the parent count twice.
    recently_deleted: HashSet<MessageId>,
}

impl SessionState {
    fn find_message(&self, message_id: &MessageId) -> Option<&Message> {
        if let Some(active) = &self.active {
            if let Some(message) = active.log.get(message_id) {
                return Some(message);
            }
        }
        self.thread
            .as_ref()
            .and_then(|thread| thread.replies().iter().find(|r| &r.message_id == message_id))
    }

    /// Apply a reaction delta wherever the owning message lives (main list
    /// or open thread view). Returns (log changed, thread changed).
    fn apply_reaction_delta(&mut self, delta: &ReactionDelta) -> (bool, bool) {
        let target_id = match delta {
            ReactionDelta::Add(reaction) | ReactionDelta::Remove(reaction) => {
                reaction.message_id.clone()
            }
        };
        let mut log_changed = false;
        let mut thread_changed = false;
        if let Some(active) = self.active.as_mut() {
            if let Some(message) = active.log.get_mut(&target_id) {
                log_changed = reactions::apply_delta(message, delta);
            }
        }
        if let Some(thread) = self.thread.as_mut() {
            if let Some(reply) = thread.reply_mut(&target_id) {
                thread_changed = reactions::apply_delta(reply, delta);
            }
        }
        (log_changed, thread_changed)
    }
}

/// Client-side synchronization core for one conversation-view session.
///
/// Owns the visible message list, presence set and typing set, applies
/// writes optimistically, and reconciles push events into the same state
/// the optimistic path writes to. All mutation entry points run to
/// completion under one lock, so no two merges interleave mid-update.
pub struct ChatSession {
    store: Arc<dyn MessageStore>,
    registry: SubscriptionRegistry,
    typing_coordinator: TypingCoordinator,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    route_tx: mpsc::Sender<RoutedEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(store: Arc<dyn MessageStore>, transport: Arc<dyn EventTransport>) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (route_tx, route_rx) = mpsc::channel(ROUTED_EVENT_CAPACITY);

        let session = Arc::new(Self {
            store,
            registry: SubscriptionRegistry::new(Arc::clone(&transport)),
            typing_coordinator: TypingCoordinator::new(transport),
            inner: Mutex::new(SessionState::default()),
            events,
            route_tx,
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(route_loop(Arc::downgrade(&session), route_rx));
        if let Ok(mut slot) = session.pump.try_lock() {
            *slot = Some(pump);
        }
        session
    }

    /// Session with no collaborators wired yet: every store round-trip
    /// fails and every subscription attempt is logged and dropped. Lets
    /// the presentation layer construct its state before connecting.
    pub fn disconnected() -> Arc<Self> {
        Self::new(Arc::new(NullStore), Arc::new(NullTransport))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Record the authenticated local identity and join the well-known
    /// presence channel.
    pub async fn sign_in(&self, identity: UserIdentity) {
        {
            let mut guard = self.inner.lock().await;
            guard.identity = Some(identity);
        }
        self.subscribe_presence().await;
    }

    /// Presence without an identity is meaningless; the subscribe is
    /// skipped entirely rather than attempted.
    pub async fn subscribe_presence(&self) {
        let signed_in = self.inner.lock().await.identity.is_some();
        if !signed_in {
            warn!("presence subscription skipped: no authenticated identity");
            return;
        }
        self.registry
            .subscribe(
                ChannelName::presence(),
                presence_kinds(),
                self.route_tx.clone(),
            )
            .await;
    }

    /// Leave the old conversation, reset state, fetch the new one and
    /// subscribe to its channels.
    ///
    /// The refetch doubles as the eventual-consistency backstop for any
    /// push event missed while away.
    pub async fn switch_context(&self, conversation: Conversation) -> Result<(), SyncError> {
        let (identity, epoch, old_names) = {
            let mut guard = self.inner.lock().await;
            let identity = guard
                .identity
                .clone()
                .ok_or_else(|| SyncError::Validation("no authenticated identity".to_owned()))?;

            guard.epoch += 1;
            let mut old_names = Vec::new();
            if let Some(active) = guard.active.take() {
                old_names.push(ChannelName::for_conversation(&active.conversation));
                old_names.push(ChannelName::for_typing(&active.conversation));
            }
            if let Some(thread) = guard.thread.take() {
                old_names.push(ChannelName::for_thread(thread.parent_id()));
            }
            guard.typing.clear();
            guard.recently_deleted.clear();
            (identity, guard.epoch, old_names)
        };

        self.typing_coordinator.cancel().await;
        for name in old_names {
            self.registry.unsubscribe(&name).await;
        }

        let messages = self.store.list_messages(&conversation).await?;

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            debug!("discarding fetch result for superseded conversation context");
            return Ok(());
        }

        let mut log = MessageLog::new(identity.user_id);
        log.load(messages);
        guard.active = Some(ActiveConversation {
            conversation: conversation.clone(),
            log,
        });

        // Subscribe while still holding the state lock so a concurrent
        // switch cannot observe the new subscriptions before the new state.
        self.registry
            .subscribe(
                ChannelName::for_conversation(&conversation),
                conversation_kinds(),
                self.route_tx.clone(),
            )
            .await;
        self.registry
            .subscribe(
                ChannelName::for_typing(&conversation),
                typing_kinds(),
                self.route_tx.clone(),
            )
            .await;

        info!(conversation = ?conversation, "conversation context switched");
        let messages = guard
            .active
            .as_ref()
            .map(|active| active.log.messages().to_vec())
            .unwrap_or_default();
        self.emit(SessionEvent::ConversationRefreshed {
            conversation,
            messages,
        });
        Ok(())
    }

    /// Optimistically insert the message, then persist it.
    ///
    /// On success the pending entry is replaced by the confirmed payload;
    /// on failure it is removed entirely, never left dangling.
    pub async fn send(&self, body: &str) -> Result<Message, SyncError> {
        let (temp_id, conversation) = {
            let mut guard = self.inner.lock().await;
            let identity = guard
                .identity
                .clone()
                .ok_or_else(|| SyncError::Validation("no authenticated identity".to_owned()))?;
            let active = guard
                .active
                .as_mut()
                .ok_or_else(|| SyncError::Validation("no conversation selected".to_owned()))?;
            let conversation = active.conversation.clone();
            let pending = active.log.stage_send(body, &conversation, &identity)?;
            let messages = active.log.messages().to_vec();
            self.emit(SessionEvent::MessageListChanged { messages });
            (pending.message_id, conversation)
        };

        match self.store.create_message(body.trim(), &conversation).await {
            Ok(confirmed) => {
                let mut guard = self.inner.lock().await;
                if let Some(active) = guard.active.as_mut() {
                    if active.conversation == conversation {
                        active.log.confirm_pending(&temp_id, confirmed.clone());
                        let messages = active.log.messages().to_vec();
                        self.emit(SessionEvent::MessageListChanged { messages });
                    }
                }
                Ok(confirmed)
            }
            Err(err) => {
                let mut guard = self.inner.lock().await;
                if let Some(active) = guard.active.as_mut() {
                    if active.conversation == conversation && active.log.rollback_pending(&temp_id)
                    {
                        let messages = active.log.messages().to_vec();
                        self.emit(SessionEvent::MessageListChanged { messages });
                    }
                }
                self.emit(SessionEvent::Error(format!("send failed: {err}")));
                Err(err)
            }
        }
    }

    /// Delete a message on the server, then mirror the removal locally.
    ///
    /// No optimistic delete exists, so a `Forbidden` response leaves state
    /// untouched.
    pub async fn delete(&self, message_id: &MessageId) -> Result<(), SyncError> {
        self.store.delete_message(message_id).await?;

        let mut guard = self.inner.lock().await;

        let reply_parent = guard.thread.as_ref().and_then(|thread| {
            thread
                .contains(message_id)
                .then(|| thread.parent_id().clone())
        });

        if let Some(parent_id) = reply_parent {
            guard.recently_deleted.insert(message_id.clone());
            if let Some(thread) = guard.thread.as_mut() {
                thread.remove_reply(message_id);
            }
            if let Some(active) = guard.active.as_mut() {
                active.log.remove(message_id, Some(&parent_id));
            }
            self.emit_thread_snapshot(&guard);
            self.emit_message_snapshot(&guard);
            return Ok(());
        }

        let removed = guard
            .active
            .as_mut()
            .is_some_and(|active| active.log.remove(message_id, None) == RemoveOutcome::Removed);
        if removed {
            // Suppress the push echo only when a local removal was applied;
            // a reply deleted without its thread open leaves the echo to
            // decrement the parent's reply count.
            guard.recently_deleted.insert(message_id.clone());
            self.close_thread_if_parent(&mut guard, message_id).await;
            self.emit_message_snapshot(&guard);
        }
        Ok(())
    }

    /// Toggle policy: an emoji the local user already used on this message
    /// is removed; one not yet used is added. Never both in one call.
    pub async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), SyncError> {
        let (identity, existing) = {
            let guard = self.inner.lock().await;
            let identity = guard
                .identity
                .clone()
                .ok_or_else(|| SyncError::Validation("no authenticated identity".to_owned()))?;
            let message = guard
                .find_message(message_id)
                .ok_or_else(|| SyncError::NotFound(format!("message {message_id} not found")))?;
            let existing = reactions::find_local(message, &identity.user_id, emoji).cloned();
            (identity, existing)
        };

        if let Some(reaction) = existing {
            self.store.delete_reaction(&reaction).await?;
            let mut guard = self.inner.lock().await;
            let changed = guard.apply_reaction_delta(&ReactionDelta::Remove(reaction));
            self.emit_after_reaction(&guard, changed);
            return Ok(());
        }

        let optimistic = Reaction {
            reaction_id: None,
            message_id: message_id.clone(),
            emoji: emoji.to_owned(),
            user_id: identity.user_id.clone(),
            username: Some(identity.display_name.clone()),
        };
        {
            let mut guard = self.inner.lock().await;
            let changed = guard.apply_reaction_delta(&ReactionDelta::Add(optimistic.clone()));
            self.emit_after_reaction(&guard, changed);
        }

        match self.store.create_reaction(message_id, emoji).await {
            Ok(confirmed) => {
                let mut guard = self.inner.lock().await;
                // Dedupes against the optimistic record and adopts the
                // server-assigned id.
                let changed = guard.apply_reaction_delta(&ReactionDelta::Add(confirmed));
                self.emit_after_reaction(&guard, changed);
                Ok(())
            }
            Err(err) => {
                let mut guard = self.inner.lock().await;
                let changed = guard.apply_reaction_delta(&ReactionDelta::Remove(optimistic));
                self.emit_after_reaction(&guard, changed);
                self.emit(SessionEvent::Error(format!("reaction failed: {err}")));
                Err(err)
            }
        }
    }

    /// Signal that the local user is typing in the active conversation.
    pub async fn notify_typing(&self) -> Result<(), SyncError> {
        let (conversation, identity) = {
            let guard = self.inner.lock().await;
            let identity = guard
                .identity
                .clone()
                .ok_or_else(|| SyncError::Validation("no authenticated identity".to_owned()))?;
            let conversation = guard
                .active
                .as_ref()
                .map(|active| active.conversation.clone())
                .ok_or_else(|| SyncError::Validation("no conversation selected".to_owned()))?;
            (conversation, identity)
        };
        self.typing_coordinator
            .notify_typing(&conversation, &identity)
            .await;
        Ok(())
    }

    /// Open a thread on a parent message: fetch the full reply list once,
    /// then subscribe to the thread channel for incremental updates.
    pub async fn open_thread(&self, parent_id: &MessageId) -> Result<(), SyncError> {
        let (epoch, previous_thread) = {
            let mut guard = self.inner.lock().await;
            let active = guard
                .active
                .as_ref()
                .ok_or_else(|| SyncError::Validation("no conversation selected".to_owned()))?;
            if active.log.get(parent_id).is_none() {
                return Err(SyncError::NotFound(format!(
                    "thread parent {parent_id} not found"
                )));
            }
            let previous = guard.thread.take().map(|t| t.parent_id().clone());
            (guard.epoch, previous)
        };

        if let Some(previous_id) = previous_thread {
            self.registry
                .unsubscribe(&ChannelName::for_thread(&previous_id))
                .await;
        }

        let replies = self.store.list_replies(parent_id).await?;

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            debug!("discarding reply fetch for superseded conversation context");
            return Ok(());
        }
        guard.thread = Some(ThreadView::new(parent_id.clone(), replies));
        self.registry
            .subscribe(
                ChannelName::for_thread(parent_id),
                thread_kinds(),
                self.route_tx.clone(),
            )
            .await;
        self.emit_thread_snapshot(&guard);
        Ok(())
    }

    /// Close the thread view. The parent's reply-count/last-reply fields
    /// keep updating from the main conversation channel.
    pub async fn close_thread(&self) {
        let parent_id = {
            let mut guard = self.inner.lock().await;
            guard.thread.take().map(|t| t.parent_id().clone())
        };
        if let Some(parent_id) = parent_id {
            self.registry
                .unsubscribe(&ChannelName::for_thread(&parent_id))
                .await;
            self.emit(SessionEvent::ThreadClosed { parent_id });
        }
    }

    /// Release every live subscription and stop the event pump.
    pub async fn shutdown(&self) {
        self.typing_coordinator.cancel().await;
        self.registry.shutdown().await;
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
    }

    pub async fn current_conversation(&self) -> Option<Conversation> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.conversation.clone())
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.log.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn presence(&self) -> Vec<UserId> {
        self.inner.lock().await.presence.snapshot()
    }

    pub async fn typing_names(&self) -> Vec<String> {
        self.inner.lock().await.typing.names()
    }

    pub async fn thread_replies(&self) -> Option<(MessageId, Vec<Message>)> {
        self.inner
            .lock()
            .await
            .thread
            .as_ref()
            .map(|thread| (thread.parent_id().clone(), thread.replies().to_vec()))
    }

    async fn handle_push(&self, routed: RoutedEvent) {
        let RoutedEvent { channel, event } = routed;
        let mut guard = self.inner.lock().await;

        if let PushEvent::Error(api_error) = &event {
            warn!(
                channel = %channel,
                code = ?api_error.code,
                "push-path error event dropped: {}",
                api_error.message
            );
            return;
        }

        if channel == ChannelName::presence() {
            if guard.presence.apply(&event) {
                let online = guard.presence.snapshot();
                self.emit(SessionEvent::PresenceChanged { online });
            }
            return;
        }

        let Some(conversation) = guard
            .active
            .as_ref()
            .map(|active| active.conversation.clone())
        else {
            debug!(channel = %channel, "dropping push event with no active conversation");
            return;
        };

        if channel == ChannelName::for_typing(&conversation) {
            let local_user = guard.identity.as_ref().map(|i| i.user_id.clone());
            if guard.typing.apply(local_user.as_ref(), &event) {
                let names = guard.typing.names();
                self.emit(SessionEvent::TypingChanged { names });
            }
            return;
        }

        if channel == ChannelName::for_conversation(&conversation) {
            self.handle_conversation_event(&mut guard, event).await;
            return;
        }

        let thread_channel = guard
            .thread
            .as_ref()
            .map(|thread| ChannelName::for_thread(thread.parent_id()));
        if thread_channel.as_ref() == Some(&channel) {
            self.handle_thread_event(&mut guard, event);
            return;
        }

        debug!(channel = %channel, "dropping event from stale subscription");
    }

    async fn handle_conversation_event(
        &self,
        state: &mut SessionState,
        event: PushEvent,
    ) {
        match event {
            PushEvent::NewMessage { message } => {
                if let Some(active) = state.active.as_mut() {
                    active.log.merge_incoming(message);
                    self.emit_message_snapshot(state);
                }
            }
            PushEvent::MessageDeleted {
                message_id,
                thread_parent_id,
            } => {
                if state.recently_deleted.remove(&message_id) {
                    debug!(message_id = %message_id, "deletion already applied locally");
                    return;
                }
                let Some(active) = state.active.as_mut() else {
                    return;
                };
                match active.log.remove(&message_id, thread_parent_id.as_ref()) {
                    RemoveOutcome::Removed => {
                        self.close_thread_if_parent(state, &message_id).await;
                        self.emit_message_snapshot(state);
                    }
                    RemoveOutcome::ReplyCountDecremented { .. } => {
                        if let Some(thread) = state.thread.as_mut() {
                            if thread.remove_reply(&message_id) {
                                self.emit_thread_snapshot(state);
                            }
                        }
                        self.emit_message_snapshot(state);
                    }
                    RemoveOutcome::NotFound => {
                        debug!(message_id = %message_id, "delete event for unknown message");
                    }
                }
            }
            PushEvent::ReactionAdded { reaction } => {
                let changed = state.apply_reaction_delta(&ReactionDelta::Add(reaction));
                self.emit_after_reaction(state, changed);
            }
            PushEvent::ReactionRemoved { reaction } => {
                let changed = state.apply_reaction_delta(&ReactionDelta::Remove(reaction));
                self.emit_after_reaction(state, changed);
            }
            PushEvent::ThreadUpdated {
                parent_id,
                reply_count,
                last_reply,
            } => {
                if let Some(active) = state.active.as_mut() {
                    if active.log.set_thread_meta(&parent_id, reply_count, last_reply) {
                        self.emit_message_snapshot(state);
                    }
                }
            }
            // Remaining kinds are filtered out by the subscription binding.
            _ => {}
        }
    }

    fn handle_thread_event(&self, state: &mut SessionState, event: PushEvent) {
        match event {
            PushEvent::NewMessage { message } => {
                if let Some(thread) = state.thread.as_mut() {
                    if thread.merge_reply(message) {
                        self.emit_thread_snapshot(state);
                    }
                }
            }
            PushEvent::MessageDeleted { message_id, .. } => {
                if let Some(thread) = state.thread.as_mut() {
                    if thread.remove_reply(&message_id) {
                        self.emit_thread_snapshot(state);
                    }
                }
            }
            PushEvent::ReactionAdded { reaction } => {
                let changed = state.apply_reaction_delta(&ReactionDelta::Add(reaction));
                self.emit_after_reaction(state, changed);
            }
            PushEvent::ReactionRemoved { reaction } => {
                let changed = state.apply_reaction_delta(&ReactionDelta::Remove(reaction));
                self.emit_after_reaction(state, changed);
            }
            _ => {}
        }
    }

    async fn close_thread_if_parent(&self, state: &mut SessionState, message_id: &MessageId) {
        let open_on_parent = state
            .thread
            .as_ref()
            .is_some_and(|thread| thread.parent_id() == message_id);
        if !open_on_parent {
            return;
        }
        state.thread = None;
        self.registry
            .unsubscribe(&ChannelName::for_thread(message_id))
            .await;
        self.emit(SessionEvent::ThreadClosed {
            parent_id: message_id.clone(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_message_snapshot(&self, state: &SessionState) {
        if let Some(active) = &state.active {
            self.emit(SessionEvent::MessageListChanged {
                messages: active.log.messages().to_vec(),
            });
        }
    }

    fn emit_thread_snapshot(&self, state: &SessionState) {
        if let Some(thread) = &state.thread {
            self.emit(SessionEvent::ThreadChanged {
                parent_id: thread.parent_id().clone(),
                replies: thread.replies().to_vec(),
            });
        }
    }

    fn emit_after_reaction(&self, state: &SessionState, changed: (bool, bool)) {
        let (log_changed, thread_changed) = changed;
        if log_changed {
            self.emit_message_snapshot(state);
        }
        if thread_changed {
            self.emit_thread_snapshot(state);
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn route_loop(session: Weak<ChatSession>, mut route_rx: mpsc::Receiver<RoutedEvent>) {
    while let Some(routed) = route_rx.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_push(routed).await;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

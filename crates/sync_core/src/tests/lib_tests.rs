use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ChannelId, ReactionId},
    protocol::{DeliveryState, Member, PushEventKind, Reaction},
};
use tokio::sync::oneshot;

use super::*;

/// In-memory server of record. Gates and failure flags let tests hold a
/// request open or fail it to exercise the reconcile paths.
struct FakeStore {
    messages: Mutex<HashMap<Conversation, Vec<Message>>>,
    replies: Mutex<HashMap<MessageId, Vec<Message>>>,
    next_message_id: AtomicU64,
    next_reaction_id: AtomicU64,
    fail_create: AtomicBool,
    create_gate: Mutex<Option<oneshot::Receiver<()>>>,
    list_gate: Mutex<Option<(Conversation, oneshot::Receiver<()>)>>,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            messages: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
            next_reaction_id: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            create_gate: Mutex::new(None),
            list_gate: Mutex::new(None),
        }
    }

    async fn seed(&self, conversation: &Conversation, messages: Vec<Message>) {
        self.messages
            .lock()
            .await
            .insert(conversation.clone(), messages);
    }

    async fn hold_next_create(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.create_gate.lock().await = Some(gate);
        release
    }

    async fn hold_next_list(&self, conversation: &Conversation) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.list_gate.lock().await = Some((conversation.clone(), gate));
        release
    }

    fn mint_message_id(&self) -> MessageId {
        MessageId::new(format!(
            "m{}",
            self.next_message_id.fetch_add(1, Ordering::SeqCst)
        ))
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn create_message(
        &self,
        body: &str,
        conversation: &Conversation,
    ) -> Result<Message, SyncError> {
        let gate = self.create_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SyncError::Network("message rejected".to_owned()));
        }
        Ok(Message {
            message_id: self.mint_message_id(),
            conversation: conversation.clone(),
            sender_id: UserId::new("alice"),
            sender_username: Some("Alice".to_owned()),
            body: body.to_owned(),
            thread_parent_id: None,
            sent_at: Utc::now(),
            reactions: Vec::new(),
            reply_count: 0,
            last_reply: None,
            state: DeliveryState::Confirmed,
        })
    }

    async fn delete_message(&self, _message_id: &MessageId) -> Result<(), SyncError> {
        Ok(())
    }

    async fn create_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<Reaction, SyncError> {
        Ok(Reaction {
            reaction_id: Some(ReactionId::new(format!(
                "r{}",
                self.next_reaction_id.fetch_add(1, Ordering::SeqCst)
            ))),
            message_id: message_id.clone(),
            emoji: emoji.to_owned(),
            user_id: UserId::new("alice"),
            username: Some("Alice".to_owned()),
        })
    }

    async fn delete_reaction(&self, _reaction: &Reaction) -> Result<(), SyncError> {
        Ok(())
    }

    async fn list_messages(&self, conversation: &Conversation) -> Result<Vec<Message>, SyncError> {
        let gate = {
            let mut slot = self.list_gate.lock().await;
            match slot.take() {
                Some((gated, gate)) if &gated == conversation => Some(gate),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .messages
            .lock()
            .await
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_replies(&self, parent_id: &MessageId) -> Result<Vec<Message>, SyncError> {
        Ok(self
            .replies
            .lock()
            .await
            .get(parent_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Transport whose published events loop straight back to subscribers,
/// standing in for the push broker.
#[derive(Default)]
struct LoopbackTransport {
    channels: Mutex<HashMap<ChannelName, broadcast::Sender<String>>>,
}

impl LoopbackTransport {
    async fn sender(&self, name: &ChannelName) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .await
            .entry(name.clone())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    async fn push(&self, name: &ChannelName, event: &PushEvent) {
        let raw = serde_json::to_string(event).expect("event should serialize");
        let _ = self.sender(name).await.send(raw);
    }
}

#[async_trait]
impl EventTransport for LoopbackTransport {
    async fn subscribe(&self, name: &ChannelName) -> Result<broadcast::Receiver<String>> {
        Ok(self.sender(name).await.subscribe())
    }

    async fn unsubscribe(&self, _name: &ChannelName) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, name: &ChannelName, event: &PushEvent) -> Result<()> {
        self.push(name, event).await;
        Ok(())
    }
}

fn identity(user: &str, display_name: &str) -> UserIdentity {
    UserIdentity {
        user_id: UserId::new(user),
        display_name: display_name.to_owned(),
    }
}

fn general() -> Conversation {
    Conversation::channel(ChannelId::new("general"))
}

fn confirmed(id: &str, sender: &str, body: &str, conversation: &Conversation) -> Message {
    Message {
        message_id: MessageId::new(id),
        conversation: conversation.clone(),
        sender_id: UserId::new(sender),
        sender_username: Some(sender.to_owned()),
        body: body.to_owned(),
        thread_parent_id: None,
        sent_at: Utc::now(),
        reactions: Vec::new(),
        reply_count: 0,
        last_reply: None,
        state: DeliveryState::Confirmed,
    }
}

fn member(user: &str) -> Member {
    Member {
        user_id: UserId::new(user),
        display_name: user.to_owned(),
    }
}

struct Harness {
    session: Arc<ChatSession>,
    store: Arc<FakeStore>,
    transport: Arc<LoopbackTransport>,
}

fn harness() -> Harness {
    let store = Arc::new(FakeStore::new());
    let transport = Arc::new(LoopbackTransport::default());
    let session = ChatSession::new(store.clone(), transport.clone());
    Harness {
        session,
        store,
        transport,
    }
}

async fn signed_in_on_general(harness: &Harness) {
    harness.session.sign_in(identity("alice", "Alice")).await;
    harness
        .session
        .switch_context(general())
        .await
        .expect("context switch should succeed");
}

/// Poll until the condition holds; push delivery is asynchronous relative
/// to the test body.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let mut satisfied = false;
        for _ in 0..400 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(satisfied, "timed out waiting for: {}", $what);
    }};
}

#[tokio::test]
async fn send_replaces_the_pending_entry_with_the_confirmed_payload() {
    let h = harness();
    signed_in_on_general(&h).await;

    let sent = h.session.send("hello").await.expect("send should succeed");
    assert_eq!(sent.message_id, MessageId::new("m1"));

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, MessageId::new("m1"));
    assert!(!messages[0].is_pending());
}

#[tokio::test]
async fn push_echo_arriving_before_the_send_response_converges() {
    let h = harness();
    signed_in_on_general(&h).await;

    let release = h.store.hold_next_create().await;
    let sender = h.session.clone();
    let send = tokio::spawn(async move { sender.send("hello").await });

    eventually!("pending entry to appear", {
        let messages = h.session.messages().await;
        messages.len() == 1 && messages[0].is_pending()
    });

    // The broker echo outruns the held-open create response.
    h.transport
        .push(
            &ChannelName::for_conversation(&general()),
            &PushEvent::NewMessage {
                message: confirmed("m1", "alice", "hello", &general()),
            },
        )
        .await;
    eventually!("echo to promote the pending entry", {
        let messages = h.session.messages().await;
        messages.len() == 1 && messages[0].message_id == MessageId::new("m1")
    });

    let _ = release.send(());
    send.await
        .expect("send task should finish")
        .expect("send should succeed");

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, MessageId::new("m1"));
    assert!(!messages[0].is_pending());
}

#[tokio::test]
async fn duplicate_new_message_pushes_yield_one_entry() {
    let h = harness();
    signed_in_on_general(&h).await;

    let event = PushEvent::NewMessage {
        message: confirmed("m1", "bob", "hi", &general()),
    };
    let channel = ChannelName::for_conversation(&general());
    h.transport.push(&channel, &event).await;
    h.transport.push(&channel, &event).await;

    eventually!("message to arrive", !h.session.messages().await.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.messages().await.len(), 1);
}

#[tokio::test]
async fn failed_send_rolls_back_and_reports() {
    let h = harness();
    signed_in_on_general(&h).await;
    h.store.fail_create.store(true, Ordering::SeqCst);

    let mut events = h.session.subscribe_events();
    let err = h
        .session
        .send("hello")
        .await
        .expect_err("send should fail");
    assert!(matches!(err, SyncError::Network(_)));
    assert!(h.session.messages().await.is_empty());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::Error(_)) {
            saw_error = true;
        }
    }
    assert!(saw_error, "failure should surface a session error event");
}

#[tokio::test]
async fn superseded_context_switch_fetch_is_discarded() {
    let h = harness();
    h.session.sign_in(identity("alice", "Alice")).await;

    let slow = general();
    let fast = Conversation::channel(ChannelId::new("random"));
    h.store
        .seed(&slow, vec![confirmed("m1", "bob", "stale", &slow)])
        .await;
    h.store
        .seed(&fast, vec![confirmed("m2", "bob", "fresh", &fast)])
        .await;

    let release = h.store.hold_next_list(&slow).await;
    let switcher = h.session.clone();
    let slow_conversation = slow.clone();
    let first = tokio::spawn(async move { switcher.switch_context(slow_conversation).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.session
        .switch_context(fast.clone())
        .await
        .expect("second switch should succeed");

    let _ = release.send(());
    first
        .await
        .expect("first switch task should finish")
        .expect("superseded switch still returns ok");

    assert_eq!(h.session.current_conversation().await, Some(fast));
    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "fresh");
}

#[tokio::test]
async fn deleting_the_thread_parent_closes_the_thread_view() {
    let h = harness();
    let parent = confirmed("m1", "bob", "parent", &general());
    h.store.seed(&general(), vec![parent.clone()]).await;
    signed_in_on_general(&h).await;

    h.session
        .open_thread(&parent.message_id)
        .await
        .expect("thread should open");
    assert!(h.session.thread_replies().await.is_some());

    h.transport
        .push(
            &ChannelName::for_conversation(&general()),
            &PushEvent::MessageDeleted {
                message_id: parent.message_id.clone(),
                thread_parent_id: None,
            },
        )
        .await;

    eventually!("thread view to close", h.session.thread_replies().await.is_none());
    assert!(h.session.messages().await.is_empty());
}

#[tokio::test]
async fn reply_deletion_echo_decrements_parent_when_no_thread_is_open() {
    let h = harness();
    let mut parent = confirmed("m1", "bob", "parent", &general());
    parent.reply_count = 1;
    h.store.seed(&general(), vec![parent.clone()]).await;
    h.store
        .replies
        .lock()
        .await
        .insert(parent.message_id.clone(), Vec::new());
    signed_in_on_general(&h).await;

    // The reply is not in the visible list, so the local delete applies
    // nothing; the push echo must still shrink the parent's count.
    h.session
        .delete(&MessageId::new("r1"))
        .await
        .expect("delete should succeed");
    assert_eq!(h.session.messages().await[0].reply_count, 1);

    h.transport
        .push(
            &ChannelName::for_conversation(&general()),
            &PushEvent::MessageDeleted {
                message_id: MessageId::new("r1"),
                thread_parent_id: Some(parent.message_id.clone()),
            },
        )
        .await;
    eventually!(
        "parent reply count to shrink",
        h.session.messages().await[0].reply_count == 0
    );
}

#[tokio::test]
async fn locally_deleted_message_suppresses_its_own_echo() {
    let h = harness();
    let mut parent = confirmed("m1", "bob", "parent", &general());
    parent.reply_count = 1;
    h.store.seed(&general(), vec![parent.clone()]).await;
    let reply_id = MessageId::new("r1");
    let mut reply = confirmed("r1", "carol", "a reply", &general());
    reply.thread_parent_id = Some(parent.message_id.clone());
    h.store
        .replies
        .lock()
        .await
        .insert(parent.message_id.clone(), vec![reply]);
    signed_in_on_general(&h).await;
    h.session
        .open_thread(&parent.message_id)
        .await
        .expect("thread should open");

    h.session
        .delete(&reply_id)
        .await
        .expect("delete should succeed");
    assert_eq!(h.session.messages().await[0].reply_count, 0);

    // The echo of our own delete must not decrement the parent again.
    h.transport
        .push(
            &ChannelName::for_conversation(&general()),
            &PushEvent::MessageDeleted {
                message_id: reply_id,
                thread_parent_id: Some(parent.message_id.clone()),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.messages().await[0].reply_count, 0);
}

#[tokio::test]
async fn disconnected_session_fails_until_collaborators_are_wired() {
    let session = ChatSession::disconnected();
    session.sign_in(identity("alice", "Alice")).await;

    let err = session
        .switch_context(general())
        .await
        .expect_err("no store is wired");
    assert!(matches!(err, SyncError::Network(_)));
    assert!(session.current_conversation().await.is_none());
    session.shutdown().await;
}

#[tokio::test]
async fn presence_subscription_requires_an_identity() {
    let h = harness();
    h.session.subscribe_presence().await;

    h.transport
        .push(
            &ChannelName::presence(),
            &PushEvent::MembershipSnapshot {
                members: vec![member("bob")],
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.session.presence().await.is_empty());
}

#[tokio::test]
async fn presence_snapshot_and_deltas_flow_through() {
    let h = harness();
    h.session.sign_in(identity("alice", "Alice")).await;

    h.transport
        .push(
            &ChannelName::presence(),
            &PushEvent::MembershipSnapshot {
                members: vec![member("alice"), member("bob")],
            },
        )
        .await;
    eventually!(
        "snapshot to land",
        h.session.presence().await == vec![UserId::new("alice"), UserId::new("bob")]
    );

    h.transport
        .push(
            &ChannelName::presence(),
            &PushEvent::MemberRemoved {
                member: member("alice"),
            },
        )
        .await;
    eventually!(
        "departure to land",
        h.session.presence().await == vec![UserId::new("bob")]
    );
}

#[tokio::test]
async fn own_typing_echo_is_filtered_from_the_set() {
    let h = harness();
    signed_in_on_general(&h).await;
    let typing_channel = ChannelName::for_typing(&general());

    h.transport
        .push(
            &typing_channel,
            &PushEvent::Typing {
                user_id: UserId::new("bob"),
                display_name: "bob".to_owned(),
            },
        )
        .await;
    eventually!(
        "peer typing to land",
        h.session.typing_names().await == vec!["bob".to_owned()]
    );

    // The local signal loops back over the same channel and must not
    // show the local user to themselves.
    h.session
        .notify_typing()
        .await
        .expect("notify should succeed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.typing_names().await, vec!["bob".to_owned()]);
}

#[tokio::test]
async fn reaction_toggle_adds_then_removes() {
    let h = harness();
    let target = confirmed("m1", "bob", "hi", &general());
    h.store.seed(&general(), vec![target.clone()]).await;
    signed_in_on_general(&h).await;

    h.session
        .toggle_reaction(&target.message_id, "👍")
        .await
        .expect("add toggle should succeed");
    let messages = h.session.messages().await;
    assert_eq!(messages[0].reactions.len(), 1);
    // The confirmed payload replaced the optimistic no-id record.
    assert_eq!(
        messages[0].reactions[0].reaction_id,
        Some(ReactionId::new("r1"))
    );

    h.session
        .toggle_reaction(&target.message_id, "👍")
        .await
        .expect("remove toggle should succeed");
    assert!(h.session.messages().await[0].reactions.is_empty());
}

#[tokio::test]
async fn thread_replies_route_into_the_open_view_only() {
    let h = harness();
    let parent = confirmed("m1", "bob", "parent", &general());
    h.store.seed(&general(), vec![parent.clone()]).await;
    signed_in_on_general(&h).await;
    h.session
        .open_thread(&parent.message_id)
        .await
        .expect("thread should open");

    let mut reply = confirmed("r1", "carol", "a reply", &general());
    reply.thread_parent_id = Some(parent.message_id.clone());
    h.transport
        .push(
            &ChannelName::for_thread(&parent.message_id),
            &PushEvent::NewMessage { message: reply },
        )
        .await;

    eventually!("reply to land in the thread view", {
        h.session
            .thread_replies()
            .await
            .is_some_and(|(_, replies)| replies.len() == 1)
    });
    assert_eq!(h.session.messages().await.len(), 1);
}

#[tokio::test]
async fn shutdown_stops_routing() {
    let h = harness();
    signed_in_on_general(&h).await;
    h.session.shutdown().await;

    h.transport
        .push(
            &ChannelName::for_conversation(&general()),
            &PushEvent::NewMessage {
                message: confirmed("m1", "bob", "late", &general()),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.session.messages().await.is_empty());
}

#[test]
fn push_event_kinds_partition_the_subscription_sets() {
    let conversation = conversation_kinds();
    let typing = typing_kinds();
    let presence = presence_kinds();
    assert!(conversation.is_disjoint(&typing));
    assert!(conversation.is_disjoint(&presence));
    assert!(typing.is_disjoint(&presence));
    assert!(!conversation.contains(&PushEventKind::Error));
}

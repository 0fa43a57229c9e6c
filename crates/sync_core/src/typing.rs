use std::{collections::BTreeSet, sync::Arc, time::Duration};

use shared::{
    domain::{Conversation, UserId, UserIdentity},
    protocol::PushEvent,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::warn;

use crate::{channel_name::ChannelName, transport::EventTransport};

/// Quiet period after the last keystroke before stop-typing is signalled.
pub const TYPING_QUIET_INTERVAL: Duration = Duration::from_millis(2000);

/// Display names currently typing in one conversation context.
#[derive(Debug, Default, Clone)]
pub struct TypingSet {
    names: BTreeSet<String>,
}

impl TypingSet {
    /// Apply one typing event. Self-originated signals are filtered by
    /// `local_user` so "you are typing" never renders. Returns whether the
    /// set changed.
    pub fn apply(&mut self, local_user: Option<&UserId>, event: &PushEvent) -> bool {
        match event {
            PushEvent::Typing {
                user_id,
                display_name,
            } => {
                if local_user == Some(user_id) {
                    return false;
                }
                self.names.insert(display_name.clone())
            }
            PushEvent::StopTyping {
                user_id,
                display_name,
            } => {
                if local_user == Some(user_id) {
                    return false;
                }
                self.names.remove(display_name)
            }
            _ => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Rendering policy for the typing indicator line.
pub fn typing_summary(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{one} is typing")),
        [a, b] => Some(format!("{a} and {b} are typing")),
        [first, rest @ ..] => Some(format!("{first} and {} others are typing", rest.len())),
    }
}

/// Emits typing/stop-typing signals on a debounce timer.
///
/// Each `notify_typing` call publishes immediately and re-arms one
/// cancellable stop-timer, so a burst of keystrokes produces a single
/// stop-typing signal after the quiet interval.
pub struct TypingCoordinator {
    transport: Arc<dyn EventTransport>,
    stop_timer: Mutex<Option<JoinHandle<()>>>,
}

impl TypingCoordinator {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            transport,
            stop_timer: Mutex::new(None),
        }
    }

    pub async fn notify_typing(&self, conversation: &Conversation, identity: &UserIdentity) {
        let channel = ChannelName::for_typing(conversation);
        let typing = PushEvent::Typing {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
        };
        if let Err(err) = self.transport.publish(&channel, &typing).await {
            warn!(channel = %channel, "typing signal publish failed: {err}");
        }

        let transport = Arc::clone(&self.transport);
        let stop = PushEvent::StopTyping {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep(TYPING_QUIET_INTERVAL).await;
            if let Err(err) = transport.publish(&channel, &stop).await {
                warn!(channel = %channel, "stop-typing signal publish failed: {err}");
            }
        });

        let previous = self.stop_timer.lock().await.replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Drop any armed stop-timer, e.g. when leaving the conversation.
    pub async fn cancel(&self) {
        if let Some(timer) = self.stop_timer.lock().await.take() {
            timer.abort();
        }
    }
}

impl Drop for TypingCoordinator {
    fn drop(&mut self) {
        if let Some(timer) = self.stop_timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;

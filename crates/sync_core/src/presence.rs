use std::collections::HashSet;

use shared::{domain::UserId, protocol::PushEvent};

/// Set of currently-online identities on the well-known presence channel.
///
/// Rebuilt wholesale from each membership snapshot, then adjusted
/// incrementally. Every mutation is an idempotent set operation: adding a
/// present member or removing an absent one is a no-op, not an error.
#[derive(Debug, Default, Clone)]
pub struct PresenceSet {
    online: HashSet<UserId>,
}

impl PresenceSet {
    /// Apply one membership event. Returns whether the set changed.
    pub fn apply(&mut self, event: &PushEvent) -> bool {
        match event {
            PushEvent::MembershipSnapshot { members } => {
                let next: HashSet<UserId> =
                    members.iter().map(|member| member.user_id.clone()).collect();
                let changed = next != self.online;
                self.online = next;
                changed
            }
            PushEvent::MemberAdded { member } => self.online.insert(member.user_id.clone()),
            PushEvent::MemberRemoved { member } => self.online.remove(&member.user_id),
            _ => false,
        }
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }

    /// Stable-order snapshot for the presentation layer.
    pub fn snapshot(&self) -> Vec<UserId> {
        let mut online: Vec<UserId> = self.online.iter().cloned().collect();
        online.sort();
        online
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;

use std::collections::BTreeMap;

use shared::{
    domain::UserId,
    protocol::{Message, Reaction},
};

/// Per-emoji aggregate recomputed from the message's current reaction set
/// on every call, never incrementally maintained, so it cannot drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmojiAggregate {
    pub count: usize,
    pub users: Vec<String>,
    pub reacted_by_local: bool,
}

pub fn group_by_emoji(message: &Message, local_user: &UserId) -> BTreeMap<String, EmojiAggregate> {
    let mut groups: BTreeMap<String, EmojiAggregate> = BTreeMap::new();
    for reaction in &message.reactions {
        let entry = groups
            .entry(reaction.emoji.clone())
            .or_insert_with(|| EmojiAggregate {
                count: 0,
                users: Vec::new(),
                reacted_by_local: false,
            });
        entry.count += 1;
        entry.users.push(
            reaction
                .username
                .clone()
                .unwrap_or_else(|| reaction.user_id.0.clone()),
        );
        if &reaction.user_id == local_user {
            entry.reacted_by_local = true;
        }
    }
    groups
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactionDelta {
    Add(Reaction),
    Remove(Reaction),
}

/// Two reaction records describe the same persisted reaction when their
/// ids match, or, for records minted during the optimistic window before
/// an id is assigned, when emoji and reacting user match. At most one
/// reaction per (message, user, emoji) triple survives reconciliation.
fn matches(existing: &Reaction, target: &Reaction) -> bool {
    if let (Some(a), Some(b)) = (&existing.reaction_id, &target.reaction_id) {
        if a == b {
            return true;
        }
    }
    existing.emoji == target.emoji && existing.user_id == target.user_id
}

/// Apply one add/remove delta idempotently. Returns whether the reaction
/// set changed.
///
/// An add that matches an existing no-id record adopts the incoming id
/// (the confirmed copy of an optimistic reaction) instead of duplicating.
/// A remove deletes by id when possible, falling back to emoji+user for
/// events generated before an id was assigned.
pub fn apply_delta(message: &mut Message, delta: &ReactionDelta) -> bool {
    match delta {
        ReactionDelta::Add(reaction) => {
            if let Some(existing) = message
                .reactions
                .iter_mut()
                .find(|existing| matches(existing, reaction))
            {
                if existing.reaction_id.is_none() && reaction.reaction_id.is_some() {
                    existing.reaction_id = reaction.reaction_id.clone();
                }
                return false;
            }
            message.reactions.push(reaction.clone());
            true
        }
        ReactionDelta::Remove(reaction) => {
            let Some(index) = message
                .reactions
                .iter()
                .position(|existing| matches(existing, reaction))
            else {
                return false;
            };
            message.reactions.remove(index);
            true
        }
    }
}

/// The local user's reaction with `emoji` on this message, if any. Drives
/// the toggle policy: an existing reaction is removed, a missing one added.
pub fn find_local<'a>(
    message: &'a Message,
    local_user: &UserId,
    emoji: &str,
) -> Option<&'a Reaction> {
    message
        .reactions
        .iter()
        .find(|reaction| &reaction.user_id == local_user && reaction.emoji == emoji)
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;

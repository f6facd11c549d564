use std::collections::HashMap;

use shared::domain::{MessageId, UserId};

use crate::model::Reaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionDelta {
    Add,
    Remove,
}

/// Applies one reactor's delta to a reaction list and returns the new list.
///
/// An emoji whose count would reach zero is dropped. A removal by someone
/// other than the current user never clears the current user's flag.
pub fn apply_reaction_delta(
    reactions: &[Reaction],
    delta: ReactionDelta,
    emoji: &str,
    acting_user: &UserId,
    current_user: &UserId,
) -> Vec<Reaction> {
    let is_self = acting_user == current_user;
    let mut next = reactions.to_vec();
    let position = next.iter().position(|reaction| reaction.emoji == emoji);

    match (delta, position) {
        (ReactionDelta::Add, Some(index)) => {
            let entry = &mut next[index];
            entry.count = entry.count.saturating_add(1);
            entry.me |= is_self;
        }
        (ReactionDelta::Add, None) => next.push(Reaction {
            emoji: emoji.to_string(),
            count: 1,
            me: is_self,
        }),
        (ReactionDelta::Remove, Some(index)) => {
            if next[index].count <= 1 {
                next.remove(index);
            } else {
                let entry = &mut next[index];
                entry.count -= 1;
                if is_self {
                    entry.me = false;
                }
            }
        }
        (ReactionDelta::Remove, None) => {}
    }

    next
}

/// The current user's own click. Returns `None` when the click does not change
/// local state (adding an emoji already reacted with, or removing one never added).
pub fn optimistic_reactions(
    reactions: &[Reaction],
    delta: ReactionDelta,
    emoji: &str,
    current_user: &UserId,
) -> Option<Vec<Reaction>> {
    let already_reacted = reactions
        .iter()
        .any(|reaction| reaction.emoji == emoji && reaction.me);
    match delta {
        ReactionDelta::Add if already_reacted => None,
        ReactionDelta::Remove if !already_reacted => None,
        _ => Some(apply_reaction_delta(
            reactions,
            delta,
            emoji,
            current_user,
            current_user,
        )),
    }
}

/// Remembers which reactors were last seen present or absent per emoji so a
/// redelivered gateway delta is applied once.
#[derive(Debug, Default)]
pub struct ReactorLedger {
    seen: HashMap<(MessageId, String), HashMap<UserId, bool>>,
}

impl ReactorLedger {
    /// Returns `false` if this exact delta was already recorded for the reactor.
    pub fn record(
        &mut self,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
        delta: ReactionDelta,
    ) -> bool {
        let present = delta == ReactionDelta::Add;
        let reactors = self
            .seen
            .entry((message_id.clone(), emoji.to_string()))
            .or_default();
        if reactors.get(user_id) == Some(&present) {
            return false;
        }
        reactors.insert(user_id.clone(), present);
        true
    }

    pub fn forget_message(&mut self, message_id: &MessageId) {
        self.seen.retain(|(id, _), _| id != message_id);
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Authoritative gateway delta against the currently stored list. The current
/// user's own deltas are matched against the `me` flag, so the echo of an
/// optimistic click is not counted twice.
pub(crate) fn reconcile_reaction_event(
    reactions: &[Reaction],
    ledger: &mut ReactorLedger,
    message_id: &MessageId,
    delta: ReactionDelta,
    emoji: &str,
    acting_user: &UserId,
    current_user: &UserId,
) -> Option<Vec<Reaction>> {
    if acting_user == current_user {
        return optimistic_reactions(reactions, delta, emoji, current_user);
    }
    if !ledger.record(message_id, emoji, acting_user, delta) {
        return None;
    }
    if delta == ReactionDelta::Remove && !reactions.iter().any(|r| r.emoji == emoji) {
        return None;
    }
    Some(apply_reaction_delta(
        reactions,
        delta,
        emoji,
        acting_user,
        current_user,
    ))
}

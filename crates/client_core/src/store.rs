//! Per-channel timeline state.
//!
//! Every mutation swaps in a new `Arc` for whatever it touched, so a snapshot
//! handed out earlier is never changed underneath its holder and
//! `Arc::ptr_eq` is a valid change check. Message sequences are kept sorted
//! ascending by id with no duplicates.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use shared::{
    domain::{ChannelId, MessageId, PollId, UserId},
    protocol::{DmE2eeEnvelope, PollSummary},
};
use tokio::sync::broadcast;

use crate::{
    model::{Message, MessagePatch, Reaction},
    reactions::{reconcile_reaction_event, ReactionDelta, ReactorLedger},
};

#[derive(Debug, Clone, Default)]
pub struct ChannelTimeline {
    pub messages: Arc<Vec<Message>>,
    pub has_more: bool,
    pub loading: bool,
    /// Refreshed only by an explicit pins load; may lag the main sequence.
    pub pinned: Arc<Vec<Message>>,
    /// Ids whose encrypted content has not been resolved yet.
    pub decrypting: Arc<HashSet<MessageId>>,
    pub polls: Arc<HashMap<PollId, PollSummary>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Messages(ChannelId),
    Flags(ChannelId),
    Pinned(ChannelId),
    Cleared,
}

#[derive(Default)]
struct ChannelState {
    timeline: ChannelTimeline,
    ledger: ReactorLedger,
}

impl ChannelState {
    /// Recomputes the decrypting set from both sequences. A message is in the
    /// set exactly while it carries an envelope and no content.
    fn sync_decrypting(&mut self) {
        let awaiting: HashSet<MessageId> = self
            .timeline
            .messages
            .iter()
            .chain(self.timeline.pinned.iter())
            .filter(|message| message.awaiting_decryption())
            .map(|message| message.id.clone())
            .collect();
        if *self.timeline.decrypting != awaiting {
            self.timeline.decrypting = Arc::new(awaiting);
        }
    }

    fn record_polls<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) {
        let mut polls = messages
            .into_iter()
            .filter_map(|message| message.poll.clone())
            .peekable();
        if polls.peek().is_none() {
            return;
        }
        let cache = Arc::make_mut(&mut self.timeline.polls);
        for poll in polls {
            cache.insert(poll.id.clone(), poll);
        }
    }

    fn position(&self, message_id: &MessageId) -> Option<usize> {
        self.timeline
            .messages
            .binary_search_by(|message| message.id.cmp(message_id))
            .ok()
    }

    fn insert_sorted(&mut self, message: Message) -> bool {
        match self
            .timeline
            .messages
            .binary_search_by(|existing| existing.id.cmp(&message.id))
        {
            Ok(_) => false,
            Err(index) => {
                Arc::make_mut(&mut self.timeline.messages).insert(index, message);
                true
            }
        }
    }

    /// Applies `update` to the main-sequence copy and any pinned copy.
    fn update_everywhere(
        &mut self,
        message_id: &MessageId,
        mut update: impl FnMut(&mut Message),
    ) -> (bool, bool) {
        let in_messages = match self.position(message_id) {
            Some(index) => {
                update(&mut Arc::make_mut(&mut self.timeline.messages)[index]);
                true
            }
            None => false,
        };
        let pinned_index = self
            .timeline
            .pinned
            .iter()
            .position(|message| &message.id == message_id);
        let in_pinned = match pinned_index {
            Some(index) => {
                update(&mut Arc::make_mut(&mut self.timeline.pinned)[index]);
                true
            }
            None => false,
        };
        (in_messages, in_pinned)
    }
}

pub struct TimelineStore {
    channels: RwLock<HashMap<ChannelId, ChannelState>>,
    changes: broadcast::Sender<StoreChange>,
}

impl TimelineStore {
    pub fn new(buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(buffer.max(1));
        Self {
            channels: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ChannelId, ChannelState>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ChannelId, ChannelState>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    /// Runs `f` against the channel's state, creating it if needed, and
    /// publishes `change` when `f` reports a modification.
    fn mutate<R>(
        &self,
        channel_id: &ChannelId,
        change: impl FnOnce(ChannelId) -> StoreChange,
        f: impl FnOnce(&mut ChannelState) -> (R, bool),
    ) -> R {
        let (result, changed) = {
            let mut channels = self.write();
            let state = channels.entry(channel_id.clone()).or_default();
            f(state)
        };
        if changed {
            self.notify(change(channel_id.clone()));
        }
        result
    }

    pub fn timeline(&self, channel_id: &ChannelId) -> ChannelTimeline {
        self.read()
            .get(channel_id)
            .map(|state| state.timeline.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, channel_id: &ChannelId) -> Arc<Vec<Message>> {
        self.read()
            .get(channel_id)
            .map(|state| Arc::clone(&state.timeline.messages))
            .unwrap_or_default()
    }

    pub fn message(&self, channel_id: &ChannelId, message_id: &MessageId) -> Option<Message> {
        let channels = self.read();
        let state = channels.get(channel_id)?;
        let index = state.position(message_id)?;
        Some(state.timeline.messages[index].clone())
    }

    /// Fresh load: the sequence becomes exactly `messages` (sorted, deduplicated).
    pub fn replace(&self, channel_id: &ChannelId, mut messages: Vec<Message>) {
        messages.sort_by(|left, right| left.id.cmp(&right.id));
        messages.dedup_by(|later, earlier| later.id == earlier.id);
        self.mutate(channel_id, StoreChange::Messages, |state| {
            state.record_polls(&messages);
            state.timeline.messages = Arc::new(messages);
            state.ledger.clear();
            state.sync_decrypting();
            ((), true)
        })
    }

    /// Merges an older page in front of the existing sequence.
    pub fn prepend(&self, channel_id: &ChannelId, older: Vec<Message>) -> usize {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            state.record_polls(&older);
            let mut inserted = 0;
            for message in older {
                if state.insert_sorted(message) {
                    inserted += 1;
                }
            }
            state.sync_decrypting();
            (inserted, inserted > 0)
        })
    }

    /// Inserts at the sorted position unless the id is already present.
    pub fn insert_if_absent(&self, channel_id: &ChannelId, message: Message) -> bool {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            state.record_polls([&message]);
            let inserted = state.insert_sorted(message);
            if inserted {
                state.sync_decrypting();
            }
            (inserted, inserted)
        })
    }

    /// Replace-by-id in every sequence holding the message. Absent ids are
    /// not inserted.
    pub fn replace_message(&self, channel_id: &ChannelId, message: Message) -> bool {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            let message_id = message.id.clone();
            state.record_polls([&message]);
            let (in_messages, in_pinned) =
                state.update_everywhere(&message_id, |existing| *existing = message.clone());
            let replaced = in_messages || in_pinned;
            if replaced {
                state.ledger.forget_message(&message_id);
                state.sync_decrypting();
            }
            (replaced, replaced)
        })
    }

    pub fn patch(&self, channel_id: &ChannelId, message_id: &MessageId, patch: &MessagePatch) -> bool {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            let (in_messages, in_pinned) =
                state.update_everywhere(message_id, |message| patch.apply(message));
            let patched = in_messages || in_pinned;
            if patched {
                state.sync_decrypting();
            }
            (patched, patched)
        })
    }

    /// Sets the pinned flag and returns the previous value from the main sequence.
    pub fn swap_pinned_flag(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        pinned: bool,
    ) -> Option<bool> {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            let previous = state
                .position(message_id)
                .map(|index| state.timeline.messages[index].pinned);
            if previous.is_none() || previous == Some(pinned) {
                return (previous, false);
            }
            state.update_everywhere(message_id, |message| message.pinned = pinned);
            (previous, true)
        })
    }

    pub fn remove(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        self.remove_many(channel_id, std::slice::from_ref(message_id)) > 0
    }

    /// Drops the ids from the main sequence and the pinned cache.
    pub fn remove_many(&self, channel_id: &ChannelId, message_ids: &[MessageId]) -> usize {
        let ids: HashSet<&MessageId> = message_ids.iter().collect();
        let (removed, pinned_changed) = {
            let mut channels = self.write();
            let Some(state) = channels.get_mut(channel_id) else {
                return 0;
            };
            let before = state.timeline.messages.len();
            if state.timeline.messages.iter().any(|m| ids.contains(&m.id)) {
                Arc::make_mut(&mut state.timeline.messages).retain(|m| !ids.contains(&m.id));
            }
            let removed = before - state.timeline.messages.len();
            let pinned_changed = state.timeline.pinned.iter().any(|m| ids.contains(&m.id));
            if pinned_changed {
                Arc::make_mut(&mut state.timeline.pinned).retain(|m| !ids.contains(&m.id));
            }
            for id in &ids {
                state.ledger.forget_message(id);
            }
            state.sync_decrypting();
            (removed, pinned_changed)
        };
        if removed > 0 {
            self.notify(StoreChange::Messages(channel_id.clone()));
        }
        if pinned_changed {
            self.notify(StoreChange::Pinned(channel_id.clone()));
        }
        removed
    }

    /// Marks a load as started. Returns `false` if one is already running.
    pub fn try_begin_loading(&self, channel_id: &ChannelId) -> bool {
        self.mutate(channel_id, StoreChange::Flags, |state| {
            if state.timeline.loading {
                return (false, false);
            }
            state.timeline.loading = true;
            (true, true)
        })
    }

    pub fn set_loading(&self, channel_id: &ChannelId, loading: bool) {
        self.mutate(channel_id, StoreChange::Flags, |state| {
            let changed = state.timeline.loading != loading;
            state.timeline.loading = loading;
            ((), changed)
        })
    }

    pub fn is_loading(&self, channel_id: &ChannelId) -> bool {
        self.read()
            .get(channel_id)
            .is_some_and(|state| state.timeline.loading)
    }

    pub fn set_has_more(&self, channel_id: &ChannelId, has_more: bool) {
        self.mutate(channel_id, StoreChange::Flags, |state| {
            let changed = state.timeline.has_more != has_more;
            state.timeline.has_more = has_more;
            ((), changed)
        })
    }

    pub fn has_more(&self, channel_id: &ChannelId) -> bool {
        self.read()
            .get(channel_id)
            .is_some_and(|state| state.timeline.has_more)
    }

    pub fn pinned(&self, channel_id: &ChannelId) -> Arc<Vec<Message>> {
        self.read()
            .get(channel_id)
            .map(|state| Arc::clone(&state.timeline.pinned))
            .unwrap_or_default()
    }

    pub fn replace_pinned(&self, channel_id: &ChannelId, pinned: Vec<Message>) {
        self.mutate(channel_id, StoreChange::Pinned, |state| {
            state.timeline.pinned = Arc::new(pinned);
            state.sync_decrypting();
            ((), true)
        })
    }

    /// Removes the pinned-cache entry, returning it with its former position.
    pub fn remove_pinned(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Option<(usize, Message)> {
        self.mutate(channel_id, StoreChange::Pinned, |state| {
            let Some(index) = state
                .timeline
                .pinned
                .iter()
                .position(|message| &message.id == message_id)
            else {
                return (None, false);
            };
            let removed = Arc::make_mut(&mut state.timeline.pinned).remove(index);
            state.sync_decrypting();
            (Some((index, removed)), true)
        })
    }

    pub fn restore_pinned(&self, channel_id: &ChannelId, index: usize, message: Message) {
        self.mutate(channel_id, StoreChange::Pinned, |state| {
            if state.timeline.pinned.iter().any(|m| m.id == message.id) {
                return ((), false);
            }
            let pinned = Arc::make_mut(&mut state.timeline.pinned);
            let index = index.min(pinned.len());
            pinned.insert(index, message);
            state.sync_decrypting();
            ((), true)
        })
    }

    pub fn decrypting(&self, channel_id: &ChannelId) -> Arc<HashSet<MessageId>> {
        self.read()
            .get(channel_id)
            .map(|state| Arc::clone(&state.timeline.decrypting))
            .unwrap_or_default()
    }

    /// Resolves a pending decryption of `envelope` with `content` (plaintext
    /// or placeholder). Copies that no longer carry that envelope, or that
    /// already have content, are left alone.
    pub fn finish_decryption(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        envelope: &DmE2eeEnvelope,
        content: String,
    ) -> bool {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            if !state.timeline.decrypting.contains(message_id) {
                return (false, false);
            }
            let mut resolved = false;
            state.update_everywhere(message_id, |message| {
                if message.awaiting_decryption() && message.envelope.as_ref() == Some(envelope) {
                    message.content = Some(content.clone());
                    resolved = true;
                }
            });
            if resolved {
                state.sync_decrypting();
            }
            (resolved, resolved)
        })
    }

    /// Sets each loaded message's pinned flag from the authoritative pin list.
    pub fn sync_pinned_flags(&self, channel_id: &ChannelId, pinned: &HashSet<MessageId>) -> usize {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            let stale: Vec<MessageId> = state
                .timeline
                .messages
                .iter()
                .filter(|message| message.pinned != pinned.contains(&message.id))
                .map(|message| message.id.clone())
                .collect();
            for message_id in &stale {
                let flag = pinned.contains(message_id);
                state.update_everywhere(message_id, |message| message.pinned = flag);
            }
            (stale.len(), !stale.is_empty())
        })
    }

    pub fn reactions(&self, channel_id: &ChannelId, message_id: &MessageId) -> Option<Vec<Reaction>> {
        self.message(channel_id, message_id)
            .map(|message| message.reactions)
    }

    pub fn set_reactions(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        reactions: Vec<Reaction>,
    ) -> bool {
        self.patch(
            channel_id,
            message_id,
            &MessagePatch {
                reactions: Some(reactions),
                ..MessagePatch::default()
            },
        )
    }

    /// Atomically computes a new reaction list from the current one. Returns
    /// the list as it was before the change, or `None` if nothing changed.
    pub fn swap_reactions(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        compute: impl FnOnce(&[Reaction]) -> Option<Vec<Reaction>>,
    ) -> Option<Vec<Reaction>> {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            let Some(index) = state.position(message_id) else {
                return (None, false);
            };
            let previous = state.timeline.messages[index].reactions.clone();
            let Some(next) = compute(&previous) else {
                return (None, false);
            };
            state.update_everywhere(message_id, |message| message.reactions = next.clone());
            (Some(previous), true)
        })
    }

    /// Applies an authoritative reactor delta from the gateway.
    pub fn apply_reaction_event(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        delta: ReactionDelta,
        emoji: &str,
        acting_user: &UserId,
        current_user: &UserId,
    ) -> bool {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            let Some(index) = state.position(message_id) else {
                return (false, false);
            };
            let current = state.timeline.messages[index].reactions.clone();
            let Some(next) = reconcile_reaction_event(
                &current,
                &mut state.ledger,
                message_id,
                delta,
                emoji,
                acting_user,
                current_user,
            ) else {
                return (false, false);
            };
            state.update_everywhere(message_id, |message| message.reactions = next.clone());
            (true, true)
        })
    }

    /// Drops every reaction and the reactor history behind them, so a later
    /// add by an earlier reactor counts again.
    pub fn clear_reactions(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            state.ledger.forget_message(message_id);
            let Some(index) = state.position(message_id) else {
                return (false, false);
            };
            if state.timeline.messages[index].reactions.is_empty() {
                return (false, false);
            }
            state.update_everywhere(message_id, |message| message.reactions.clear());
            (true, true)
        })
    }

    pub fn clear_polls(&self, channel_id: &ChannelId) {
        self.mutate(channel_id, StoreChange::Messages, |state| {
            let changed = !state.timeline.polls.is_empty();
            if changed {
                state.timeline.polls = Arc::default();
            }
            ((), changed)
        })
    }

    pub fn polls(&self, channel_id: &ChannelId) -> Arc<HashMap<PollId, PollSummary>> {
        self.read()
            .get(channel_id)
            .map(|state| Arc::clone(&state.timeline.polls))
            .unwrap_or_default()
    }

    /// Session teardown.
    pub fn clear(&self) {
        self.write().clear();
        self.notify(StoreChange::Cleared);
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use shared::protocol::GatewayEvent;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    e2ee::pending_decryptions,
    engine::SyncEngine,
    model::{Message, MessagePatch},
    reactions::ReactionDelta,
    ClientEvent,
};

impl SyncEngine {
    /// Applies one authoritative push event. Every branch is idempotent.
    /// Pin-list notifications carry no message id and need a fetch, so they
    /// are left to [`SyncEngine::handle_event`].
    pub fn apply_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::MessageCreate(payload) => {
                let message = Message::from_payload(payload);
                let channel_id = message.channel_id.clone();
                let pending = pending_decryptions([&message]);
                if self.store.insert_if_absent(&channel_id, message) {
                    if !pending.is_empty() {
                        self.e2ee.schedule(&channel_id, pending);
                    }
                } else {
                    debug!(channel_id = %channel_id, "reconcile: create for a known message ignored");
                }
            }
            GatewayEvent::MessageUpdate(payload) => {
                let message = Message::from_payload(payload);
                let channel_id = message.channel_id.clone();
                let pending = pending_decryptions([&message]);
                if self.store.replace_message(&channel_id, message) && !pending.is_empty() {
                    self.e2ee.schedule(&channel_id, pending);
                }
            }
            GatewayEvent::MessageDelete(payload) => {
                self.store.remove(&payload.channel_id, &payload.id);
            }
            GatewayEvent::MessageDeleteBulk(payload) => {
                let removed = self.store.remove_many(&payload.channel_id, &payload.ids);
                debug!(channel_id = %payload.channel_id, removed, "reconcile: bulk delete");
            }
            GatewayEvent::MessageReactionAdd(payload) => {
                self.store.apply_reaction_event(
                    &payload.channel_id,
                    &payload.message_id,
                    ReactionDelta::Add,
                    &payload.emoji,
                    &payload.user_id,
                    &self.current_user,
                );
            }
            GatewayEvent::MessageReactionRemove(payload) => {
                self.store.apply_reaction_event(
                    &payload.channel_id,
                    &payload.message_id,
                    ReactionDelta::Remove,
                    &payload.emoji,
                    &payload.user_id,
                    &self.current_user,
                );
            }
            GatewayEvent::MessageReactionRemoveAll(payload) => {
                self.store
                    .clear_reactions(&payload.channel_id, &payload.message_id);
            }
            GatewayEvent::MessagePinUpdate(payload) => {
                self.store.patch(
                    &payload.channel_id,
                    &payload.message_id,
                    &MessagePatch::pinned(payload.pinned),
                );
            }
            GatewayEvent::ChannelPinsUpdate(payload) => {
                debug!(channel_id = %payload.channel_id, "reconcile: pin list change needs a refetch");
            }
        }
    }

    /// [`SyncEngine::apply_event`] plus the follow-up fetch for pin-list
    /// notifications on channels this session has loaded.
    pub async fn handle_event(&self, event: GatewayEvent) {
        let channel_id = match event {
            GatewayEvent::ChannelPinsUpdate(payload) => payload.channel_id,
            event => return self.apply_event(event),
        };
        if self.store.get(&channel_id).is_empty() && self.store.pinned(&channel_id).is_empty() {
            debug!(channel_id = %channel_id, "reconcile: pin change for an unloaded channel");
            return;
        }
        if let Err(error) = self.reconcile_pins(&channel_id).await {
            debug!(channel_id = %channel_id, %error, "reconcile: pin refetch failed");
        }
    }

    /// Feeds a push-event stream into [`SyncEngine::handle_event`] until it ends.
    pub fn spawn_event_loop<S>(self: &Arc<Self>, events: S) -> JoinHandle<()>
    where
        S: Stream<Item = GatewayEvent> + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                engine.handle_event(event).await;
            }
            info!("reconcile: push stream closed");
            let _ = engine.events.send(ClientEvent::GatewayClosed);
        })
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;

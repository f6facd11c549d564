use std::collections::HashSet;

use shared::{
    domain::{AttachmentId, ChannelId, MessageId},
    protocol::{EditMessageRequest, SendMessageRequest},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    e2ee::pending_decryptions,
    engine::SyncEngine,
    error::{EngineError, TransportError, ValidationError},
    model::{Message, Reaction},
    reactions::{optimistic_reactions, ReactionDelta},
    store::TimelineStore,
    with_timeout,
};

pub const MAX_CONTENT_CHARS: usize = 2_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub attachment_ids: Vec<AttachmentId>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn with_attachments(mut self, attachment_ids: Vec<AttachmentId>) -> Self {
        self.attachment_ids = attachment_ids;
        self
    }
}

/// State captured before an optimistic change, restored verbatim on failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackSnapshot {
    Reactions {
        channel_id: ChannelId,
        message_id: MessageId,
        reactions: Vec<Reaction>,
    },
    Pin {
        channel_id: ChannelId,
        message_id: MessageId,
        /// Flag before the change; `None` if the message was not loaded.
        pinned: Option<bool>,
        /// Pinned-cache entry removed by the change, with its position.
        cached: Option<(usize, Message)>,
    },
}

impl RollbackSnapshot {
    pub fn rollback(self, store: &TimelineStore) {
        match self {
            Self::Reactions {
                channel_id,
                message_id,
                reactions,
            } => {
                store.set_reactions(&channel_id, &message_id, reactions);
            }
            Self::Pin {
                channel_id,
                message_id,
                pinned,
                cached,
            } => {
                if let Some(pinned) = pinned {
                    store.swap_pinned_flag(&channel_id, &message_id, pinned);
                }
                if let Some((index, message)) = cached {
                    store.restore_pinned(&channel_id, index, message);
                }
            }
        }
    }
}

fn validate_content(content: &str, has_attachments: bool) -> Result<(), ValidationError> {
    if content.trim().is_empty() && !has_attachments {
        return Err(ValidationError::EmptyMessage);
    }
    let actual = content.chars().count();
    if actual > MAX_CONTENT_CHARS {
        return Err(ValidationError::ContentTooLong {
            max: MAX_CONTENT_CHARS,
            actual,
        });
    }
    Ok(())
}

impl SyncEngine {
    fn fail(&self, error: TransportError, action: &'static str) -> EngineError {
        let error = EngineError::from_transport(error, 1);
        warn!(action, %error, "mutation: request failed");
        self.report(&error);
        error
    }

    /// Sends a message and merges the confirmed copy. No placeholder is
    /// inserted while the request is in flight.
    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        outgoing: OutgoingMessage,
    ) -> Result<Message, EngineError> {
        validate_content(&outgoing.content, !outgoing.attachment_ids.is_empty())?;
        let envelope = if outgoing.content.is_empty() {
            self.e2ee
                .ensure_sendable(channel_id)
                .await
                .map_err(ValidationError::from)?;
            None
        } else {
            self.e2ee
                .seal_outbound(channel_id, &outgoing.content)
                .await
                .map_err(ValidationError::from)?
        };
        let encrypted = envelope.is_some();

        let request = SendMessageRequest {
            content: if encrypted {
                String::new()
            } else {
                outgoing.content.clone()
            },
            referenced_message_id: outgoing.reply_to.clone(),
            attachment_ids: outgoing.attachment_ids.clone(),
            nonce: Some(Uuid::new_v4().simple().to_string()),
            e2ee: envelope,
        };
        let sent = with_timeout(
            self.settings.request_timeout,
            self.transport.send_message(channel_id, &request),
        )
        .await
        .map_err(|error| self.fail(error, "send"))?;

        let mut message = Message::from_payload(sent);
        if encrypted && message.awaiting_decryption() {
            message.content = Some(outgoing.content.clone());
        }
        let message_id = message.id.clone();
        if self.store.insert_if_absent(channel_id, message.clone()) {
            info!(channel_id = %channel_id, message_id = %message_id, encrypted, "mutation: message sent");
        } else {
            debug!(channel_id = %channel_id, message_id = %message_id, "mutation: push create arrived first");
            if let (true, Some(envelope)) = (encrypted, message.envelope.as_ref()) {
                self.store
                    .finish_decryption(channel_id, &message_id, envelope, outgoing.content);
            }
        }
        Ok(self
            .store
            .message(channel_id, &message_id)
            .unwrap_or(message))
    }

    /// Edits a message. Encrypted channels reject empty content before any
    /// network call.
    pub async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<Message, EngineError> {
        let content = content.into();
        let encrypted = self.e2ee.requires_encryption(channel_id).await;
        if encrypted && content.trim().is_empty() {
            return Err(ValidationError::EmptyEncryptedEdit.into());
        }
        validate_content(&content, true)?;
        let envelope = if encrypted {
            self.e2ee
                .seal_outbound(channel_id, &content)
                .await
                .map_err(ValidationError::from)?
        } else {
            None
        };

        let request = EditMessageRequest {
            content: if envelope.is_some() {
                String::new()
            } else {
                content.clone()
            },
            e2ee: envelope,
        };
        let edited = with_timeout(
            self.settings.request_timeout,
            self.transport.edit_message(channel_id, message_id, &request),
        )
        .await
        .map_err(|error| self.fail(error, "edit"))?;

        let mut message = Message::from_payload(edited);
        if request.e2ee.is_some() && message.awaiting_decryption() {
            message.content = Some(content);
        }
        if !self.store.replace_message(channel_id, message.clone()) {
            debug!(channel_id = %channel_id, message_id = %message_id, "mutation: edited message is not loaded");
        } else if message.awaiting_decryption() {
            self.e2ee
                .schedule(channel_id, pending_decryptions([&message]));
        }
        Ok(message)
    }

    /// Confirmed-only delete. A message the server no longer knows is removed
    /// locally as well.
    pub async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        match with_timeout(
            self.settings.request_timeout,
            self.transport.delete_message(channel_id, message_id),
        )
        .await
        {
            Ok(()) => {}
            Err(TransportError::Conflict(reason)) => {
                info!(channel_id = %channel_id, message_id = %message_id, %reason, "mutation: message already gone");
            }
            Err(error) => return Err(self.fail(error, "delete")),
        }
        self.store.remove(channel_id, message_id);
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), EngineError> {
        self.react(channel_id, message_id, emoji, ReactionDelta::Add)
            .await
    }

    pub async fn remove_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), EngineError> {
        self.react(channel_id, message_id, emoji, ReactionDelta::Remove)
            .await
    }

    async fn react(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
        delta: ReactionDelta,
    ) -> Result<(), EngineError> {
        let snapshot = self
            .store
            .swap_reactions(channel_id, message_id, |current| {
                optimistic_reactions(current, delta, emoji, &self.current_user)
            })
            .map(|reactions| RollbackSnapshot::Reactions {
                channel_id: channel_id.clone(),
                message_id: message_id.clone(),
                reactions,
            });

        let request = match delta {
            ReactionDelta::Add => self.transport.add_reaction(channel_id, message_id, emoji),
            ReactionDelta::Remove => self
                .transport
                .remove_reaction(channel_id, message_id, emoji),
        };
        if let Err(error) = with_timeout(self.settings.request_timeout, request).await {
            if let Some(snapshot) = snapshot {
                warn!(channel_id = %channel_id, message_id = %message_id, emoji, "mutation: rolling back reaction");
                snapshot.rollback(&self.store);
            }
            return Err(self.fail(error, "react"));
        }
        Ok(())
    }

    /// Pins optimistically, then refreshes the pinned list from the server.
    pub async fn pin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        let snapshot = RollbackSnapshot::Pin {
            channel_id: channel_id.clone(),
            message_id: message_id.clone(),
            pinned: self.store.swap_pinned_flag(channel_id, message_id, true),
            cached: None,
        };
        if let Err(error) = with_timeout(
            self.settings.request_timeout,
            self.transport.pin_message(channel_id, message_id),
        )
        .await
        {
            snapshot.rollback(&self.store);
            return Err(self.fail(error, "pin"));
        }

        if let Err(error) = self.load_pins(channel_id).await {
            debug!(channel_id = %channel_id, %error, "mutation: pinned list refresh after pin failed");
        }
        Ok(())
    }

    /// Unpins optimistically and drops the pinned-cache entry right away.
    pub async fn unpin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        // Cache entry first, so a restored entry keeps its pinned flag.
        let cached = self.store.remove_pinned(channel_id, message_id);
        let snapshot = RollbackSnapshot::Pin {
            channel_id: channel_id.clone(),
            message_id: message_id.clone(),
            pinned: self.store.swap_pinned_flag(channel_id, message_id, false),
            cached,
        };
        if let Err(error) = with_timeout(
            self.settings.request_timeout,
            self.transport.unpin_message(channel_id, message_id),
        )
        .await
        {
            snapshot.rollback(&self.store);
            return Err(self.fail(error, "unpin"));
        }
        Ok(())
    }

    /// Refetches the pinned list and aligns every loaded message's pinned
    /// flag with it.
    pub async fn reconcile_pins(&self, channel_id: &ChannelId) -> Result<usize, EngineError> {
        let count = self.load_pins(channel_id).await?;
        let pinned: HashSet<MessageId> = self
            .store
            .pinned(channel_id)
            .iter()
            .map(|message| message.id.clone())
            .collect();
        let changed = self.store.sync_pinned_flags(channel_id, &pinned);
        debug!(channel_id = %channel_id, count, changed, "mutation: pinned flags reconciled");
        Ok(count)
    }

    /// Replaces the pinned cache with the server's list.
    pub async fn load_pins(&self, channel_id: &ChannelId) -> Result<usize, EngineError> {
        let pins = with_timeout(
            self.settings.request_timeout,
            self.transport.fetch_pins(channel_id),
        )
        .await
        .map_err(|error| self.fail(error, "load pins"))?;

        let pinned: Vec<Message> = pins.into_iter().map(Message::from_payload).collect();
        let pending = pending_decryptions(&pinned);
        let count = pinned.len();
        self.store.replace_pinned(channel_id, pinned);
        if !pending.is_empty() {
            self.e2ee.schedule(channel_id, pending);
        }
        info!(channel_id = %channel_id, count, "mutation: pinned list refreshed");
        Ok(count)
    }
}

#[cfg(test)]
#[path = "tests/mutation_tests.rs"]
mod tests;

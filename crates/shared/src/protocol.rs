use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{AttachmentId, ChannelId, MessageId, PollId, UserId};

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RECONNECT: u8 = 7;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

pub const EVENT_MESSAGE_CREATE: &str = "MESSAGE_CREATE";
pub const EVENT_MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
pub const EVENT_MESSAGE_DELETE: &str = "MESSAGE_DELETE";
pub const EVENT_MESSAGE_DELETE_BULK: &str = "MESSAGE_DELETE_BULK";
pub const EVENT_MESSAGE_REACTION_ADD: &str = "MESSAGE_REACTION_ADD";
pub const EVENT_MESSAGE_REACTION_REMOVE: &str = "MESSAGE_REACTION_REMOVE";
pub const EVENT_MESSAGE_REACTION_REMOVE_ALL: &str = "MESSAGE_REACTION_REMOVE_ALL";
pub const EVENT_MESSAGE_PIN_UPDATE: &str = "MESSAGE_PIN_UPDATE";
pub const EVENT_CHANNEL_PINS_UPDATE: &str = "CHANNEL_PINS_UPDATE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorPayload {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub id: AttachmentId,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub emoji: String,
    pub count: u32,
    #[serde(default)]
    pub me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSummary {
    pub id: PollId,
    #[serde(default)]
    pub question: String,
}

/// Opaque encrypted replacement for `content` on peer-to-peer DM channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmE2eeEnvelope {
    pub version: u8,
    pub nonce: String,
    pub ciphertext: String,
    /// JSON ratchet header, present for version 2 envelopes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

/// A message exactly as the server serializes it. Several attributes are
/// emitted under two names; consumers collapse them once at ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: AuthorPayload,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_code: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_message_id: Option<MessageId>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub reactions: Vec<ReactionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2ee: Option<DmE2eeEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<MessageId>,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<AttachmentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2ee: Option<DmE2eeEnvelope>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2ee: Option<DmE2eeEnvelope>,
}

/// Raw gateway frame: `op` selects the frame class, `t`/`d` carry dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeletePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeleteBulkPayload {
    pub channel_id: ChannelId,
    pub ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEventPayload {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionClearPayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinUpdatePayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub pinned: bool,
}

/// Sent on pin and unpin without naming the message; the pin list must be
/// refetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPinsPayload {
    pub channel_id: ChannelId,
}

/// Message-scoped dispatches the timeline engine consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEvent {
    MessageCreate(MessagePayload),
    MessageUpdate(MessagePayload),
    MessageDelete(MessageDeletePayload),
    MessageDeleteBulk(MessageDeleteBulkPayload),
    MessageReactionAdd(ReactionEventPayload),
    MessageReactionRemove(ReactionEventPayload),
    MessageReactionRemoveAll(ReactionClearPayload),
    MessagePinUpdate(PinUpdatePayload),
    ChannelPinsUpdate(ChannelPinsPayload),
}

impl GatewayEvent {
    /// Decodes a dispatch by event name. Names outside the message surface
    /// yield `Ok(None)`.
    pub fn decode_dispatch(name: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
        let event = match name {
            EVENT_MESSAGE_CREATE => Self::MessageCreate(serde_json::from_value(data)?),
            EVENT_MESSAGE_UPDATE => Self::MessageUpdate(serde_json::from_value(data)?),
            EVENT_MESSAGE_DELETE => Self::MessageDelete(serde_json::from_value(data)?),
            EVENT_MESSAGE_DELETE_BULK => Self::MessageDeleteBulk(serde_json::from_value(data)?),
            EVENT_MESSAGE_REACTION_ADD => Self::MessageReactionAdd(serde_json::from_value(data)?),
            EVENT_MESSAGE_REACTION_REMOVE => {
                Self::MessageReactionRemove(serde_json::from_value(data)?)
            }
            EVENT_MESSAGE_REACTION_REMOVE_ALL => {
                Self::MessageReactionRemoveAll(serde_json::from_value(data)?)
            }
            EVENT_MESSAGE_PIN_UPDATE => Self::MessagePinUpdate(serde_json::from_value(data)?),
            EVENT_CHANNEL_PINS_UPDATE => Self::ChannelPinsUpdate(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::MessageCreate(message) | Self::MessageUpdate(message) => &message.channel_id,
            Self::MessageDelete(payload) => &payload.channel_id,
            Self::MessageDeleteBulk(payload) => &payload.channel_id,
            Self::MessageReactionAdd(payload) | Self::MessageReactionRemove(payload) => {
                &payload.channel_id
            }
            Self::MessageReactionRemoveAll(payload) => &payload.channel_id,
            Self::MessagePinUpdate(payload) => &payload.channel_id,
            Self::ChannelPinsUpdate(payload) => &payload.channel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_payload_with_both_field_spellings() {
        let raw = serde_json::json!({
            "id": "1200",
            "channel_id": "77",
            "author": { "id": "5", "username": "alice" },
            "content": "hi",
            "timestamp": "2024-01-01T00:00:00Z",
            "created_at": "2024-01-01T00:00:00Z",
            "type": 0,
            "message_type": 0,
            "pinned": false,
            "attachments": [],
            "reactions": [{ "emoji": "👍", "count": 2, "me": true }]
        });
        let payload: MessagePayload = serde_json::from_value(raw).expect("payload");
        assert_eq!(payload.id, MessageId::from("1200"));
        assert!(payload.timestamp.is_some());
        assert!(payload.created_at.is_some());
        assert_eq!(payload.reactions[0].count, 2);
    }

    #[test]
    fn unknown_dispatch_names_are_skipped() {
        let decoded = GatewayEvent::decode_dispatch("TYPING_START", serde_json::json!({}))
            .expect("decode");
        assert!(decoded.is_none());
    }

    #[test]
    fn decodes_bulk_delete_dispatch() {
        let decoded = GatewayEvent::decode_dispatch(
            EVENT_MESSAGE_DELETE_BULK,
            serde_json::json!({ "channel_id": "3", "ids": ["10", "11"] }),
        )
        .expect("decode")
        .expect("known event");
        assert_eq!(decoded.channel_id(), &ChannelId::from("3"));
        match decoded {
            GatewayEvent::MessageDeleteBulk(payload) => assert_eq!(payload.ids.len(), 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

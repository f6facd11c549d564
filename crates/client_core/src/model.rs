//! Canonical in-memory message shape. Wire payloads are collapsed into it once,
//! at ingestion; nothing past this point looks at alternate field spellings.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, MessageId, MessageKind, PollId, UserId},
    protocol::{AttachmentPayload, DmE2eeEnvelope, MessagePayload, PollSummary, ReactionPayload},
};

pub type Attachment = AttachmentPayload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: String,
    pub count: u32,
    /// Whether the current user is among the reactors.
    pub me: bool,
}

impl From<ReactionPayload> for Reaction {
    fn from(value: ReactionPayload) -> Self {
        Self {
            emoji: value.emoji,
            count: value.count,
            me: value.me,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: Author,
    /// `None` while an encrypted payload is still awaiting decryption.
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub kind: MessageKind,
    pub pinned: bool,
    pub reference_id: Option<MessageId>,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub poll: Option<PollSummary>,
    pub envelope: Option<DmE2eeEnvelope>,
    pub nonce: Option<String>,
}

impl Message {
    pub fn from_payload(payload: MessagePayload) -> Self {
        let envelope = payload.e2ee;
        let content = if envelope.is_some() {
            None
        } else {
            Some(payload.content.unwrap_or_default())
        };
        let kind = payload
            .type_code
            .or(payload.message_type)
            .map(MessageKind::from_code)
            .unwrap_or_default();

        Self {
            id: payload.id,
            channel_id: payload.channel_id,
            author: Author {
                id: payload.author.id,
                username: payload.author.username,
                avatar: payload.author.avatar,
            },
            content,
            created_at: payload
                .timestamp
                .or(payload.created_at)
                .unwrap_or_default(),
            edited_at: payload.edited_timestamp.or(payload.edited_at),
            kind,
            pinned: payload.pinned,
            reference_id: payload.reference_id.or(payload.referenced_message_id),
            attachments: payload.attachments,
            reactions: payload
                .reactions
                .into_iter()
                .filter(|reaction| reaction.count > 0)
                .map(Reaction::from)
                .collect(),
            poll: payload.poll,
            envelope,
            nonce: payload.nonce,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.envelope.is_some()
    }

    pub fn awaiting_decryption(&self) -> bool {
        self.envelope.is_some() && self.content.is_none()
    }

    pub fn poll_id(&self) -> Option<&PollId> {
        self.poll.as_ref().map(|poll| &poll.id)
    }
}

/// Partial update applied by id. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
    pub pinned: Option<bool>,
    pub reactions: Option<Vec<Reaction>>,
}

impl MessagePatch {
    pub fn pinned(pinned: bool) -> Self {
        Self {
            pinned: Some(pinned),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = Some(content.clone());
        }
        if let Some(edited_at) = self.edited_at {
            message.edited_at = Some(edited_at);
        }
        if let Some(pinned) = self.pinned {
            message.pinned = pinned;
        }
        if let Some(reactions) = &self.reactions {
            message.reactions = reactions.clone();
        }
    }
}

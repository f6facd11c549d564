use std::{future::Future, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{DmE2eeEnvelope, EditMessageRequest, MessagePayload, MessageQuery, SendMessageRequest},
};

pub mod config;
pub mod crypto;
pub mod e2ee;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod http;
pub mod model;
pub mod mutations;
pub mod reactions;
pub mod reconciler;
pub mod store;

pub use config::{load_settings, EngineSettings};
pub use crypto::{LocalKeyring, PeerPublicKey, PrivateKey, X25519DmCipher};
pub use e2ee::{E2eePipeline, StaticChannelDirectory};
pub use engine::SyncEngine;
pub use error::{CryptoError, EngineError, ErrorCategory, TransportError, ValidationError};
pub use fetch::{PageOutcome, PageRequest};
pub use gateway::connect_gateway;
pub use http::HttpTransport;
pub use model::{Message, MessagePatch, Reaction};
pub use mutations::OutgoingMessage;
pub use store::{ChannelTimeline, StoreChange, TimelineStore};

/// REST surface the engine consumes. Pages come back newest first.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        query: &MessageQuery,
    ) -> Result<Vec<MessagePayload>, TransportError>;
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload, TransportError>;
    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        request: &EditMessageRequest,
    ) -> Result<MessagePayload, TransportError>;
    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError>;
    async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), TransportError>;
    async fn remove_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), TransportError>;
    async fn pin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError>;
    async fn unpin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError>;
    async fn fetch_pins(&self, channel_id: &ChannelId)
        -> Result<Vec<MessagePayload>, TransportError>;
}

pub struct MissingTransport;

fn transport_unavailable() -> TransportError {
    TransportError::Rejected(ApiError::new(
        ErrorCode::Internal,
        "no message transport configured",
    ))
}

#[async_trait]
impl MessageTransport for MissingTransport {
    async fn fetch_messages(
        &self,
        _channel_id: &ChannelId,
        _query: &MessageQuery,
    ) -> Result<Vec<MessagePayload>, TransportError> {
        Err(transport_unavailable())
    }

    async fn send_message(
        &self,
        _channel_id: &ChannelId,
        _request: &SendMessageRequest,
    ) -> Result<MessagePayload, TransportError> {
        Err(transport_unavailable())
    }

    async fn edit_message(
        &self,
        _channel_id: &ChannelId,
        _message_id: &MessageId,
        _request: &EditMessageRequest,
    ) -> Result<MessagePayload, TransportError> {
        Err(transport_unavailable())
    }

    async fn delete_message(
        &self,
        _channel_id: &ChannelId,
        _message_id: &MessageId,
    ) -> Result<(), TransportError> {
        Err(transport_unavailable())
    }

    async fn add_reaction(
        &self,
        _channel_id: &ChannelId,
        _message_id: &MessageId,
        _emoji: &str,
    ) -> Result<(), TransportError> {
        Err(transport_unavailable())
    }

    async fn remove_reaction(
        &self,
        _channel_id: &ChannelId,
        _message_id: &MessageId,
        _emoji: &str,
    ) -> Result<(), TransportError> {
        Err(transport_unavailable())
    }

    async fn pin_message(
        &self,
        _channel_id: &ChannelId,
        _message_id: &MessageId,
    ) -> Result<(), TransportError> {
        Err(transport_unavailable())
    }

    async fn unpin_message(
        &self,
        _channel_id: &ChannelId,
        _message_id: &MessageId,
    ) -> Result<(), TransportError> {
        Err(transport_unavailable())
    }

    async fn fetch_pins(
        &self,
        _channel_id: &ChannelId,
    ) -> Result<Vec<MessagePayload>, TransportError> {
        Err(transport_unavailable())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    pub peer_public_key: PeerPublicKey,
    pub peer_user_id: UserId,
}

/// Channel metadata lookups needed to decide whether and how to encrypt.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn is_encrypted_dm(&self, channel_id: &ChannelId) -> bool;
    async fn resolve_channel_encryption_context(
        &self,
        channel_id: &ChannelId,
    ) -> Option<EncryptionContext>;
}

/// Every channel is a plaintext channel.
pub struct PlaintextChannels;

#[async_trait]
impl ChannelDirectory for PlaintextChannels {
    async fn is_encrypted_dm(&self, _channel_id: &ChannelId) -> bool {
        false
    }

    async fn resolve_channel_encryption_context(
        &self,
        _channel_id: &ChannelId,
    ) -> Option<EncryptionContext> {
        None
    }
}

pub trait KeyVault: Send + Sync {
    fn is_private_key_unlocked(&self) -> bool;
    fn private_key(&self) -> Option<PrivateKey>;
}

pub struct LockedKeyVault;

impl KeyVault for LockedKeyVault {
    fn is_private_key_unlocked(&self) -> bool {
        false
    }

    fn private_key(&self) -> Option<PrivateKey> {
        None
    }
}

pub trait DmCipher: Send + Sync {
    fn encrypt(
        &self,
        channel_id: &ChannelId,
        plaintext: &str,
        private_key: &PrivateKey,
        peer_public_key: &PeerPublicKey,
        peer_user_id: &UserId,
    ) -> Result<DmE2eeEnvelope, CryptoError>;
    fn decrypt(
        &self,
        channel_id: &ChannelId,
        envelope: &DmE2eeEnvelope,
        private_key: &PrivateKey,
        peer_public_key: &PeerPublicKey,
    ) -> Result<String, CryptoError>;
}

pub struct MissingDmCipher;

impl DmCipher for MissingDmCipher {
    fn encrypt(
        &self,
        _channel_id: &ChannelId,
        _plaintext: &str,
        _private_key: &PrivateKey,
        _peer_public_key: &PeerPublicKey,
        _peer_user_id: &UserId,
    ) -> Result<DmE2eeEnvelope, CryptoError> {
        Err(CryptoError::Encrypt("no DM cipher configured".into()))
    }

    fn decrypt(
        &self,
        _channel_id: &ChannelId,
        _envelope: &DmE2eeEnvelope,
        _private_key: &PrivateKey,
        _peer_public_key: &PeerPublicKey,
    ) -> Result<String, CryptoError> {
        Err(CryptoError::Decrypt("no DM cipher configured".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Dismissible, user-visible notice about a recovered failure.
    Notice {
        category: ErrorCategory,
        message: String,
    },
    GatewayClosed,
}

pub(crate) async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(TransportError::Timeout(limit)))
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

//! Direct-message encryption on the way out and opportunistic decryption on
//! the way in.
//!
//! Outbound sealing fails before any network call when the channel needs
//! encryption and the key or peer context is missing. Inbound envelopes are
//! resolved on background tasks; each one ends with either plaintext or the
//! configured placeholder, never with a retry loop.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, MessageId},
    protocol::DmE2eeEnvelope,
};
use tokio::{sync::broadcast, task::JoinSet};
use tracing::{debug, warn};

use crate::{
    crypto::PrivateKey,
    error::{CryptoError, ErrorCategory},
    model::Message,
    store::TimelineStore,
    ChannelDirectory, ClientEvent, DmCipher, EncryptionContext, KeyVault,
};

const MAX_NONCE_CHARS: usize = 128;
const MAX_CIPHERTEXT_CHARS: usize = 16_384;
const MAX_HEADER_BYTES: usize = 2_048;

pub struct E2eePipeline {
    directory: Arc<dyn ChannelDirectory>,
    vault: Arc<dyn KeyVault>,
    cipher: Arc<dyn DmCipher>,
    store: Arc<TimelineStore>,
    placeholder: String,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<JoinSet<()>>,
}

impl E2eePipeline {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        vault: Arc<dyn KeyVault>,
        cipher: Arc<dyn DmCipher>,
        store: Arc<TimelineStore>,
        placeholder: impl Into<String>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory,
            vault,
            cipher,
            store,
            placeholder: placeholder.into(),
            events,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub async fn requires_encryption(&self, channel_id: &ChannelId) -> bool {
        self.directory.is_encrypted_dm(channel_id).await
    }

    /// Key material for sending on `channel_id`, or `Ok(None)` on a plain
    /// channel. Fails when the channel needs encryption and the key is
    /// locked or the peer key is unknown.
    async fn outbound_keys(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<(PrivateKey, EncryptionContext)>, CryptoError> {
        if !self.requires_encryption(channel_id).await {
            return Ok(None);
        }
        if !self.vault.is_private_key_unlocked() {
            return Err(CryptoError::KeyLocked);
        }
        let context = self
            .directory
            .resolve_channel_encryption_context(channel_id)
            .await
            .ok_or_else(|| CryptoError::MissingPeerKey(channel_id.clone()))?;
        let private_key = self.vault.private_key().ok_or(CryptoError::KeyLocked)?;
        Ok(Some((private_key, context)))
    }

    /// Gate for sends that carry nothing to seal, such as attachment-only
    /// messages.
    pub async fn ensure_sendable(&self, channel_id: &ChannelId) -> Result<(), CryptoError> {
        self.outbound_keys(channel_id).await.map(|_| ())
    }

    /// Encrypts `plaintext` for an encrypted DM channel. Plain channels yield
    /// `Ok(None)`; the caller then sends the plaintext as is.
    pub async fn seal_outbound(
        &self,
        channel_id: &ChannelId,
        plaintext: &str,
    ) -> Result<Option<DmE2eeEnvelope>, CryptoError> {
        let Some((private_key, context)) = self.outbound_keys(channel_id).await? else {
            return Ok(None);
        };
        let envelope = self.cipher.encrypt(
            channel_id,
            plaintext,
            &private_key,
            &context.peer_public_key,
            &context.peer_user_id,
        )?;
        validate_envelope(&envelope)?;
        Ok(Some(envelope))
    }

    /// Resolves one inbound envelope to plaintext.
    pub async fn open(
        &self,
        channel_id: &ChannelId,
        envelope: &DmE2eeEnvelope,
    ) -> Result<String, CryptoError> {
        validate_envelope(envelope)?;
        let private_key = self.vault.private_key().ok_or(CryptoError::KeyLocked)?;
        let context = self
            .directory
            .resolve_channel_encryption_context(channel_id)
            .await
            .ok_or_else(|| CryptoError::MissingPeerKey(channel_id.clone()))?;
        self.cipher
            .decrypt(channel_id, envelope, &private_key, &context.peer_public_key)
    }

    /// Starts background decryption for messages the store holds as pending.
    pub fn schedule(self: &Arc<Self>, channel_id: &ChannelId, pending: Vec<(MessageId, DmE2eeEnvelope)>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}

        for (message_id, envelope) in pending {
            let pipeline = Arc::clone(self);
            let channel_id = channel_id.clone();
            tasks.spawn(async move {
                let content = match pipeline.open(&channel_id, &envelope).await {
                    Ok(plaintext) => plaintext,
                    Err(error) => {
                        warn!(
                            channel_id = %channel_id,
                            message_id = %message_id,
                            %error,
                            "e2ee: decryption unavailable, using placeholder"
                        );
                        let _ = pipeline.events.send(ClientEvent::Notice {
                            category: ErrorCategory::Decryption,
                            message: format!("could not decrypt message {message_id}: {error}"),
                        });
                        pipeline.placeholder.clone()
                    }
                };
                if !pipeline
                    .store
                    .finish_decryption(&channel_id, &message_id, &envelope, content)
                {
                    debug!(
                        channel_id = %channel_id,
                        message_id = %message_id,
                        "e2ee: message resolved or replaced before decryption finished"
                    );
                }
            });
        }
    }

    /// Waits for every scheduled decryption, including ones scheduled while waiting.
    pub async fn settle(&self) {
        loop {
            let mut tasks = std::mem::take(
                &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if tasks.is_empty() {
                return;
            }
            while tasks.join_next().await.is_some() {}
        }
    }

    pub fn abort_all(&self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

/// Ids and envelopes of the messages still waiting for plaintext.
pub(crate) fn pending_decryptions<'a>(
    messages: impl IntoIterator<Item = &'a Message>,
) -> Vec<(MessageId, DmE2eeEnvelope)> {
    messages
        .into_iter()
        .filter(|message| message.awaiting_decryption())
        .filter_map(|message| {
            message
                .envelope
                .clone()
                .map(|envelope| (message.id.clone(), envelope))
        })
        .collect()
}

/// Shape checks applied before the cipher ever sees an envelope.
pub fn validate_envelope(envelope: &DmE2eeEnvelope) -> Result<(), CryptoError> {
    match (envelope.version, envelope.header.as_deref()) {
        (1, None) => {}
        (1, Some(_)) => {
            return Err(CryptoError::InvalidEnvelope(
                "version 1 envelopes carry no header".into(),
            ))
        }
        (2, Some(header)) => {
            if header.len() > MAX_HEADER_BYTES {
                return Err(CryptoError::InvalidEnvelope(format!(
                    "header exceeds {MAX_HEADER_BYTES} bytes"
                )));
            }
            if serde_json::from_str::<serde_json::Value>(header).is_err() {
                return Err(CryptoError::InvalidEnvelope("header is not JSON".into()));
            }
        }
        (2, None) => {
            return Err(CryptoError::InvalidEnvelope(
                "version 2 envelopes require a header".into(),
            ))
        }
        (version, _) => {
            return Err(CryptoError::InvalidEnvelope(format!(
                "unsupported envelope version {version}"
            )))
        }
    }
    check_base64_field("nonce", &envelope.nonce, MAX_NONCE_CHARS)?;
    check_base64_field("ciphertext", &envelope.ciphertext, MAX_CIPHERTEXT_CHARS)
}

fn check_base64_field(name: &str, value: &str, max_chars: usize) -> Result<(), CryptoError> {
    if value.is_empty() {
        return Err(CryptoError::InvalidEnvelope(format!("{name} is empty")));
    }
    if value.len() > max_chars {
        return Err(CryptoError::InvalidEnvelope(format!(
            "{name} exceeds {max_chars} characters"
        )));
    }
    let alphabet = |c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '-' | '_' | '=');
    if !value.chars().all(alphabet) {
        return Err(CryptoError::InvalidEnvelope(format!("{name} is not base64")));
    }
    Ok(())
}

/// Fixed channel metadata, for callers that already know their DM peers.
#[derive(Default)]
pub struct StaticChannelDirectory {
    encrypted: RwLock<HashSet<ChannelId>>,
    contexts: RwLock<HashMap<ChannelId, EncryptionContext>>,
}

impl StaticChannelDirectory {
    /// Marks the channel as an encrypted DM whose peer key is not known yet.
    pub fn mark_encrypted(&self, channel_id: ChannelId) {
        self.encrypted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id);
    }

    pub fn set_context(&self, channel_id: ChannelId, context: EncryptionContext) {
        self.mark_encrypted(channel_id.clone());
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id, context);
    }
}

#[async_trait]
impl ChannelDirectory for StaticChannelDirectory {
    async fn is_encrypted_dm(&self, channel_id: &ChannelId) -> bool {
        self.encrypted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(channel_id)
    }

    async fn resolve_channel_encryption_context(
        &self,
        channel_id: &ChannelId,
    ) -> Option<EncryptionContext> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .cloned()
    }
}

#[cfg(test)]
#[path = "tests/e2ee_tests.rs"]
mod tests;

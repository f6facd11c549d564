use std::{
    collections::VecDeque,
    ops::RangeInclusive,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::DateTime;
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{
        AuthorPayload, DmE2eeEnvelope, EditMessageRequest, MessagePayload, MessageQuery,
        SendMessageRequest,
    },
};
use tokio::sync::oneshot;

use crate::{
    config::EngineSettings,
    crypto::{LocalKeyring, PrivateKey, X25519DmCipher},
    e2ee::StaticChannelDirectory,
    engine::SyncEngine,
    error::TransportError,
    model::Message,
    ClientEvent, DmCipher, EncryptionContext, MessageTransport,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Fetch(ChannelId, MessageQuery),
    Send(ChannelId, SendMessageRequest),
    Edit(ChannelId, MessageId, EditMessageRequest),
    Delete(ChannelId, MessageId),
    AddReaction(ChannelId, MessageId, String),
    RemoveReaction(ChannelId, MessageId, String),
    Pin(ChannelId, MessageId),
    Unpin(ChannelId, MessageId),
    FetchPins(ChannelId),
}

/// Transport double: answers from per-kind queues and records every call.
/// Unscripted acks succeed; unscripted pages are empty.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    calls: Mutex<Vec<Call>>,
    pages: Mutex<VecDeque<Result<Vec<MessagePayload>, TransportError>>>,
    fetch_delay: Mutex<Option<Duration>>,
    replies: Mutex<VecDeque<Result<MessagePayload, TransportError>>>,
    acks: Mutex<VecDeque<Result<(), TransportError>>>,
    pins: Mutex<Vec<MessagePayload>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_page(&self, page: Result<Vec<MessagePayload>, TransportError>) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub(crate) fn push_reply(&self, reply: Result<MessagePayload, TransportError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn push_ack(&self, ack: Result<(), TransportError>) {
        self.acks.lock().unwrap().push_back(ack);
    }

    pub(crate) fn set_pins(&self, pins: Vec<MessagePayload>) {
        *self.pins.lock().unwrap() = pins;
    }

    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    /// The next mutating call parks after recording itself until the returned
    /// sender fires (or is dropped).
    pub(crate) fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn send_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Send(..) | Call::Edit(..)))
            .count()
    }

    pub(crate) async fn wait_for_calls(&self, count: usize) {
        while self.call_count() < count {
            tokio::task::yield_now().await;
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }

    async fn ack(&self, call: Call) -> Result<(), TransportError> {
        self.record(call);
        self.pass_gate().await;
        self.acks.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn reply(&self, call: Call) -> Result<MessagePayload, TransportError> {
        self.record(call);
        self.pass_gate().await;
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted reply".into())))
    }
}

#[async_trait]
impl MessageTransport for ScriptedTransport {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        query: &MessageQuery,
    ) -> Result<Vec<MessagePayload>, TransportError> {
        self.record(Call::Fetch(channel_id.clone(), query.clone()));
        let page = self.pages.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        page
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload, TransportError> {
        self.reply(Call::Send(channel_id.clone(), request.clone())).await
    }

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        request: &EditMessageRequest,
    ) -> Result<MessagePayload, TransportError> {
        self.reply(Call::Edit(channel_id.clone(), message_id.clone(), request.clone()))
            .await
    }

    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.ack(Call::Delete(channel_id.clone(), message_id.clone())).await
    }

    async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        self.ack(Call::AddReaction(channel_id.clone(), message_id.clone(), emoji.into()))
            .await
    }

    async fn remove_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), TransportError> {
        self.ack(Call::RemoveReaction(channel_id.clone(), message_id.clone(), emoji.into()))
            .await
    }

    async fn pin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.ack(Call::Pin(channel_id.clone(), message_id.clone())).await
    }

    async fn unpin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.ack(Call::Unpin(channel_id.clone(), message_id.clone())).await
    }

    async fn fetch_pins(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessagePayload>, TransportError> {
        self.record(Call::FetchPins(channel_id.clone()));
        Ok(self.pins.lock().unwrap().clone())
    }
}

pub(crate) fn channel() -> ChannelId {
    ChannelId::from("100")
}

pub(crate) fn dm_channel() -> ChannelId {
    ChannelId::from("200")
}

pub(crate) fn me() -> UserId {
    UserId::from("1")
}

pub(crate) fn peer() -> UserId {
    UserId::from("2")
}

pub(crate) fn payload(id: u64, channel_id: &ChannelId) -> MessagePayload {
    MessagePayload {
        id: MessageId::new(id.to_string()),
        channel_id: channel_id.clone(),
        author: AuthorPayload {
            id: peer(),
            username: "bob".into(),
            avatar: None,
        },
        content: Some(format!("message {id}")),
        timestamp: DateTime::from_timestamp(1_700_000_000 + id as i64, 0),
        ..MessagePayload::default()
    }
}

/// Server page order: newest first.
pub(crate) fn newest_first(ids: RangeInclusive<u64>, channel_id: &ChannelId) -> Vec<MessagePayload> {
    ids.rev().map(|id| payload(id, channel_id)).collect()
}

pub(crate) fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|message| message.id.to_string()).collect()
}

pub(crate) fn plain_engine(transport: &Arc<ScriptedTransport>) -> Arc<SyncEngine> {
    SyncEngine::new(me(), EngineSettings::default(), transport.clone())
}

/// Drains notices that are already queued.
pub(crate) fn notices(rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

/// Engine wired for encrypted DMs on [`dm_channel`] with real X25519 keys.
pub(crate) struct DmFixture {
    pub engine: Arc<SyncEngine>,
    pub transport: Arc<ScriptedTransport>,
    pub keyring: Arc<LocalKeyring>,
    pub directory: Arc<StaticChannelDirectory>,
    pub local: PrivateKey,
    pub remote: PrivateKey,
}

impl DmFixture {
    pub(crate) fn new(unlocked: bool) -> Self {
        let local = PrivateKey::generate();
        let remote = PrivateKey::generate();
        let transport = ScriptedTransport::new();
        let keyring = Arc::new(LocalKeyring::default());
        if unlocked {
            keyring.unlock(local.clone());
        }
        let directory = Arc::new(StaticChannelDirectory::default());
        directory.set_context(
            dm_channel(),
            EncryptionContext {
                peer_public_key: remote.public_key(),
                peer_user_id: peer(),
            },
        );
        let engine = SyncEngine::new_with_dependencies(
            me(),
            EngineSettings::default(),
            transport.clone(),
            directory.clone(),
            keyring.clone(),
            Arc::new(X25519DmCipher),
        );
        Self {
            engine,
            transport,
            keyring,
            directory,
            local,
            remote,
        }
    }

    /// Envelope as the peer's client would produce it.
    pub(crate) fn peer_envelope(&self, plaintext: &str) -> DmE2eeEnvelope {
        X25519DmCipher
            .encrypt(
                &dm_channel(),
                plaintext,
                &self.remote,
                &self.local.public_key(),
                &me(),
            )
            .expect("peer encrypt")
    }

    pub(crate) fn encrypted_payload(&self, id: u64, plaintext: &str) -> MessagePayload {
        MessagePayload {
            content: Some(String::new()),
            e2ee: Some(self.peer_envelope(plaintext)),
            ..payload(id, &dm_channel())
        }
    }
}

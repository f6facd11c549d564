use std::{collections::HashSet, sync::Arc};

use shared::domain::{ChannelId, MessageId, UserId};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    config::EngineSettings,
    e2ee::E2eePipeline,
    error::EngineError,
    fetch::FetchRegistry,
    model::Message,
    store::{ChannelTimeline, StoreChange, TimelineStore},
    ChannelDirectory, ClientEvent, DmCipher, KeyVault, LockedKeyVault, MessageTransport,
    MissingDmCipher, PlaintextChannels,
};

/// Per-session owner of the timeline store and every operation that touches
/// it. Construct one at login and call [`SyncEngine::shutdown`] at logout.
pub struct SyncEngine {
    pub(crate) store: Arc<TimelineStore>,
    pub(crate) transport: Arc<dyn MessageTransport>,
    pub(crate) e2ee: Arc<E2eePipeline>,
    pub(crate) fetches: FetchRegistry,
    pub(crate) settings: EngineSettings,
    pub(crate) current_user: UserId,
    pub(crate) events: broadcast::Sender<ClientEvent>,
}

impl SyncEngine {
    /// Engine without encryption support: every channel is treated as plaintext.
    pub fn new(
        current_user: UserId,
        settings: EngineSettings,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            current_user,
            settings,
            transport,
            Arc::new(PlaintextChannels),
            Arc::new(LockedKeyVault),
            Arc::new(MissingDmCipher),
        )
    }

    pub fn new_with_dependencies(
        current_user: UserId,
        settings: EngineSettings,
        transport: Arc<dyn MessageTransport>,
        directory: Arc<dyn ChannelDirectory>,
        vault: Arc<dyn KeyVault>,
        cipher: Arc<dyn DmCipher>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let store = Arc::new(TimelineStore::new(settings.event_buffer));
        let e2ee = E2eePipeline::new(
            directory,
            vault,
            cipher,
            Arc::clone(&store),
            settings.decrypt_placeholder.clone(),
            events.clone(),
        );
        info!(user_id = %current_user, page_limit = settings.page_limit, "engine: session started");
        Arc::new(Self {
            store,
            transport,
            e2ee,
            fetches: FetchRegistry::default(),
            settings,
            current_user,
            events,
        })
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<TimelineStore> {
        &self.store
    }

    pub fn messages(&self, channel_id: &ChannelId) -> Arc<Vec<Message>> {
        self.store.get(channel_id)
    }

    pub fn timeline(&self, channel_id: &ChannelId) -> ChannelTimeline {
        self.store.timeline(channel_id)
    }

    pub fn is_loading(&self, channel_id: &ChannelId) -> bool {
        self.store.is_loading(channel_id)
    }

    pub fn has_more(&self, channel_id: &ChannelId) -> bool {
        self.store.has_more(channel_id)
    }

    pub fn pinned(&self, channel_id: &ChannelId) -> Arc<Vec<Message>> {
        self.store.pinned(channel_id)
    }

    pub fn decrypting(&self, channel_id: &ChannelId) -> Arc<HashSet<MessageId>> {
        self.store.decrypting(channel_id)
    }

    /// Store change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    /// User-visible notices.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn report(&self, error: &EngineError) {
        let _ = self.events.send(ClientEvent::Notice {
            category: error.category(),
            message: error.to_string(),
        });
    }

    /// Resolves once every scheduled background decryption has finished.
    pub async fn settle(&self) {
        self.e2ee.settle().await;
    }

    /// Logout: cancels outstanding fetches, abandons pending decryptions and
    /// drops all timeline state.
    pub fn shutdown(&self) {
        info!(user_id = %self.current_user, "engine: shutting down session");
        self.fetches.cancel_all();
        self.e2ee.abort_all();
        self.store.clear();
    }
}

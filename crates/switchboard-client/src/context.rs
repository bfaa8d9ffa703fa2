use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::Viewer;
use crate::backend::{Backend, HttpBackend};
use crate::bus::{ChangeTransport, EventBus};
use crate::composer::Composer;
use crate::config::ClientConfig;
use crate::directory::UserDirectory;
use crate::error::Result;
use crate::feed::NotificationFeed;
use crate::kv::KvStore;
use crate::roster::Roster;
use crate::store::ConversationStore;
use crate::stream::MessageStream;
use crate::transport::WsTransport;

/// Root of the messaging feature. Owns the single bus, key-value store and
/// directory cache, and hands them to every view it opens.
pub struct ClientContext {
    config: ClientConfig,
    viewer: Viewer,
    backend: Arc<dyn Backend>,
    bus: EventBus,
    kv: Arc<KvStore>,
    directory: UserDirectory,
    conversations: ConversationStore,
}

impl ClientContext {
    /// Connect to a switchboard server over HTTP and the WebSocket gateway.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (transport, viewer) = WsTransport::connect(&config.gateway_url, &config.token).await?;
        let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&config.api_url, &config.token));
        let kv = Arc::new(KvStore::open(&config.state_path));
        Self::with_parts(config, viewer, backend, Arc::new(transport), kv).await
    }

    /// Assemble from explicit collaborators.
    pub async fn with_parts(
        config: ClientConfig,
        viewer: Viewer,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn ChangeTransport>,
        kv: Arc<KvStore>,
    ) -> Result<Self> {
        let bus = EventBus::new(transport);
        let directory = UserDirectory::new(backend.clone(), kv.clone(), config.directory_ttl);
        let conversations = ConversationStore::new(backend.clone(), viewer);
        conversations.attach(&bus).await?;
        if let Err(e) = conversations.refresh().await {
            warn!("Initial conversation load failed: {}", e);
        }

        info!("Client ready as {} ({})", viewer.user_id, viewer.role);
        Ok(Self {
            config,
            viewer,
            backend,
            bus,
            kv,
            directory,
            conversations,
        })
    }

    pub fn viewer(&self) -> Viewer {
        self.viewer
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub async fn open_conversation(&self, conversation_id: Uuid) -> Result<MessageStream> {
        MessageStream::open(
            conversation_id,
            self.viewer,
            self.backend.clone(),
            self.conversations.clone(),
            &self.bus,
            self.kv.clone(),
            &self.config.stream,
        )
        .await
    }

    /// End-user entry point: resolve the viewer's own conversation and open it.
    pub async fn open_own_conversation(&self) -> Result<MessageStream> {
        let conversation = self.conversations.resolve_or_create(self.viewer.user_id).await?;
        self.open_conversation(conversation.id).await
    }

    pub fn composer(&self, stream: &MessageStream) -> Composer {
        Composer::new(stream.clone(), self.backend.clone())
    }

    pub async fn notification_feed(&self) -> Result<NotificationFeed> {
        NotificationFeed::mount(
            self.backend.clone(),
            self.viewer,
            &self.bus,
            self.kv.clone(),
            self.directory.clone(),
            &self.config.feed,
        )
        .await
    }

    /// Operator only.
    pub fn roster(&self) -> Result<Roster> {
        Roster::new(self.backend.clone(), self.conversations.clone(), self.directory.clone())
    }

    /// Roster pick: find or create the end-user's conversation, then open it.
    pub async fn open_for_end_user(&self, end_user_id: Uuid) -> Result<MessageStream> {
        let conversation = self.roster()?.select_or_create(end_user_id).await?;
        self.open_conversation(conversation.id).await
    }
}

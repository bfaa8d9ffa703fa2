#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use switchboard_api::error::ApiError;
use switchboard_api::{AppState, AppStateInner};
use switchboard_client::backend::Backend;
use switchboard_client::config::ClientConfig;
use switchboard_client::kv::KvStore;
use switchboard_client::transport::LocalTransport;
use switchboard_client::{ClientContext, ClientError, Result, Viewer};
use switchboard_db::Database;
use switchboard_db::models::now;
use switchboard_gateway::visibility::Visibility;
use switchboard_types::api::Claims;
use switchboard_types::models::{
    ClearMarker, Conversation, InboxMessage, Message, Posting, Resource, Role, UserProfile,
};

pub const WAIT: Duration = Duration::from_secs(3);

/// In-process server: the API state plus its dispatcher.
pub struct Server {
    pub state: AppState,
}

impl Server {
    pub fn new() -> Self {
        let db = Database::open_in_memory().expect("in-memory db");
        Self {
            state: AppStateInner::new(db, "test-secret".into()),
        }
    }

    /// A participant that already exists in the directory.
    pub fn user(&self, name: &str, role: Role) -> Claims {
        let claims = Claims {
            sub: Uuid::new_v4(),
            username: name.into(),
            role,
            exp: usize::MAX,
        };
        self.state
            .db
            .ensure_user(claims.sub, name, role, now())
            .expect("ensure user");
        claims
    }

    /// Client for `claims` wired to this server through its own transport.
    pub async fn client(&self, claims: &Claims) -> Client {
        self.client_with(claims, Arc::new(KvStore::in_memory())).await
    }

    pub async fn client_with(&self, claims: &Claims, kv: Arc<KvStore>) -> Client {
        let transport = Arc::new(LocalTransport::new());
        self.pump(claims, transport.clone());

        let backend = Arc::new(LocalBackend::new(self.state.clone(), claims.clone()));
        let viewer = Viewer::new(claims.sub, claims.role);
        let config = ClientConfig::new("http://127.0.0.1:0", "unused");
        let ctx = ClientContext::with_parts(config, viewer, backend.clone(), transport.clone(), kv)
            .await
            .expect("client context");

        Client {
            ctx,
            backend,
            transport,
        }
    }

    /// Forward dispatcher events the participant may see, like a gateway
    /// session would.
    fn pump(&self, claims: &Claims, transport: Arc<LocalTransport>) {
        let mut rx = self.state.dispatcher.subscribe();
        let mut visibility = Visibility::new(claims.sub, claims.role);
        let db = self.state.db.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let allowed = visibility.allows(&event, |end_user| {
                            db.find_conversation_by_end_user(end_user)
                                .ok()
                                .flatten()
                                .map(|c| c.id)
                        });
                        if allowed {
                            transport.publish(event);
                        }
                    }
                    Err(RecvError::Lagged(_)) => transport.announce_reconnect(),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

pub struct Client {
    pub ctx: ClientContext,
    pub backend: Arc<LocalBackend>,
    pub transport: Arc<LocalTransport>,
}

/// `Backend` calling straight into the server operations, with switches to
/// inject failures.
pub struct LocalBackend {
    state: AppState,
    claims: Claims,
    pub fail_sends: AtomicBool,
    pub fail_mark_read: AtomicBool,
    pub fail_clear_marker: AtomicBool,
    pub resolve_conflicts: AtomicU32,
}

impl LocalBackend {
    pub fn new(state: AppState, claims: Claims) -> Self {
        Self {
            state,
            claims,
            fail_sends: AtomicBool::new(false),
            fail_mark_read: AtomicBool::new(false),
            fail_clear_marker: AtomicBool::new(false),
            resolve_conflicts: AtomicU32::new(0),
        }
    }
}

fn map(e: ApiError) -> ClientError {
    match e {
        ApiError::NotFound => ClientError::NotFound,
        ApiError::Forbidden => ClientError::Forbidden,
        ApiError::Invalid(msg) => ClientError::Backend(msg),
        ApiError::Internal(e) => ClientError::Backend(e.to_string()),
    }
}

fn injected(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        Err(ClientError::Backend("injected failure".into()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn resolve_conversation(&self, end_user_id: Uuid) -> Result<Conversation> {
        let conflicts = self.resolve_conflicts.load(Ordering::SeqCst);
        if conflicts > 0 {
            self.resolve_conflicts.store(conflicts - 1, Ordering::SeqCst);
            // The row exists by the time a conflict is reported
            self.state
                .resolve_conversation(&self.claims, end_user_id)
                .await
                .map_err(map)?;
            return Err(ClientError::Conflict);
        }
        self.state
            .resolve_conversation(&self.claims, end_user_id)
            .await
            .map_err(map)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.state.list_conversations(&self.claims).await.map_err(map)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.state.get_conversation(&self.claims, id).await.map_err(map)
    }

    async fn mark_read(&self, id: Uuid) -> Result<Conversation> {
        injected(&self.fail_mark_read)?;
        self.state.mark_read(&self.claims, id).await.map_err(map)
    }

    async fn touch_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.state.touch_conversation(&self.claims, id).await.map_err(map)
    }

    async fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        self.state
            .list_messages(&self.claims, conversation_id, limit)
            .await
            .map_err(map)
    }

    async fn send_message(&self, conversation_id: Uuid, body: &str) -> Result<Message> {
        injected(&self.fail_sends)?;
        self.state
            .send_message(&self.claims, conversation_id, body)
            .await
            .map_err(map)
    }

    async fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<()> {
        self.state
            .delete_message(&self.claims, conversation_id, message_id)
            .await
            .map_err(map)
    }

    async fn clear_history(&self, conversation_id: Uuid) -> Result<ClearMarker> {
        self.state
            .clear_history(&self.claims, conversation_id)
            .await
            .map_err(map)
    }

    async fn clear_marker(&self, conversation_id: Uuid) -> Result<Option<ClearMarker>> {
        injected(&self.fail_clear_marker)?;
        self.state
            .clear_marker(&self.claims, conversation_id)
            .await
            .map_err(map)
    }

    async fn list_users(&self, role: Option<Role>) -> Result<Vec<UserProfile>> {
        self.state.list_users(&self.claims, role).await.map_err(map)
    }

    async fn get_user(&self, id: Uuid) -> Result<UserProfile> {
        self.state.get_user(&self.claims, id).await.map_err(map)
    }

    async fn recent_postings(&self, limit: u32) -> Result<Vec<Posting>> {
        self.state.recent_postings(limit).await.map_err(map)
    }

    async fn recent_resources(&self, limit: u32) -> Result<Vec<Resource>> {
        self.state.recent_resources(limit).await.map_err(map)
    }

    async fn recent_inbox(&self, limit: u32) -> Result<Vec<InboxMessage>> {
        self.state.recent_inbox(&self.claims, limit).await.map_err(map)
    }
}

/// Poll `cond` until it holds or the wait runs out.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let in-flight events and spawned tasks settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use switchboard_types::events::{Column, Filter, Row, SourceKind};
use switchboard_types::models::Conversation;

use crate::Viewer;
use crate::backend::Backend;
use crate::badge;
use crate::bus::{EventBus, Listener, Subscription};
use crate::error::{ClientError, Result};

struct StoreInner {
    backend: Arc<dyn Backend>,
    viewer: Viewer,
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    /// Bumped on every counter or row change; badges watch it.
    version: watch::Sender<u64>,
    subscription: std::sync::Mutex<Option<Subscription>>,
}

/// Viewer's conversations and their unread counters.
///
/// Realtime rows are applied last-writer-wins on `updated_at`, so a stale or
/// repeated update can never bring back a counter that was already zeroed.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn Backend>, viewer: Viewer) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                backend,
                viewer,
                conversations: RwLock::new(HashMap::new()),
                version,
                subscription: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Follow conversation rows on the bus. Operators follow every row, an
    /// end-user only their own.
    pub async fn attach(&self, bus: &EventBus) -> Result<()> {
        let filter = if self.inner.viewer.is_operator() {
            Filter::All
        } else {
            Filter::eq(Column::EndUserId, self.inner.viewer.user_id)
        };

        let on_row = {
            let weak = Arc::downgrade(&self.inner);
            move |row: &Row| {
                if let (Some(inner), Row::Conversation(c)) = (weak.upgrade(), row) {
                    ConversationStore { inner }.apply_remote(c.clone());
                }
            }
        };
        let weak = Arc::downgrade(&self.inner);
        let listener = Listener::new()
            .on_insert(on_row.clone())
            .on_update(on_row)
            .on_resync(move || spawn_refresh(weak.clone()));

        let sub = bus.subscribe(SourceKind::Conversations, filter, listener).await?;
        if let Ok(mut slot) = self.inner.subscription.lock() {
            *slot = Some(sub);
        }
        Ok(())
    }

    pub fn viewer(&self) -> Viewer {
        self.inner.viewer
    }

    pub fn get(&self, id: Uuid) -> Option<Conversation> {
        self.inner.conversations.read().ok()?.get(&id).cloned()
    }

    /// The end-user's conversation, if known locally.
    pub fn for_end_user(&self, end_user_id: Uuid) -> Option<Conversation> {
        self.inner
            .conversations
            .read()
            .ok()?
            .values()
            .find(|c| c.end_user_id == end_user_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self
            .inner
            .conversations
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        all
    }

    /// Sum of the viewer's unread counters.
    pub fn unread_total(&self) -> u64 {
        badge::unread_total(&self.all(), self.inner.viewer.role)
    }

    pub fn has_unread(&self) -> bool {
        self.unread_total() > 0
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Find-or-create is atomic server-side; on a conflict the row exists, so
    /// one more resolve fetches it.
    pub async fn resolve_or_create(&self, end_user_id: Uuid) -> Result<Conversation> {
        let conversation = match self.inner.backend.resolve_conversation(end_user_id).await {
            Err(ClientError::Conflict) => {
                debug!("Resolve for {} conflicted, re-fetching", end_user_id);
                self.inner.backend.resolve_conversation(end_user_id).await?
            }
            other => other?,
        };
        self.apply_remote(conversation.clone());
        Ok(conversation)
    }

    /// Authoritative reload of every conversation the viewer can see.
    pub async fn refresh(&self) -> Result<Vec<Conversation>> {
        let fresh = self.inner.backend.list_conversations().await?;
        if let Ok(mut map) = self.inner.conversations.write() {
            *map = fresh.iter().map(|c| (c.id, c.clone())).collect();
        }
        self.bump();
        Ok(self.all())
    }

    pub async fn list_for_operator(&self) -> Result<Vec<Conversation>> {
        if !self.inner.viewer.is_operator() {
            return Err(ClientError::Forbidden);
        }
        self.refresh().await
    }

    /// Zero the viewer's own counter. The local counter drops immediately and
    /// is put back if the server write fails.
    pub async fn mark_read(&self, id: Uuid) -> Result<Conversation> {
        let role = self.inner.viewer.role;
        let previous = self.with_row(id, |c| {
            let before = c.unread_for(role);
            c.zero_unread(role);
            before
        });

        match self.inner.backend.mark_read(id).await {
            Ok(conversation) => {
                self.apply_remote(conversation.clone());
                Ok(conversation)
            }
            Err(e) => {
                if let Some(before) = previous.filter(|n| *n > 0) {
                    self.with_row(id, |c| {
                        if c.unread_for(role) == 0 {
                            c.set_unread(role, before);
                        }
                    });
                }
                Err(e)
            }
        }
    }

    pub async fn touch(&self, id: Uuid) -> Result<Conversation> {
        let conversation = self.inner.backend.touch_conversation(id).await?;
        self.apply_remote(conversation.clone());
        Ok(conversation)
    }

    /// Apply a server row unless we already hold a newer one.
    pub fn apply_remote(&self, conversation: Conversation) {
        let applied = match self.inner.conversations.write() {
            Ok(mut map) => {
                let stale = map
                    .get(&conversation.id)
                    .is_some_and(|existing| existing.updated_at >= conversation.updated_at);
                if !stale {
                    map.insert(conversation.id, conversation);
                }
                !stale
            }
            Err(_) => false,
        };
        if applied {
            self.bump();
        }
    }

    fn with_row<T>(&self, id: Uuid, f: impl FnOnce(&mut Conversation) -> T) -> Option<T> {
        let out = {
            let mut map = self.inner.conversations.write().ok()?;
            f(map.get_mut(&id)?)
        };
        self.bump();
        Some(out)
    }

    fn bump(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }
}

fn spawn_refresh(weak: Weak<StoreInner>) {
    let Some(inner) = weak.upgrade() else { return };
    tokio::spawn(async move {
        if let Err(e) = (ConversationStore { inner }).refresh().await {
            warn!("Conversation refresh after reconnect failed: {}", e);
        }
    });
}

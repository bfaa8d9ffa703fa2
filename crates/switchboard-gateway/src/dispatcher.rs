use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::trace;
use uuid::Uuid;

use switchboard_types::events::ChangeEvent;
use switchboard_types::models::Role;

/// Capacity of the change broadcast. Receivers that fall further behind
/// than this lose events and must resync from the store.
const BROADCAST_CAPACITY: usize = 1024;

/// A live gateway connection.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub user_id: Uuid,
    pub role: Role,
}

/// Fans out row changes to every connected gateway session.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for row changes; every connection sees every change
    /// and narrows it down to its own topics
    broadcast_tx: broadcast::Sender<ChangeEvent>,

    /// Connected sessions: conn_id -> session
    sessions: RwLock<HashMap<Uuid, GatewaySession>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to row changes. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Publish a row change to all connected sessions.
    /// Having nobody listening is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        trace!("publish {:?} on {:?}", event.kind, event.row.source());
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection. Returns its conn_id.
    pub async fn register_session(&self, user_id: Uuid, role: Role) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.inner
            .sessions
            .write()
            .await
            .insert(conn_id, GatewaySession { user_id, role });
        conn_id
    }

    pub async fn unregister_session(&self, conn_id: Uuid) {
        self.inner.sessions.write().await.remove(&conn_id);
    }

    /// Number of open gateway connections.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use switchboard_types::events::{ChangeKind, Row};
    use switchboard_types::models::Posting;

    #[tokio::test]
    async fn published_changes_reach_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        dispatcher.publish(ChangeEvent::insert(Row::Posting(Posting {
            id: Uuid::new_v4(),
            title: "Opening".into(),
            summary: None,
            created_at: Utc::now(),
        })));

        assert_eq!(a.recv().await.unwrap().kind, ChangeKind::Insert);
        assert_eq!(b.recv().await.unwrap().kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn sessions_are_tracked_by_connection() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let first = dispatcher.register_session(user, Role::EndUser).await;
        let second = dispatcher.register_session(user, Role::EndUser).await;
        assert_eq!(dispatcher.session_count().await, 2);

        dispatcher.unregister_session(first).await;
        assert_eq!(dispatcher.session_count().await, 1);
        dispatcher.unregister_session(second).await;
        assert_eq!(dispatcher.session_count().await, 0);
    }
}

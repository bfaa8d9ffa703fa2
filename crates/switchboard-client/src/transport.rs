use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use switchboard_types::events::{ChangeEvent, GatewayCommand, GatewayEvent, Topic};

use crate::Viewer;
use crate::bus::{ChangeTransport, TransportEvent};
use crate::error::{ClientError, Result};

const EVENT_CAPACITY: usize = 1024;

/// How long the gateway may take to answer Identify with Ready.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the gateway may take to confirm a Subscribe.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

type Link = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn lock_topics(topics: &Mutex<HashSet<Topic>>) -> Result<std::sync::MutexGuard<'_, HashSet<Topic>>> {
    topics
        .lock()
        .map_err(|e| ClientError::Transport(format!("topic lock poisoned: {}", e)))
}

// -- In-process transport --

/// Transport fed directly by the embedding process. Only changes matching an
/// open topic are forwarded, the same contract the gateway honours.
pub struct LocalTransport {
    events: broadcast::Sender<TransportEvent>,
    topics: Mutex<HashSet<Topic>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            topics: Mutex::new(HashSet::new()),
        }
    }

    pub fn publish(&self, change: ChangeEvent) {
        let wanted = self
            .topics
            .lock()
            .map(|topics| topics.iter().any(|t| t.matches(&change)))
            .unwrap_or(false);
        if wanted {
            let _ = self.events.send(TransportEvent::Change(change));
        }
    }

    pub fn announce_reconnect(&self) {
        let _ = self.events.send(TransportEvent::Reconnected);
    }

    pub fn open_topics(&self) -> Vec<Topic> {
        self.topics
            .lock()
            .map(|topics| topics.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeTransport for LocalTransport {
    async fn open(&self, topic: Topic) -> Result<()> {
        lock_topics(&self.topics)?.insert(topic);
        Ok(())
    }

    async fn close(&self, topic: Topic) -> Result<()> {
        lock_topics(&self.topics)?.remove(&topic);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

// -- WebSocket gateway transport --

/// Callers waiting for the gateway's `Subscribed` for a topic. One ack
/// releases every waiter on that topic.
#[derive(Default)]
struct PendingAcks {
    waiters: Mutex<HashMap<Topic, Vec<oneshot::Sender<()>>>>,
}

impl PendingAcks {
    fn register(&self, topic: Topic) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .map_err(|e| ClientError::Transport(format!("ack lock poisoned: {}", e)))?
            .entry(topic)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn resolve(&self, topic: Topic) {
        let waiters = self
            .waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.remove(&topic))
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Drop waiters whose caller gave up.
    fn forget(&self, topic: Topic) {
        if let Ok(mut waiters) = self.waiters.lock() {
            if let Some(list) = waiters.get_mut(&topic) {
                list.retain(|w| !w.is_closed());
                if list.is_empty() {
                    waiters.remove(&topic);
                }
            }
        }
    }
}

struct WsShared {
    topics: Mutex<HashSet<Topic>>,
    acks: PendingAcks,
    commands: mpsc::UnboundedSender<GatewayCommand>,
    events: broadcast::Sender<TransportEvent>,
}

/// Gateway client. Reconnects with capped exponential backoff, identifies
/// again and reopens every topic, then emits `Reconnected`.
pub struct WsTransport {
    shared: Arc<WsShared>,
    shutdown: watch::Sender<bool>,
}

impl WsTransport {
    /// Connect and identify. Returns once the gateway has confirmed who we are.
    pub async fn connect(url: &str, token: &str) -> Result<(Self, Viewer)> {
        let (link, viewer) = handshake(url, token).await?;
        info!("Gateway ready as {} ({})", viewer.user_id, viewer.role);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(WsShared {
            topics: Mutex::new(HashSet::new()),
            acks: PendingAcks::default(),
            commands,
            events,
        });

        tokio::spawn(run(
            link,
            url.to_string(),
            token.to_string(),
            shared.clone(),
            commands_rx,
            shutdown_rx,
        ));

        Ok((Self { shared, shutdown }, viewer))
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ChangeTransport for WsTransport {
    /// Resolves once the gateway has confirmed the topic, so changes written
    /// after this returns are delivered.
    async fn open(&self, topic: Topic) -> Result<()> {
        let ack = self.shared.acks.register(topic)?;
        lock_topics(&self.shared.topics)?.insert(topic);
        self.shared
            .commands
            .send(GatewayCommand::Subscribe { topic })
            .map_err(|_| ClientError::Closed)?;

        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.acks.forget(topic);
                lock_topics(&self.shared.topics)?.remove(&topic);
                Err(ClientError::Transport(format!("gateway did not confirm {:?}", topic)))
            }
        }
    }

    async fn close(&self, topic: Topic) -> Result<()> {
        lock_topics(&self.shared.topics)?.remove(&topic);
        self.shared
            .commands
            .send(GatewayCommand::Unsubscribe { topic })
            .map_err(|_| ClientError::Closed)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

async fn send_command(link: &mut Link, cmd: &GatewayCommand) -> Result<()> {
    let text = serde_json::to_string(cmd)?;
    link.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

async fn handshake(url: &str, token: &str) -> Result<(Link, Viewer)> {
    let (mut link, _) = connect_async(url).await?;
    send_command(&mut link, &GatewayCommand::Identify { token: token.to_string() }).await?;

    let ready = tokio::time::timeout(READY_TIMEOUT, async {
        while let Some(frame) = link.next().await {
            if let WsMessage::Text(text) = frame? {
                if let Ok(GatewayEvent::Ready { user_id, role }) = serde_json::from_str(text.as_str()) {
                    return Ok(Viewer::new(user_id, role));
                }
            }
        }
        Err(ClientError::Forbidden)
    })
    .await
    .map_err(|_| ClientError::Transport("gateway did not answer Identify".into()))??;

    Ok((link, ready))
}

enum Exit {
    Shutdown,
    Dropped(String),
}

async fn run(
    mut link: Link,
    url: String,
    token: String,
    shared: Arc<WsShared>,
    mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnected = false;

    loop {
        match reopen_topics(&mut link, &shared, &mut commands).await {
            Ok(()) => {
                if reconnected {
                    let _ = shared.events.send(TransportEvent::Reconnected);
                }
                match pump(&mut link, &shared, &mut commands, &mut shutdown).await {
                    Exit::Shutdown => {
                        let _ = link.close(None).await;
                        debug!("Gateway transport shut down");
                        return;
                    }
                    Exit::Dropped(reason) => warn!("Gateway connection dropped: {}", reason),
                }
            }
            Err(e) => warn!("Failed to reopen topics: {}", e),
        }

        link = match reconnect(&url, &token, &mut shutdown).await {
            Some(link) => link,
            None => return,
        };
        reconnected = true;
    }
}

/// Commands queued while the link was down are superseded by the topic set.
async fn reopen_topics(
    link: &mut Link,
    shared: &WsShared,
    commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
) -> Result<()> {
    while commands.try_recv().is_ok() {}

    let topics: Vec<Topic> = lock_topics(&shared.topics)?.iter().copied().collect();
    for topic in topics {
        send_command(link, &GatewayCommand::Subscribe { topic }).await?;
    }
    Ok(())
}

async fn pump(
    link: &mut Link,
    shared: &WsShared,
    commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    loop {
        tokio::select! {
            frame = link.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<GatewayEvent>(text.as_str()) {
                    Ok(GatewayEvent::Change(change)) => {
                        let _ = shared.events.send(TransportEvent::Change(change));
                    }
                    Ok(GatewayEvent::Subscribed { topic }) => {
                        trace!("Gateway opened {:?}", topic);
                        shared.acks.resolve(topic);
                    }
                    Ok(GatewayEvent::Ready { .. }) => {}
                    Err(e) => warn!(
                        "Undecodable gateway frame: {} -- raw: {}",
                        e,
                        text.as_str().chars().take(200).collect::<String>()
                    ),
                },
                Some(Ok(WsMessage::Close(_))) | None => return Exit::Dropped("closed by server".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Exit::Dropped(e.to_string()),
            },
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { return Exit::Shutdown };
                if let Err(e) = send_command(link, &cmd).await {
                    return Exit::Dropped(e.to_string());
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Exit::Shutdown;
                }
            }
        }
    }
}

async fn reconnect(url: &str, token: &str, shutdown: &mut watch::Receiver<bool>) -> Option<Link> {
    let mut attempt: u32 = 0;
    loop {
        let delay = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(BACKOFF_MAX);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
        }

        match handshake(url, token).await {
            Ok((link, _)) => {
                info!("Gateway reconnected after {} attempts", attempt + 1);
                return Some(link);
            }
            Err(e) => {
                debug!("Gateway reconnect attempt {} failed: {}", attempt + 1, e);
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use switchboard_types::events::{Filter, Row, SourceKind};
    use switchboard_types::models::Posting;

    use super::*;

    #[tokio::test]
    async fn local_transport_forwards_only_open_topics() {
        let transport = LocalTransport::new();
        let mut rx = transport.events();
        let posting = Posting {
            id: Uuid::new_v4(),
            title: "t".into(),
            summary: None,
            created_at: Utc::now(),
        };

        transport.publish(ChangeEvent::insert(Row::Posting(posting.clone())));
        assert!(rx.try_recv().is_err());

        transport
            .open(Topic::new(SourceKind::Postings, Filter::All))
            .await
            .unwrap();
        transport.publish(ChangeEvent::insert(Row::Posting(posting)));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Change(_))));
    }

    #[tokio::test]
    async fn an_ack_releases_every_waiter_on_its_topic() {
        let acks = PendingAcks::default();
        let postings = Topic::new(SourceKind::Postings, Filter::All);
        let resources = Topic::new(SourceKind::Resources, Filter::All);

        let first = acks.register(postings).unwrap();
        let second = acks.register(postings).unwrap();
        let mut other = acks.register(resources).unwrap();

        acks.resolve(postings);
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
        assert!(other.try_recv().is_err());

        drop(other);
        acks.forget(resources);
        assert!(acks.waiters.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_is_capped() {
        let delay = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(40)).min(BACKOFF_MAX);
        assert_eq!(delay, BACKOFF_MAX);
    }
}

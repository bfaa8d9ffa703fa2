//! Event bus adapter: per-(source, filter) channels over a change transport,
//! shared by every listener that asks for the same topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use switchboard_types::events::{ChangeEvent, ChangeKind, Filter, Row, SourceKind, Topic};

use crate::error::{ClientError, Result};

/// What a transport hands to the bus.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Change(ChangeEvent),
    /// The link came back after a drop. Anything published in between is lost.
    Reconnected,
}

/// Change-notification link. Opening a topic asks the far side to start
/// delivering it; delivery of everything opened arrives on `events()`.
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    async fn open(&self, topic: Topic) -> Result<()>;
    async fn close(&self, topic: Topic) -> Result<()>;
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

type RowCallback = Arc<dyn Fn(&Row) + Send + Sync>;
type ResyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks for one subscription. Unset callbacks ignore that event kind.
#[derive(Clone, Default)]
pub struct Listener {
    on_insert: Option<RowCallback>,
    on_update: Option<RowCallback>,
    on_delete: Option<RowCallback>,
    on_resync: Option<ResyncCallback>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, f: impl Fn(&Row) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Arc::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Row) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Row) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(f));
        self
    }

    /// Called after the transport reconnects; re-run the authoritative fetch.
    pub fn on_resync(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_resync = Some(Arc::new(f));
        self
    }

    fn deliver(&self, event: &ChangeEvent) {
        let callback = match event.kind {
            ChangeKind::Insert => &self.on_insert,
            ChangeKind::Update => &self.on_update,
            ChangeKind::Delete => &self.on_delete,
        };
        if let Some(f) = callback {
            f(&event.row);
        }
    }
}

#[derive(Default)]
struct Channel {
    listeners: Vec<(u64, Listener)>,
    open: bool,
}

struct BusInner {
    transport: Arc<dyn ChangeTransport>,
    channels: Mutex<HashMap<Topic, Channel>>,
    /// Serializes transport open/close so a close never overtakes a reopen.
    transport_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Start pumping the transport's events into subscribed listeners.
    pub fn new(transport: Arc<dyn ChangeTransport>) -> Self {
        let rx = transport.events();
        let inner = Arc::new(BusInner {
            transport,
            channels: Mutex::new(HashMap::new()),
            transport_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(pump(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub async fn subscribe(&self, source: SourceKind, filter: Filter, listener: Listener) -> Result<Subscription> {
        let topic = Topic::new(source, filter);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let _guard = self.inner.transport_lock.lock().await;
        let needs_open = {
            let mut channels = self.inner.lock_channels()?;
            let channel = channels.entry(topic).or_default();
            channel.listeners.push((id, listener));
            !channel.open
        };

        if needs_open {
            if let Err(e) = self.inner.transport.open(topic).await {
                self.inner.remove_listener(topic, id);
                return Err(e);
            }
            debug!("Opened channel {:?}", topic);
            if let Ok(mut channels) = self.inner.channels.lock() {
                if let Some(channel) = channels.get_mut(&topic) {
                    channel.open = true;
                }
            }
        }

        Ok(Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id: Some(id),
        })
    }

    /// Number of distinct channels currently held open.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl BusInner {
    fn lock_channels(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Topic, Channel>>> {
        self.channels
            .lock()
            .map_err(|e| ClientError::Transport(format!("bus lock poisoned: {}", e)))
    }

    fn remove_listener(&self, topic: Topic, id: u64) {
        if let Ok(mut channels) = self.channels.lock() {
            if let Some(channel) = channels.get_mut(&topic) {
                channel.listeners.retain(|(lid, _)| *lid != id);
            }
        }
    }

    /// Close the topic on the transport if nobody listens any more.
    async fn close_if_idle(&self, topic: Topic) {
        let _guard = self.transport_lock.lock().await;
        let was_open = {
            let Ok(mut channels) = self.channels.lock() else { return };
            let idle = channels.get(&topic).is_some_and(|c| c.listeners.is_empty());
            if !idle {
                return;
            }
            channels.remove(&topic).is_some_and(|c| c.open)
        };

        if was_open {
            if let Err(e) = self.transport.close(topic).await {
                warn!("Failed to close channel {:?}: {}", topic, e);
            } else {
                debug!("Closed channel {:?}", topic);
            }
        }
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let targets: Vec<Listener> = match self.channels.lock() {
            Ok(channels) => channels
                .iter()
                .filter(|(topic, _)| topic.matches(event))
                .flat_map(|(_, channel)| channel.listeners.iter().map(|(_, l)| l.clone()))
                .collect(),
            Err(_) => return,
        };

        trace!("{:?} {:?} -> {} listeners", event.kind, event.row.source(), targets.len());
        for listener in targets {
            listener.deliver(event);
        }
    }

    fn resync(&self) {
        let targets: Vec<ResyncCallback> = match self.channels.lock() {
            Ok(channels) => channels
                .values()
                .flat_map(|channel| channel.listeners.iter().filter_map(|(_, l)| l.on_resync.clone()))
                .collect(),
            Err(_) => return,
        };

        debug!("Transport resync, notifying {} listeners", targets.len());
        for f in targets {
            f();
        }
    }
}

async fn pump(bus: Weak<BusInner>, mut rx: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = rx.recv().await;
        let Some(bus) = bus.upgrade() else { break };

        match event {
            Ok(TransportEvent::Change(change)) => bus.dispatch(&change),
            Ok(TransportEvent::Reconnected) => bus.resync(),
            Err(RecvError::Lagged(n)) => {
                // Dropped events are indistinguishable from a disconnect
                warn!("Event bus lagged by {} events, forcing resync", n);
                bus.resync();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Handle for one listener. Dropping it stops delivery immediately and
/// closes the channel once its last listener is gone.
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: Topic,
    id: Option<u64>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Unsubscribe and wait for the channel teardown to finish.
    pub async fn unsubscribe(mut self) {
        let Some(id) = self.id.take() else { return };
        let Some(bus) = self.bus.upgrade() else { return };
        bus.remove_listener(self.topic, id);
        bus.close_if_idle(self.topic).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else { return };
        let Some(bus) = self.bus.upgrade() else { return };
        bus.remove_listener(self.topic, id);

        let topic = self.topic;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { bus.close_if_idle(topic).await });
        }
    }
}

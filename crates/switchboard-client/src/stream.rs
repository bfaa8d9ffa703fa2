//! Message stream for one open conversation.
//!
//! [`MessageList`] is the pure state machine (`Loading -> Ready`) that every
//! history load, realtime event and optimistic send goes through.
//! [`MessageStream`] wires it to the backend and the event bus and guards
//! every async continuation on the view still being open.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use switchboard_types::events::{ChangeEvent, ChangeKind, Column, Filter, Row, SourceKind};
use switchboard_types::models::{ClearMarker, Conversation, Message};

use crate::Viewer;
use crate::backend::Backend;
use crate::bus::{EventBus, Listener, Subscription};
use crate::config::StreamConfig;
use crate::error::{ClientError, Result};
use crate::kv::KvStore;
use crate::store::ConversationStore;

/// Identity of a list entry. Local ids come from a per-list counter and can
/// never collide with server ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryId {
    Local(u64),
    Server(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub sender_id: Uuid,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    fn confirmed(message: &Message) -> Self {
        Self {
            id: EntryId::Server(message.id),
            sender_id: message.sender_id,
            body: message.body.clone(),
            is_read: message.is_read,
            created_at: message.created_at,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self.id, EntryId::Local(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Loading,
    Ready,
}

/// Outcome of applying one event to the list.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Ignored,
    Buffered,
    Inserted,
    /// An optimistic entry was swapped for its confirmed message in place.
    Replaced,
    Removed,
    ReadFlag,
    /// Counter change for the caller; the list itself is untouched.
    Conversation(Conversation),
}

#[derive(Debug)]
pub struct MessageList {
    conversation_id: Uuid,
    state: StreamState,
    entries: Vec<Entry>,
    pending: Vec<ChangeEvent>,
    deleted: HashSet<Uuid>,
    marker: Option<DateTime<Utc>>,
    tolerance: chrono::Duration,
    next_local: u64,
}

impl MessageList {
    pub fn new(conversation_id: Uuid, tolerance: chrono::Duration) -> Self {
        Self {
            conversation_id,
            state: StreamState::Loading,
            entries: Vec::new(),
            pending: Vec::new(),
            deleted: HashSet::new(),
            marker: None,
            tolerance,
            next_local: 1,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn clear_marker(&self) -> Option<DateTime<Utc>> {
        self.marker
    }

    /// Back to `Loading`; realtime events are held until history lands.
    pub fn begin_loading(&mut self) {
        self.state = StreamState::Loading;
    }

    /// Replace confirmed history with `history`, filtered by the viewer's
    /// clear marker, then replay whatever arrived while loading.
    pub fn load_history(&mut self, history: Vec<Message>, marker: Option<DateTime<Utc>>) -> Vec<Applied> {
        self.marker = marker;

        let optimistic: Vec<Entry> = self.entries.drain(..).filter(Entry::is_optimistic).collect();
        let mut seen = HashSet::new();
        for message in history {
            if message.conversation_id != self.conversation_id
                || self.deleted.contains(&message.id)
                || self.hidden_by_marker(message.created_at)
                || !seen.insert(message.id)
            {
                continue;
            }
            self.insert_sorted(Entry::confirmed(&message));
        }

        // Pending sends stay visible unless their echo is already in history
        for entry in optimistic {
            if let Some(pos) = self.find_duplicate_of(&entry) {
                debug!("Optimistic entry {:?} matched history at {}", entry.id, pos);
                continue;
            }
            self.insert_sorted(entry);
        }

        self.state = StreamState::Ready;
        let pending = std::mem::take(&mut self.pending);
        pending.iter().map(|event| self.apply(event)).collect()
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> Applied {
        if event.conversation_id() != Some(self.conversation_id) {
            return Applied::Ignored;
        }
        if self.state == StreamState::Loading {
            self.pending.push(event.clone());
            return Applied::Buffered;
        }

        match (&event.row, event.kind) {
            (Row::Message(m), ChangeKind::Insert) => self.insert_confirmed(m),
            (Row::Message(m), ChangeKind::Update) => self.update_read_flag(m),
            (Row::Message(m), ChangeKind::Delete) => self.remove(m.id),
            (Row::Conversation(c), ChangeKind::Insert | ChangeKind::Update) => Applied::Conversation(c.clone()),
            _ => Applied::Ignored,
        }
    }

    /// Append a not-yet-confirmed send and return its local id.
    pub fn push_optimistic(&mut self, sender_id: Uuid, body: &str, now: DateTime<Utc>) -> EntryId {
        let id = EntryId::Local(self.next_local);
        self.next_local += 1;
        self.insert_sorted(Entry {
            id,
            sender_id,
            body: body.to_string(),
            is_read: false,
            created_at: now,
        });
        id
    }

    /// Settle an optimistic entry with the server's answer. Converges to one
    /// confirmed entry whether or not the realtime echo got here first.
    pub fn reconcile(&mut self, local: EntryId, confirmed: &Message) -> Applied {
        let local_pos = self.position(local);
        let server_pos = self.position(EntryId::Server(confirmed.id));

        match (local_pos, server_pos) {
            (Some(pos), None) => {
                if self.deleted.contains(&confirmed.id) || self.hidden_by_marker(confirmed.created_at) {
                    self.entries.remove(pos);
                    return Applied::Removed;
                }
                self.entries[pos] = Entry::confirmed(confirmed);
                Applied::Replaced
            }
            (Some(pos), Some(_)) => {
                self.entries.remove(pos);
                Applied::Removed
            }
            (None, Some(_)) => Applied::Ignored,
            (None, None) => self.insert_confirmed(confirmed),
        }
    }

    /// Drop an optimistic entry after a failed send.
    pub fn discard(&mut self, local: EntryId) -> bool {
        match self.position(local) {
            Some(pos) if self.entries[pos].is_optimistic() => {
                self.entries.remove(pos);
                true
            }
            _ => false,
        }
    }

    fn insert_confirmed(&mut self, message: &Message) -> Applied {
        if self.deleted.contains(&message.id) || self.hidden_by_marker(message.created_at) {
            return Applied::Ignored;
        }
        if self.position(EntryId::Server(message.id)).is_some() {
            return Applied::Ignored;
        }

        let entry = Entry::confirmed(message);
        if let Some(pos) = self.find_duplicate_of(&entry) {
            self.entries[pos] = entry;
            return Applied::Replaced;
        }

        self.insert_sorted(entry);
        Applied::Inserted
    }

    fn update_read_flag(&mut self, message: &Message) -> Applied {
        match self.position(EntryId::Server(message.id)) {
            Some(pos) if self.entries[pos].is_read != message.is_read => {
                self.entries[pos].is_read = message.is_read;
                Applied::ReadFlag
            }
            _ => Applied::Ignored,
        }
    }

    fn remove(&mut self, id: Uuid) -> Applied {
        self.deleted.insert(id);
        match self.position(EntryId::Server(id)) {
            Some(pos) => {
                self.entries.remove(pos);
                Applied::Removed
            }
            None => Applied::Ignored,
        }
    }

    /// Same sender, identical body, timestamps within tolerance. Only
    /// optimistic entries are candidates.
    fn find_duplicate_of(&self, entry: &Entry) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.is_optimistic()
                && e.sender_id == entry.sender_id
                && e.body == entry.body
                && (e.created_at - entry.created_at).abs() <= self.tolerance
        })
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    fn hidden_by_marker(&self, created_at: DateTime<Utc>) -> bool {
        self.marker.is_some_and(|marker| created_at <= marker)
    }

    /// Ascending by `created_at`; equal timestamps keep arrival order.
    fn insert_sorted(&mut self, entry: Entry) {
        let pos = self.entries.partition_point(|e| e.created_at <= entry.created_at);
        self.entries.insert(pos, entry);
    }
}

fn marker_key(viewer: Uuid, conversation_id: Uuid) -> String {
    format!("marker:{}:{}", viewer, conversation_id)
}

struct StreamInner {
    conversation_id: Uuid,
    viewer: Viewer,
    backend: Arc<dyn Backend>,
    store: ConversationStore,
    kv: Arc<KvStore>,
    history_limit: u32,
    list: Mutex<MessageList>,
    alive: AtomicBool,
    /// Only the newest reload may land.
    load_generation: AtomicU64,
    version: watch::Sender<u64>,
    conversation: watch::Sender<Option<Conversation>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// An open conversation view.
#[derive(Clone)]
pub struct MessageStream {
    inner: Arc<StreamInner>,
}

impl MessageStream {
    /// Subscribe to the conversation's rows, load history and mark it read.
    pub async fn open(
        conversation_id: Uuid,
        viewer: Viewer,
        backend: Arc<dyn Backend>,
        store: ConversationStore,
        bus: &EventBus,
        kv: Arc<KvStore>,
        config: &StreamConfig,
    ) -> Result<Self> {
        let (version, _) = watch::channel(0);
        let (conversation, _) = watch::channel(store.get(conversation_id));

        let inner = Arc::new(StreamInner {
            conversation_id,
            viewer,
            backend,
            store,
            kv,
            history_limit: config.history_limit,
            list: Mutex::new(MessageList::new(conversation_id, config.duplicate_tolerance)),
            alive: AtomicBool::new(true),
            load_generation: AtomicU64::new(0),
            version,
            conversation,
            subscriptions: Mutex::new(Vec::new()),
        });
        let stream = Self { inner };

        let messages = bus
            .subscribe(
                SourceKind::Messages,
                Filter::eq(Column::ConversationId, conversation_id),
                stream.listener(),
            )
            .await?;
        let conversation_rows = bus
            .subscribe(
                SourceKind::Conversations,
                Filter::eq(Column::Id, conversation_id),
                stream.listener(),
            )
            .await?;
        if let Ok(mut subs) = stream.inner.subscriptions.lock() {
            subs.push(messages);
            subs.push(conversation_rows);
        }

        stream.reload().await?;
        stream.spawn_mark_read();
        Ok(stream)
    }

    fn listener(&self) -> Listener {
        let weak = Arc::downgrade(&self.inner);
        let on = move |kind: ChangeKind| {
            let weak = weak.clone();
            move |row: &Row| {
                if let Some(inner) = weak.upgrade() {
                    MessageStream { inner }.on_event(ChangeEvent {
                        kind,
                        row: row.clone(),
                    });
                }
            }
        };
        let resync = Arc::downgrade(&self.inner);
        Listener::new()
            .on_insert(on(ChangeKind::Insert))
            .on_update(on(ChangeKind::Update))
            .on_delete(on(ChangeKind::Delete))
            .on_resync(move || spawn_reload(resync.clone()))
    }

    pub fn conversation_id(&self) -> Uuid {
        self.inner.conversation_id
    }

    pub fn viewer(&self) -> Viewer {
        self.inner.viewer
    }

    pub fn is_open(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StreamState {
        self.read_list(|list| list.state()).unwrap_or(StreamState::Loading)
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.read_list(|list| list.entries().to_vec()).unwrap_or_default()
    }

    pub fn clear_marker(&self) -> Option<DateTime<Utc>> {
        self.read_list(|list| list.clear_marker()).flatten()
    }

    /// Bumped on every list change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Latest conversation row seen by this view, for counter display.
    pub fn conversation_updates(&self) -> watch::Receiver<Option<Conversation>> {
        self.inner.conversation.subscribe()
    }

    /// Authoritative history fetch with the viewer's current clear marker.
    pub async fn reload(&self) -> Result<()> {
        let generation = self.inner.load_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.with_list(|list| list.begin_loading());

        let marker = self.fetch_marker().await;
        let history = self
            .inner
            .backend
            .list_messages(self.inner.conversation_id, self.inner.history_limit)
            .await;
        self.ensure_open()?;
        if self.inner.load_generation.load(Ordering::Acquire) != generation {
            debug!("Discarding superseded history load for {}", self.inner.conversation_id);
            return Ok(());
        }

        let history = match history {
            Ok(history) => history,
            Err(e) => {
                warn!("History load for {} failed: {}", self.inner.conversation_id, e);
                Vec::new()
            }
        };

        let replayed = self.with_list(|list| list.load_history(history, marker));
        for applied in replayed.unwrap_or_default() {
            self.after_apply(applied, None);
        }
        self.bump();
        Ok(())
    }

    /// Server marker first, the locally cached one if that read fails.
    async fn fetch_marker(&self) -> Option<DateTime<Utc>> {
        let key = marker_key(self.inner.viewer.user_id, self.inner.conversation_id);
        match self.inner.backend.clear_marker(self.inner.conversation_id).await {
            Ok(Some(marker)) => {
                self.inner.kv.set(&key, &marker.cleared_at);
                Some(marker.cleared_at)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Clear marker fetch failed, using cached value: {}", e);
                self.inner.kv.get(&key)
            }
        }
    }

    /// Hide everything up to now for this viewer only, then reload.
    pub async fn clear_history(&self) -> Result<ClearMarker> {
        let marker = self.inner.backend.clear_history(self.inner.conversation_id).await?;
        self.ensure_open()?;
        self.inner.kv.set(
            &marker_key(self.inner.viewer.user_id, self.inner.conversation_id),
            &marker.cleared_at,
        );
        self.reload().await?;
        Ok(marker)
    }

    /// Hard delete for both sides. The delete event would remove it anyway;
    /// applying it now keeps the view responsive.
    pub async fn delete_message(&self, message_id: Uuid) -> Result<()> {
        self.inner
            .backend
            .delete_message(self.inner.conversation_id, message_id)
            .await?;
        self.ensure_open()?;

        let removed = self.with_list(|list| {
            let entry = list
                .entries()
                .iter()
                .find(|e| e.id == EntryId::Server(message_id))
                .cloned();
            entry.map(|e| {
                list.apply(&ChangeEvent::delete(Row::Message(Message {
                    id: message_id,
                    conversation_id: self.inner.conversation_id,
                    sender_id: e.sender_id,
                    body: e.body,
                    is_read: e.is_read,
                    created_at: e.created_at,
                })))
            })
        });
        if matches!(removed.flatten(), Some(Applied::Removed)) {
            self.bump();
        }
        Ok(())
    }

    /// Stop listening now. In-flight work finishes but lands nowhere.
    pub fn close(&self) {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut subs) = self.inner.subscriptions.lock() {
            subs.clear();
        }
        debug!("Closed stream for {}", self.inner.conversation_id);
    }

    pub(crate) fn push_optimistic(&self, body: &str) -> Option<EntryId> {
        let viewer = self.inner.viewer.user_id;
        let id = self.with_list(|list| list.push_optimistic(viewer, body, Utc::now()))?;
        self.bump();
        Some(id)
    }

    pub(crate) fn reconcile(&self, local: EntryId, confirmed: &Message) {
        if let Some(applied) = self.with_list(|list| list.reconcile(local, confirmed)) {
            if applied != Applied::Ignored {
                self.bump();
            }
        }
    }

    pub(crate) fn discard(&self, local: EntryId) {
        if self.with_list(|list| list.discard(local)) == Some(true) {
            self.bump();
        }
    }

    fn on_event(&self, event: ChangeEvent) {
        let from_other_side = match &event.row {
            Row::Message(m) => event.kind == ChangeKind::Insert && m.sender_id != self.inner.viewer.user_id,
            _ => false,
        };
        if let Some(applied) = self.with_list(|list| list.apply(&event)) {
            self.after_apply(applied, Some(from_other_side));
        }
    }

    fn after_apply(&self, applied: Applied, from_other_side: Option<bool>) {
        match applied {
            Applied::Ignored | Applied::Buffered => {}
            Applied::Conversation(conversation) => {
                self.inner.store.apply_remote(conversation.clone());
                self.inner.conversation.send_replace(Some(conversation));
            }
            Applied::Inserted | Applied::Replaced => {
                self.bump();
                // A message from the other side while open is read by definition
                if from_other_side.unwrap_or(false) {
                    self.spawn_mark_read();
                }
            }
            Applied::Removed | Applied::ReadFlag => self.bump(),
        }
    }

    /// Background mark-read. Failures are only logged; the next open retries.
    fn spawn_mark_read(&self) {
        if !self.is_open() {
            return;
        }
        let stream = self.clone();
        tokio::spawn(async move {
            match stream.inner.store.mark_read(stream.inner.conversation_id).await {
                Ok(conversation) => {
                    if stream.is_open() {
                        stream.inner.conversation.send_replace(Some(conversation));
                    }
                }
                Err(e) => warn!("Mark read for {} failed: {}", stream.inner.conversation_id, e),
            }
        });
    }

    fn read_list<T>(&self, f: impl FnOnce(&MessageList) -> T) -> Option<T> {
        let list = self.inner.list.lock().ok()?;
        Some(f(&list))
    }

    /// Mutations only land while the view is open.
    fn with_list<T>(&self, f: impl FnOnce(&mut MessageList) -> T) -> Option<T> {
        if !self.is_open() {
            return None;
        }
        let mut list = self.inner.list.lock().ok()?;
        Some(f(&mut list))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() { Ok(()) } else { Err(ClientError::Closed) }
    }

    fn bump(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }
}

fn spawn_reload(weak: Weak<StreamInner>) {
    let Some(inner) = weak.upgrade() else { return };
    let stream = MessageStream { inner };
    if !stream.is_open() {
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = stream.reload().await {
            debug!("Reload after reconnect abandoned: {}", e);
        }
    });
}

//! Unified notification feed: recent postings, resources and received
//! messages merged into one capped list, with viewer-local seen/cleared
//! thresholds driving the bell badge.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use switchboard_types::events::{Filter, Row, SourceKind};
use switchboard_types::models::{InboxMessage, Message, Posting, Resource, UserProfile};

use crate::Viewer;
use crate::backend::Backend;
use crate::badge;
use crate::bus::{EventBus, Listener, Subscription};
use crate::config::FeedConfig;
use crate::directory::UserDirectory;
use crate::error::Result;
use crate::kv::KvStore;

const SUBTITLE_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Posting,
    Resource,
    Message,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Posting => "posting",
            Self::Resource => "resource",
            Self::Message => "message",
        })
    }
}

/// Feed row synthesized from a source event. Never stored server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationItem {
    /// `kind:source_id`, unique across kinds.
    pub id: String,
    pub kind: NotificationKind,
    pub source_id: Uuid,
    pub title: String,
    pub subtitle: String,
    pub at: DateTime<Utc>,
}

impl NotificationItem {
    fn new(kind: NotificationKind, source_id: Uuid, title: String, subtitle: String, at: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}:{}", kind, source_id),
            kind,
            source_id,
            title,
            subtitle,
            at,
        }
    }

    pub fn from_posting(posting: &Posting) -> Self {
        Self::new(
            NotificationKind::Posting,
            posting.id,
            posting.title.clone(),
            posting.summary.clone().unwrap_or_else(|| "New posting".into()),
            posting.created_at,
        )
    }

    pub fn from_resource(resource: &Resource) -> Self {
        Self::new(
            NotificationKind::Resource,
            resource.id,
            resource.name.clone(),
            resource
                .description
                .clone()
                .unwrap_or_else(|| "Now available".into()),
            resource.created_at,
        )
    }

    pub fn from_message(message: &Message, sender_name: &str) -> Self {
        Self::new(
            NotificationKind::Message,
            message.id,
            sender_name.to_string(),
            message.body.chars().take(SUBTITLE_LEN).collect(),
            message.created_at,
        )
    }

    pub fn from_inbox(inbox: &InboxMessage) -> Self {
        Self::from_message(&inbox.message, &inbox.sender_name)
    }
}

/// Viewer-local thresholds. Items at or before `cleared_after` are dropped;
/// items at or before `seen_after` stay listed but no longer light the badge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedThresholds {
    pub cleared_after: Option<DateTime<Utc>>,
    pub seen_after: Option<DateTime<Utc>>,
}

impl FeedThresholds {
    /// `max(cleared_after, seen_after)`; the badge threshold.
    pub fn effective(&self) -> Option<DateTime<Utc>> {
        self.cleared_after.max(self.seen_after)
    }

    pub fn is_cleared(&self, at: DateTime<Utc>) -> bool {
        self.cleared_after.is_some_and(|t| at <= t)
    }
}

/// Pure feed list: sorted newest first, unique ids, capped.
///
/// A fetch snapshot can predate realtime items that land while it is in
/// flight, so those are held in `pending` and merged back when the load
/// completes. Only the newest load may land.
#[derive(Debug, Clone)]
pub struct FeedState {
    items: Vec<NotificationItem>,
    cap: usize,
    pending: Vec<NotificationItem>,
    started: u64,
    landed: u64,
}

impl FeedState {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            cap,
            pending: Vec::new(),
            started: 0,
            landed: 0,
        }
    }

    fn is_loading(&self) -> bool {
        self.landed < self.started
    }

    /// Mark a fetch as started and return its generation.
    pub fn begin_load(&mut self) -> u64 {
        self.started += 1;
        self.started
    }

    /// Land the fetch of `generation`, merged with whatever arrived in the
    /// meantime. Returns false for a superseded fetch, which changes nothing.
    pub fn finish_load(
        &mut self,
        generation: u64,
        mut fetched: Vec<NotificationItem>,
        thresholds: &FeedThresholds,
    ) -> bool {
        if generation != self.started {
            return false;
        }
        self.landed = generation;
        fetched.append(&mut self.pending);
        self.replace(fetched, thresholds);
        true
    }

    pub fn items(&self) -> &[NotificationItem] {
        &self.items
    }

    /// Rebuild from a fresh fetch of every source.
    pub fn replace(&mut self, items: Vec<NotificationItem>, thresholds: &FeedThresholds) {
        let mut seen = HashSet::new();
        let mut items: Vec<NotificationItem> = items
            .into_iter()
            .filter(|item| !thresholds.is_cleared(item.at))
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        items.sort_by(|a, b| b.at.cmp(&a.at));
        items.truncate(self.cap);
        self.items = items;
    }

    /// Merge one realtime item. Returns whether the list changed.
    pub fn ingest(&mut self, item: NotificationItem, thresholds: &FeedThresholds) -> bool {
        if thresholds.is_cleared(item.at) {
            return false;
        }
        if self.is_loading() {
            self.pending.push(item.clone());
        }
        if self.items.iter().any(|i| i.id == item.id) {
            return false;
        }

        let pos = self.items.partition_point(|i| i.at >= item.at);
        if pos >= self.cap {
            return false;
        }
        self.items.insert(pos, item);
        self.items.truncate(self.cap);
        true
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.pending.clear();
    }

    pub fn has_unseen(&self, thresholds: &FeedThresholds) -> bool {
        badge::has_unseen(self.items.iter().map(|i| i.at), thresholds.effective())
    }
}

struct FeedInner {
    backend: Arc<dyn Backend>,
    viewer: Viewer,
    kv: Arc<KvStore>,
    directory: UserDirectory,
    per_source: u32,
    /// The one authoritative copy; realtime callbacks read it at apply time.
    thresholds: RwLock<FeedThresholds>,
    state: Mutex<FeedState>,
    alive: AtomicBool,
    version: watch::Sender<u64>,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[derive(Clone)]
pub struct NotificationFeed {
    inner: Arc<FeedInner>,
}

impl NotificationFeed {
    /// Restore thresholds, subscribe to every source and run the first fetch.
    pub async fn mount(
        backend: Arc<dyn Backend>,
        viewer: Viewer,
        bus: &EventBus,
        kv: Arc<KvStore>,
        directory: UserDirectory,
        config: &FeedConfig,
    ) -> Result<Self> {
        let thresholds = FeedThresholds {
            cleared_after: kv.get(&threshold_key(viewer, "cleared_after")),
            seen_after: kv.get(&threshold_key(viewer, "seen_after")),
        };
        let (version, _) = watch::channel(0);

        let feed = Self {
            inner: Arc::new(FeedInner {
                backend,
                viewer,
                kv,
                directory,
                per_source: config.per_source,
                thresholds: RwLock::new(thresholds),
                state: Mutex::new(FeedState::new(config.cap)),
                alive: AtomicBool::new(true),
                version,
                subscriptions: Mutex::new(Vec::new()),
            }),
        };

        let mut subs = Vec::with_capacity(3);
        for source in [SourceKind::Postings, SourceKind::Resources, SourceKind::Messages] {
            subs.push(bus.subscribe(source, Filter::All, feed.listener()).await?);
        }
        if let Ok(mut slot) = feed.inner.subscriptions.lock() {
            *slot = subs;
        }

        feed.load().await;
        Ok(feed)
    }

    fn listener(&self) -> Listener {
        let weak = Arc::downgrade(&self.inner);
        let resync = weak.clone();
        Listener::new()
            .on_insert(move |row| {
                if let Some(inner) = weak.upgrade() {
                    NotificationFeed { inner }.on_insert(row);
                }
            })
            .on_resync(move || spawn_load(resync.clone()))
    }

    /// Concurrent fetch of the latest window of each source. A failing source
    /// just contributes nothing.
    pub async fn load(&self) {
        let generation = match self.inner.state.lock() {
            Ok(mut state) => state.begin_load(),
            Err(_) => return,
        };
        let n = self.inner.per_source;
        let backend = &self.inner.backend;
        let (postings, resources, inbox) = tokio::join!(
            backend.recent_postings(n),
            backend.recent_resources(n),
            backend.recent_inbox(n),
        );

        let mut items = Vec::new();
        match postings {
            Ok(rows) => items.extend(rows.iter().map(NotificationItem::from_posting)),
            Err(e) => warn!("Feed: postings unavailable: {}", e),
        }
        match resources {
            Ok(rows) => items.extend(rows.iter().map(NotificationItem::from_resource)),
            Err(e) => warn!("Feed: resources unavailable: {}", e),
        }
        match inbox {
            Ok(rows) => items.extend(rows.iter().map(NotificationItem::from_inbox)),
            Err(e) => warn!("Feed: messages unavailable: {}", e),
        }

        if !self.is_open() {
            return;
        }
        let thresholds = self.thresholds();
        let landed = self
            .inner
            .state
            .lock()
            .map(|mut state| state.finish_load(generation, items, &thresholds))
            .unwrap_or(false);
        if landed {
            self.bump();
        } else {
            debug!("Discarding superseded feed load");
        }
    }

    fn on_insert(&self, row: &Row) {
        match row {
            Row::Posting(p) => self.ingest(NotificationItem::from_posting(p)),
            Row::Resource(r) => self.ingest(NotificationItem::from_resource(r)),
            Row::Message(m) if m.sender_id != self.inner.viewer.user_id => {
                let feed = self.clone();
                let message = m.clone();
                tokio::spawn(async move {
                    let sender = feed.inner.directory.profile(message.sender_id).await;
                    if !received_by(feed.inner.viewer, sender.as_ref()) {
                        debug!("Feed: skipping message {} from own side", message.id);
                        return;
                    }
                    let name = sender.map_or_else(|| "Unknown".to_string(), |p| p.display_name);
                    feed.ingest(NotificationItem::from_message(&message, &name));
                });
            }
            _ => {}
        }
    }

    fn ingest(&self, item: NotificationItem) {
        if !self.is_open() {
            return;
        }
        let thresholds = self.thresholds();
        let changed = self
            .inner
            .state
            .lock()
            .map(|mut state| state.ingest(item, &thresholds))
            .unwrap_or(false);
        if changed {
            self.bump();
        }
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        self.inner
            .state
            .lock()
            .map(|state| state.items().to_vec())
            .unwrap_or_default()
    }

    pub fn thresholds(&self) -> FeedThresholds {
        self.inner.thresholds.read().map(|t| *t).unwrap_or_default()
    }

    pub fn has_unseen(&self) -> bool {
        let thresholds = self.thresholds();
        self.inner
            .state
            .lock()
            .map(|state| state.has_unseen(&thresholds))
            .unwrap_or(false)
    }

    /// Opening the feed hides the badge; items stay.
    pub fn open(&self) {
        self.open_at(Utc::now());
    }

    pub fn open_at(&self, now: DateTime<Utc>) {
        self.set_threshold("seen_after", now, |t| t.seen_after = Some(now));
        self.bump();
    }

    /// Drop everything up to now; only newer items will show up again.
    pub fn clear(&self) {
        self.clear_at(Utc::now());
    }

    pub fn clear_at(&self, now: DateTime<Utc>) {
        self.set_threshold("cleared_after", now, |t| t.cleared_after = Some(now));
        if let Ok(mut state) = self.inner.state.lock() {
            state.clear();
        }
        self.bump();
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.inner.alive.swap(false, Ordering::AcqRel) {
            if let Ok(mut subs) = self.inner.subscriptions.lock() {
                subs.clear();
            }
        }
    }

    /// Update the cell first, then persist.
    fn set_threshold(&self, name: &str, now: DateTime<Utc>, update: impl FnOnce(&mut FeedThresholds)) {
        if let Ok(mut thresholds) = self.inner.thresholds.write() {
            update(&mut thresholds);
        }
        self.inner.kv.set(&threshold_key(self.inner.viewer, name), &now);
        debug!("Feed {} set to {}", name, now);
    }

    fn bump(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }
}

/// A message counts as received when it came from the other side: operators
/// receive what end-users write, end-users receive what operators write. An
/// end-user's own thread has no other senders, so an unknown sender still
/// counts for them; operators need the sender's role to tell.
fn received_by(viewer: Viewer, sender: Option<&UserProfile>) -> bool {
    match sender {
        Some(profile) => profile.role != viewer.role,
        None => !viewer.is_operator(),
    }
}

fn threshold_key(viewer: Viewer, name: &str) -> String {
    format!("feed:{}:{}", viewer.user_id, name)
}

fn spawn_load(weak: Weak<FeedInner>) {
    let Some(inner) = weak.upgrade() else { return };
    let feed = NotificationFeed { inner };
    tokio::spawn(async move { feed.load().await });
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, m, 0).unwrap()
    }

    fn posting(title: &str, created_at: DateTime<Utc>) -> NotificationItem {
        NotificationItem::from_posting(&Posting {
            id: Uuid::new_v4(),
            title: title.into(),
            summary: None,
            created_at,
        })
    }

    #[test]
    fn effective_threshold_is_the_later_one() {
        let t = FeedThresholds {
            cleared_after: Some(at(10, 0)),
            seen_after: Some(at(9, 0)),
        };
        assert_eq!(t.effective(), Some(at(10, 0)));
        assert_eq!(FeedThresholds::default().effective(), None);
        let only_seen = FeedThresholds {
            cleared_after: None,
            seen_after: Some(at(9, 0)),
        };
        assert_eq!(only_seen.effective(), Some(at(9, 0)));
    }

    #[test]
    fn cleared_and_seen_thresholds() {
        let (t1, t2, t3) = (at(10, 1), at(10, 2), at(10, 3));
        let thresholds = FeedThresholds {
            cleared_after: Some(t1),
            seen_after: Some(t2),
        };

        let mut state = FeedState::new(8);
        state.replace(vec![posting("one", t1), posting("two", t2), posting("three", t3)], &thresholds);

        let shown: Vec<DateTime<Utc>> = state.items().iter().map(|i| i.at).collect();
        assert_eq!(shown, vec![t3, t2]);
        assert!(state.has_unseen(&thresholds));

        state.replace(vec![posting("one", t1), posting("two", t2)], &thresholds);
        assert!(!state.has_unseen(&thresholds));
    }

    #[test]
    fn merge_sorts_dedupes_and_caps() {
        let mut state = FeedState::new(3);
        let dup = posting("dup", at(9, 5));
        state.replace(
            vec![
                posting("a", at(9, 1)),
                dup.clone(),
                dup.clone(),
                posting("b", at(9, 3)),
                posting("c", at(9, 4)),
            ],
            &FeedThresholds::default(),
        );

        let titles: Vec<&str> = state.items().iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["dup", "c", "b"]);

        assert!(!state.ingest(dup, &FeedThresholds::default()));
        assert!(!state.ingest(posting("old", at(8, 0)), &FeedThresholds::default()));
        assert!(state.ingest(posting("new", at(9, 9)), &FeedThresholds::default()));
        let titles: Vec<&str> = state.items().iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["new", "dup", "c"]);
    }

    #[test]
    fn clear_drops_older_items_for_good() {
        let mut state = FeedState::new(8);
        state.replace(vec![posting("early", at(10, 3))], &FeedThresholds::default());

        state.clear();
        let thresholds = FeedThresholds {
            cleared_after: Some(at(10, 5)),
            seen_after: None,
        };
        assert!(!state.ingest(posting("early again", at(10, 3)), &thresholds));
        assert!(state.items().is_empty());
        assert!(!state.has_unseen(&thresholds));

        assert!(state.ingest(posting("late", at(10, 6)), &thresholds));
        assert!(state.has_unseen(&thresholds));
    }

    #[test]
    fn items_arriving_during_a_load_survive_it() {
        let thresholds = FeedThresholds::default();
        let mut state = FeedState::new(8);
        let generation = state.begin_load();

        // Snapshot was taken before this one existed
        let live = posting("live", at(10, 9));
        assert!(state.ingest(live.clone(), &thresholds));
        assert!(state.has_unseen(&thresholds));

        assert!(state.finish_load(generation, vec![posting("old", at(10, 0))], &thresholds));
        let titles: Vec<&str> = state.items().iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["live", "old"]);
        assert!(state.has_unseen(&thresholds));

        // Once landed, nothing is held back for the next load
        let next = state.begin_load();
        assert!(state.finish_load(next, vec![live], &thresholds));
        assert_eq!(state.items().len(), 1);
    }

    #[test]
    fn superseded_loads_are_dropped() {
        let thresholds = FeedThresholds::default();
        let mut state = FeedState::new(8);
        let first = state.begin_load();
        let second = state.begin_load();

        assert!(state.ingest(posting("live", at(10, 9)), &thresholds));
        assert!(!state.finish_load(first, vec![], &thresholds));
        assert_eq!(state.items().len(), 1);

        assert!(state.finish_load(second, vec![posting("old", at(10, 0))], &thresholds));
        assert_eq!(state.items().len(), 2);
    }

    #[test]
    fn only_the_other_side_counts_as_received() {
        use switchboard_types::models::Role;

        let profile = |role| UserProfile {
            id: Uuid::new_v4(),
            display_name: "x".into(),
            avatar_ref: None,
            role,
            created_at: at(9, 0),
        };
        let operator = Viewer::new(Uuid::new_v4(), Role::Operator);
        let end_user = Viewer::new(Uuid::new_v4(), Role::EndUser);

        assert!(received_by(operator, Some(&profile(Role::EndUser))));
        assert!(!received_by(operator, Some(&profile(Role::Operator))));
        assert!(!received_by(operator, None));
        assert!(received_by(end_user, Some(&profile(Role::Operator))));
        assert!(received_by(end_user, None));
    }

    #[test]
    fn synthetic_ids_are_kind_scoped() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let p = NotificationItem::from_posting(&Posting {
            id,
            title: "t".into(),
            summary: None,
            created_at: now,
        });
        let r = NotificationItem::from_resource(&Resource {
            id,
            name: "n".into(),
            description: None,
            created_at: now,
        });
        assert_ne!(p.id, r.id);
        assert_eq!(p.id, format!("posting:{}", id));
    }

    #[test]
    fn message_subtitles_are_truncated() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            body: "x".repeat(200),
            is_read: false,
            created_at: Utc::now(),
        };
        let item = NotificationItem::from_message(&message, "Ada");
        assert_eq!(item.title, "Ada");
        assert_eq!(item.subtitle.chars().count(), SUBTITLE_LEN);
        assert_eq!(item.kind, NotificationKind::Message);
    }
}

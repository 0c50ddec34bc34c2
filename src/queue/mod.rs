//! Named, bounded, age-evicting FIFO queues of pending deliveries.
//!
//! Queue contents are snapshotted into the [`PersistentStore`] after every
//! mutation so pending items survive a restart. Persistence is best-effort;
//! the in-memory queues stay authoritative when the store is unavailable.

use crate::error::OutpostError;
use crate::store::PersistentStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Key under which the whole queue snapshot is stored.
pub const SNAPSHOT_KEY: &str = "outpost.queues";

pub const DEFAULT_MAX_ITEMS: usize = 100;

/// How long items of a queue live and whether they survive a restart.
///
/// Serialized as the integer `max_age_seconds`: `0` ephemeral, `-1` forever,
/// any positive value is the age limit in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Retention {
    /// Kept in memory only.
    Ephemeral,
    Forever,
    MaxAge(u64),
}

impl Retention {
    pub fn from_seconds(seconds: i64) -> Self {
        match seconds {
            0 => Self::Ephemeral,
            s if s < 0 => Self::Forever,
            s => Self::MaxAge(s.unsigned_abs()),
        }
    }

    pub fn as_seconds(self) -> i64 {
        match self {
            Self::Ephemeral => 0,
            Self::Forever => -1,
            Self::MaxAge(s) => i64::try_from(s).unwrap_or(i64::MAX),
        }
    }

    pub fn persists(self) -> bool {
        self != Self::Ephemeral
    }

    fn max_age(self) -> Option<Duration> {
        match self {
            Self::MaxAge(s) => Some(Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX))),
            _ => None,
        }
    }
}

impl From<i64> for Retention {
    fn from(seconds: i64) -> Self {
        Self::from_seconds(seconds)
    }
}

impl From<Retention> for i64 {
    fn from(retention: Retention) -> Self {
        retention.as_seconds()
    }
}

/// Capacity and age limits of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_items: usize,
    pub retention: Retention,
}

impl QueueLimits {
    pub fn new(max_items: usize, max_age_seconds: i64) -> Self {
        Self {
            max_items,
            retention: Retention::from_seconds(max_age_seconds),
        }
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            retention: Retention::Forever,
        }
    }
}

/// One pending delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// Set when the item was last handed to a transport. Not persisted.
    #[serde(skip)]
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Correlation ids of every transmission so far; an ack for any of them
    /// removes the item. Process scoped, not persisted.
    #[serde(skip)]
    pub correlation_ids: Vec<u64>,
}

impl QueueItem {
    pub fn new(payload: Value, dedup_key: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            payload,
            dedup_key,
            last_sent_at: None,
            correlation_ids: Vec::new(),
        }
    }

    /// Milliseconds since the item was enqueued, clamped at zero.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.timestamp).num_milliseconds()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub name: String,
    pub items: VecDeque<QueueItem>,
    pub max_items: usize,
    #[serde(rename = "max_age_seconds")]
    pub retention: Retention,
}

impl QueueState {
    pub fn new(name: impl Into<String>, limits: QueueLimits) -> Self {
        Self {
            name: name.into(),
            items: VecDeque::new(),
            max_items: limits.max_items.max(1),
            retention: limits.retention,
        }
    }

    /// Append an item, replacing any pending item with the same dedup key.
    /// Returns how many items were evicted to stay within `max_items`.
    pub fn push(&mut self, item: QueueItem) -> PushOutcome {
        let replaced = match item.dedup_key.as_deref() {
            Some(key) => {
                let before = self.items.len();
                self.items
                    .retain(|existing| existing.dedup_key.as_deref() != Some(key));
                before - self.items.len()
            }
            None => 0,
        };
        self.items.push_back(item);
        PushOutcome {
            replaced,
            evicted: self.enforce_limit(),
        }
    }

    /// Drop from the front until the queue fits `max_items`.
    pub fn enforce_limit(&mut self) -> usize {
        let mut evicted = 0;
        while self.items.len() > self.max_items {
            self.items.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let Some(max_age) = self.retention.max_age() else {
            return 0;
        };
        let before = self.items.len();
        self.items.retain(|item| now - item.timestamp <= max_age);
        before - self.items.len()
    }

    /// Remove the item that was transmitted under `correlation_id`.
    pub fn remove_correlation(&mut self, correlation_id: u64) -> bool {
        match self
            .items
            .iter()
            .position(|item| item.correlation_ids.contains(&correlation_id))
        {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    fn clear_transmission_state(&mut self) {
        for item in &mut self.items {
            item.last_sent_at = None;
            item.correlation_ids.clear();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub replaced: usize,
    pub evicted: usize,
}

/// All queues of the process plus their persistence.
pub struct QueueStore {
    queues: BTreeMap<String, QueueState>,
    /// Persisted queues whose owners have not called `create_queue` yet in
    /// this process. Carried into every snapshot so they are not lost.
    unclaimed: BTreeMap<String, QueueState>,
    store: Arc<dyn PersistentStore>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        let mut unclaimed = load_snapshot(store.as_ref());
        let now = Utc::now();
        let expired: usize = unclaimed
            .values_mut()
            .map(|queue| queue.purge_expired(now))
            .sum();
        unclaimed.retain(|_, queue| !queue.items.is_empty());
        if !unclaimed.is_empty() {
            tracing::info!(
                "Restored {} persisted queue(s) from {} store",
                unclaimed.len(),
                store.name()
            );
        }
        let queues = Self {
            queues: BTreeMap::new(),
            unclaimed,
            store,
        };
        if expired > 0 {
            tracing::debug!("Dropped {expired} expired item(s) from restored queues");
            queues.persist();
        }
        queues
    }

    pub fn create_queue(&mut self, name: &str, limits: QueueLimits) -> Result<(), OutpostError> {
        if self.queues.contains_key(name) {
            return Err(OutpostError::DuplicateQueue {
                name: name.to_string(),
            });
        }

        let mut queue = QueueState::new(name, limits);
        if let Some(mut restored) = self.unclaimed.remove(name) {
            restored.clear_transmission_state();
            queue.items = restored.items;
            let evicted = queue.enforce_limit();
            tracing::debug!(
                "Queue '{name}': restored {} pending item(s), evicted {evicted}",
                queue.items.len()
            );
        }
        self.queues.insert(name.to_string(), queue);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn enqueue(
        &mut self,
        name: &str,
        payload: Value,
        dedup_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PushOutcome, OutpostError> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| OutpostError::UnknownQueue {
                name: name.to_string(),
            })?;
        let outcome = queue.push(QueueItem::new(payload, dedup_key, now));
        if outcome.evicted > 0 {
            tracing::debug!("Queue '{name}' full: evicted {} oldest item(s)", outcome.evicted);
        }
        self.persist();
        Ok(outcome)
    }

    /// Drop items older than their queue's age limit.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let purged: usize = self
            .queues
            .values_mut()
            .map(|queue| queue.purge_expired(now))
            .sum();
        if purged > 0 {
            tracing::debug!("Purged {purged} expired item(s)");
            self.persist();
        }
        purged
    }

    /// Remove the item acknowledged under `correlation_id` from every queue.
    pub fn acknowledge(&mut self, correlation_id: u64) -> bool {
        let mut removed = false;
        for queue in self.queues.values_mut() {
            removed |= queue.remove_correlation(correlation_id);
        }
        removed
    }

    pub fn len(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|queue| queue.items.len())
    }

    pub fn pending_total(&self) -> usize {
        self.queues.values().map(|queue| queue.items.len()).sum()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&QueueState> {
        self.queues.get(name)
    }

    pub(crate) fn queues_mut(&mut self) -> impl Iterator<Item = &mut QueueState> {
        self.queues.values_mut()
    }

    /// Snapshot of every queue worth persisting.
    pub fn snapshot(&self) -> BTreeMap<String, QueueState> {
        let mut snapshot: BTreeMap<String, QueueState> = self
            .unclaimed
            .iter()
            .filter(|(name, _)| !self.queues.contains_key(*name))
            .map(|(name, queue)| (name.clone(), queue.clone()))
            .collect();
        for (name, queue) in &self.queues {
            if queue.retention.persists() && !queue.items.is_empty() {
                snapshot.insert(name.clone(), queue.clone());
            }
        }
        snapshot
    }

    /// Write the snapshot to the store, logging instead of failing.
    pub fn persist(&self) {
        let value = match serde_json::to_value(self.snapshot()) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to serialize queue snapshot: {e}");
                return;
            }
        };
        if let Err(e) = self.store.set_object(SNAPSHOT_KEY, &value) {
            tracing::warn!("Failed to persist queues to {} store: {e:#}", self.store.name());
        }
    }
}

/// Read the persisted snapshot, treating any failure as "nothing stored".
pub fn load_snapshot(store: &dyn PersistentStore) -> BTreeMap<String, QueueState> {
    let value = match store.get_object(SNAPSHOT_KEY) {
        Ok(Some(value)) => value,
        Ok(None) => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!("Failed to read queue snapshot from {} store: {e:#}", store.name());
            return BTreeMap::new();
        }
    };
    match serde_json::from_value(value) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!("Ignoring unreadable queue snapshot: {e}");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::bail;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn payloads(store: &QueueStore, name: &str) -> Vec<Value> {
        store
            .get(name)
            .unwrap()
            .items
            .iter()
            .map(|item| item.payload.clone())
            .collect()
    }

    struct BrokenStore;

    impl PersistentStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }

        fn get_object(&self, _key: &str) -> anyhow::Result<Option<Value>> {
            bail!("disk unavailable")
        }

        fn set_object(&self, _key: &str, _value: &Value) -> anyhow::Result<()> {
            bail!("disk unavailable")
        }
    }

    #[test]
    fn retention_maps_to_and_from_seconds() {
        assert_eq!(Retention::from_seconds(0), Retention::Ephemeral);
        assert_eq!(Retention::from_seconds(-1), Retention::Forever);
        assert_eq!(Retention::from_seconds(-40), Retention::Forever);
        assert_eq!(Retention::from_seconds(60), Retention::MaxAge(60));
        assert_eq!(Retention::MaxAge(60).as_seconds(), 60);
        assert_eq!(serde_json::to_value(Retention::Forever).unwrap(), json!(-1));
        assert!(!Retention::Ephemeral.persists());
    }

    #[test]
    fn duplicate_queue_is_a_configuration_error() {
        let mut store = QueueStore::new(Arc::new(MemoryStore::new()));
        store.create_queue("stat", QueueLimits::default()).unwrap();
        assert_eq!(
            store.create_queue("stat", QueueLimits::default()),
            Err(OutpostError::DuplicateQueue {
                name: "stat".into()
            })
        );
    }

    #[test]
    fn enqueue_into_unknown_queue_fails() {
        let mut store = QueueStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(
            store.enqueue("nope", json!(1), None, t(0)),
            Err(OutpostError::UnknownQueue {
                name: "nope".into()
            })
        );
    }

    #[test]
    fn overflow_drops_oldest_and_dedup_replaces() {
        let mut store = QueueStore::new(Arc::new(MemoryStore::new()));
        store.create_queue("stat", QueueLimits::new(2, -1)).unwrap();

        for (i, p) in ["A", "B", "C"].iter().enumerate() {
            store.enqueue("stat", json!(p), None, t(i as i64)).unwrap();
        }
        assert_eq!(payloads(&store, "stat"), vec![json!("B"), json!("C")]);

        store
            .enqueue("stat", json!("D"), Some("k1".into()), t(3))
            .unwrap();
        let outcome = store
            .enqueue("stat", json!("E"), Some("k1".into()), t(4))
            .unwrap();
        assert_eq!(outcome.replaced, 1);
        assert_eq!(payloads(&store, "stat"), vec![json!("C"), json!("E")]);
    }

    #[test]
    fn dedup_only_applies_within_one_queue() {
        let mut store = QueueStore::new(Arc::new(MemoryStore::new()));
        store.create_queue("a", QueueLimits::default()).unwrap();
        store.create_queue("b", QueueLimits::default()).unwrap();
        store.enqueue("a", json!(1), Some("k".into()), t(0)).unwrap();
        store.enqueue("b", json!(2), Some("k".into()), t(1)).unwrap();
        assert_eq!(store.len("a"), Some(1));
        assert_eq!(store.len("b"), Some(1));
    }

    #[test]
    fn zero_max_items_is_clamped_to_one() {
        let mut store = QueueStore::new(Arc::new(MemoryStore::new()));
        store.create_queue("tiny", QueueLimits::new(0, -1)).unwrap();
        store.enqueue("tiny", json!(1), None, t(0)).unwrap();
        store.enqueue("tiny", json!(2), None, t(1)).unwrap();
        assert_eq!(payloads(&store, "tiny"), vec![json!(2)]);
    }

    #[test]
    fn purge_only_touches_queues_with_age_limit() {
        let mut store = QueueStore::new(Arc::new(MemoryStore::new()));
        store.create_queue("short", QueueLimits::new(10, 60)).unwrap();
        store.create_queue("forever", QueueLimits::new(10, -1)).unwrap();
        store.enqueue("short", json!("old"), None, t(0)).unwrap();
        store.enqueue("short", json!("new"), None, t(100)).unwrap();
        store.enqueue("forever", json!("old"), None, t(0)).unwrap();

        assert_eq!(store.purge_expired(t(120)), 1);
        assert_eq!(payloads(&store, "short"), vec![json!("new")]);
        assert_eq!(store.len("forever"), Some(1));
    }

    #[test]
    fn snapshot_skips_ephemeral_and_empty_queues() {
        let backing = Arc::new(MemoryStore::new());
        let mut store = QueueStore::new(backing.clone());
        store.create_queue("keep", QueueLimits::new(10, -1)).unwrap();
        store.create_queue("memory", QueueLimits::new(10, 0)).unwrap();
        store.create_queue("empty", QueueLimits::new(10, -1)).unwrap();
        store.enqueue("keep", json!(1), None, t(0)).unwrap();
        store.enqueue("memory", json!(2), None, t(0)).unwrap();

        let persisted = backing.get_object(SNAPSHOT_KEY).unwrap().unwrap();
        let names: Vec<&String> = persisted.as_object().unwrap().keys().collect();
        assert_eq!(names, vec!["keep"]);
        assert_eq!(persisted["keep"]["max_age_seconds"], json!(-1));
        assert!(persisted["keep"]["items"][0].get("correlation_ids").is_none());
    }

    #[test]
    fn restart_restores_items_without_transmission_state() {
        let backing = Arc::new(MemoryStore::new());
        {
            let mut store = QueueStore::new(backing.clone());
            store.create_queue("stat", QueueLimits::new(10, -1)).unwrap();
            store.enqueue("stat", json!("a"), Some("k".into()), t(0)).unwrap();
            store.enqueue("stat", json!("b"), None, t(1)).unwrap();
            for queue in store.queues_mut() {
                for item in &mut queue.items {
                    item.correlation_ids = vec![7];
                    item.last_sent_at = Some(t(2));
                }
            }
            store.persist();
        }

        let mut store = QueueStore::new(backing);
        store.create_queue("stat", QueueLimits::new(1, -1)).unwrap();
        let queue = store.get("stat").unwrap();
        // New, smaller limit is applied on restore.
        assert_eq!(queue.items.len(), 1);
        assert_eq!(queue.items[0].payload, json!("b"));
        assert!(queue.items[0].correlation_ids.is_empty());
        assert!(queue.items[0].last_sent_at.is_none());
    }

    #[test]
    fn unclaimed_queues_survive_snapshots() {
        let backing = Arc::new(MemoryStore::new());
        {
            let mut store = QueueStore::new(backing.clone());
            store.create_queue("late", QueueLimits::default()).unwrap();
            store.enqueue("late", json!("x"), None, t(0)).unwrap();
        }

        let mut store = QueueStore::new(backing.clone());
        store.create_queue("early", QueueLimits::default()).unwrap();
        store.enqueue("early", json!("y"), None, t(1)).unwrap();

        let snapshot = load_snapshot(backing.as_ref());
        assert!(snapshot.contains_key("late"));
        assert!(snapshot.contains_key("early"));

        store.create_queue("late", QueueLimits::default()).unwrap();
        assert_eq!(store.len("late"), Some(1));
    }

    #[test]
    fn restore_drops_expired_items_from_unclaimed_queues() {
        let backing = Arc::new(MemoryStore::new());
        let now = Utc::now();
        {
            let mut store = QueueStore::new(backing.clone());
            store.create_queue("err", QueueLimits::new(10, 60)).unwrap();
            store.create_queue("gone", QueueLimits::new(10, 60)).unwrap();
            store
                .enqueue("err", json!("stale"), None, now - Duration::seconds(120))
                .unwrap();
            store.enqueue("err", json!("fresh"), None, now).unwrap();
            store
                .enqueue("gone", json!("stale"), None, now - Duration::seconds(120))
                .unwrap();
        }

        let store = QueueStore::new(backing.clone());
        let snapshot = store.snapshot();
        assert!(!snapshot.contains_key("gone"));
        let err: Vec<Value> = snapshot["err"].items.iter().map(|i| i.payload.clone()).collect();
        assert_eq!(err, vec![json!("fresh")]);

        let persisted = load_snapshot(backing.as_ref());
        assert_eq!(persisted["err"].items.len(), 1);
        assert!(!persisted.contains_key("gone"));
    }

    #[test]
    fn broken_store_does_not_break_queues() {
        let mut store = QueueStore::new(Arc::new(BrokenStore));
        store.create_queue("stat", QueueLimits::default()).unwrap();
        store.enqueue("stat", json!(1), None, t(0)).unwrap();
        assert_eq!(store.len("stat"), Some(1));
    }

    #[test]
    fn acknowledge_removes_matching_item_only() {
        let mut store = QueueStore::new(Arc::new(MemoryStore::new()));
        store.create_queue("stat", QueueLimits::default()).unwrap();
        store.enqueue("stat", json!(1), None, t(0)).unwrap();
        store.enqueue("stat", json!(2), None, t(1)).unwrap();
        for (id, item) in store.queues_mut().flat_map(|q| q.items.iter_mut()).enumerate() {
            item.correlation_ids.push(id as u64 + 1);
        }

        assert!(store.acknowledge(2));
        assert!(!store.acknowledge(2));
        assert_eq!(payloads(&store, "stat"), vec![json!(1)]);
    }

    #[test]
    fn elapsed_ms_is_clamped_for_clock_skew() {
        let item = QueueItem::new(json!(1), None, t(10));
        assert_eq!(item.elapsed_ms(t(12)), 2000);
        assert_eq!(item.elapsed_ms(t(5)), 0);
    }
}

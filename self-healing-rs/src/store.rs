//! # Failure Store
//!
//! Central ledger of failure events for the running session. The ledger is
//! newest-first and capped; every report persists a bounded snapshot and is
//! then fanned out to subscribed listeners in registration order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::hooks::contained;
use crate::metrics_support;
use crate::persistence::KeyValueStore;
use crate::subscription::{SubscriberSet, Subscription};
use crate::types::{Error, FailureCategory, FailureEvent, Result};

/// Callback invoked for every reported failure
pub type FailureListener = dyn Fn(&FailureEvent) + Send + Sync;

const TOP_MESSAGES: usize = 10;
const RECENT_EVENTS: usize = 10;

/// Configuration for the failure store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum events kept in memory
    pub max_stored_errors: usize,
    /// Maximum events written to the persisted snapshot
    pub snapshot_limit: usize,
    /// Snapshot entries older than this are discarded on load
    pub snapshot_max_age_hours: i64,
    /// Key the snapshot is stored under
    pub persistence_key: String,
    /// Whether reports are persisted at all
    pub persist: bool,
    /// Origin stamped onto events that do not carry one
    pub origin: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_stored_errors: 100,
            snapshot_limit: 20,
            snapshot_max_age_hours: 24,
            persistence_key: "self-healing:errors".to_string(),
            persist: true,
            origin: None,
        }
    }
}

/// Persisted form of the store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub errors: Vec<FailureEvent>,
    #[serde(rename = "timestamp")]
    pub saved_at: DateTime<Utc>,
    pub session_id: String,
}

/// How often a message was seen and when last
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrequency {
    pub message: String,
    pub count: usize,
    pub last_seen: DateTime<Utc>,
}

/// Aggregate statistics over the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: usize,
    pub by_category: BTreeMap<FailureCategory, usize>,
    pub by_message: HashMap<String, usize>,
    pub top_messages: Vec<MessageFrequency>,
    pub recent: Vec<FailureEvent>,
}

/// Failure count for one calendar day (UTC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreExport<'a> {
    session_id: &'a str,
    exported_at: DateTime<Utc>,
    events: &'a VecDeque<FailureEvent>,
    stats: StoreStats,
}

/// Central failure ledger and pub/sub hub
pub struct FailureStore {
    config: StoreConfig,
    session_id: String,
    /// Newest first
    events: RwLock<VecDeque<FailureEvent>>,
    listeners: SubscriberSet<FailureListener>,
    persistence: Arc<dyn KeyValueStore>,
    /// Bumped under the ledger lock for every snapshot taken
    snapshot_seq: AtomicU64,
    /// Sequence of the last snapshot written; serializes writes
    persisted_seq: Mutex<u64>,
}

impl FailureStore {
    /// Creates a store for a fresh session
    pub fn new(config: StoreConfig, persistence: Arc<dyn KeyValueStore>) -> Self {
        Self::with_session(config, persistence, Uuid::new_v4().to_string())
    }

    /// Creates a store with an explicit session id
    pub fn with_session<S: Into<String>>(
        config: StoreConfig,
        persistence: Arc<dyn KeyValueStore>,
        session_id: S,
    ) -> Self {
        let capacity = config.max_stored_errors;
        Self {
            config,
            session_id: session_id.into(),
            events: RwLock::new(VecDeque::with_capacity(capacity)),
            listeners: SubscriberSet::new(),
            persistence,
            snapshot_seq: AtomicU64::new(0),
            persisted_seq: Mutex::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Records a failure, persists the snapshot, then notifies listeners.
    ///
    /// Never fails: persistence errors and listener panics are logged and
    /// swallowed.
    pub fn report(&self, event: FailureEvent) -> Uuid {
        let event = event.stamped(&self.session_id, self.config.origin.as_deref());
        let id = event.id();

        let (stored, snapshot) = {
            let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
            events.push_front(event.clone());

            let mut evicted = 0;
            while events.len() > self.config.max_stored_errors {
                events.pop_back();
                evicted += 1;
            }
            metrics_support::record_evictions(evicted);

            (events.len(), self.take_snapshot(&events))
        };

        // The backend is called with the ledger unlocked
        if let Some((seq, snapshot)) = snapshot {
            self.persist(seq, &snapshot);
        }

        metrics_support::record_failure(&event, stored);
        debug!(event_id = %id, category = %event.category(), stored, "Failure recorded");

        self.notify(&event);
        id
    }

    fn notify(&self, event: &FailureEvent) {
        for (index, listener) in self.listeners.snapshot().into_iter().enumerate() {
            if contained(|| listener(event)).is_err() {
                metrics_support::record_listener_panic();
                error!(
                    event_id = %event.id(),
                    listener = index,
                    "Failure listener panicked; continuing with remaining listeners"
                );
            }
        }
    }

    /// Called with the ledger locked so sequence numbers follow report order
    fn take_snapshot(&self, events: &VecDeque<FailureEvent>) -> Option<(u64, Snapshot)> {
        if !self.config.persist {
            return None;
        }

        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Snapshot {
            errors: events.iter().take(self.config.snapshot_limit).cloned().collect(),
            saved_at: Utc::now(),
            session_id: self.session_id.clone(),
        };
        Some((seq, snapshot))
    }

    fn persist(&self, seq: u64, snapshot: &Snapshot) {
        let mut persisted = self.persisted_seq.lock().unwrap_or_else(|e| e.into_inner());
        if seq < *persisted {
            // A newer snapshot already landed
            return;
        }

        let result = serde_json::to_string(snapshot).map_err(Error::from).and_then(|json| {
            contained(|| self.persistence.set(&self.config.persistence_key, &json))
                .unwrap_or_else(|_| Err(Error::Persistence("persistence backend panicked".into())))
        });

        match result {
            Ok(()) => *persisted = seq,
            Err(e) => {
                metrics_support::record_persistence_failure();
                warn!(error = %e, "Failed to persist failure snapshot");
            }
        }
    }

    /// Restores recent failures from the persisted snapshot.
    ///
    /// Only entries younger than `snapshot_max_age_hours` are kept. Restored
    /// entries rank as older than anything reported in this process, and
    /// ids already in the ledger are skipped. Returns how many were merged.
    pub fn load_persisted(&self) -> Result<usize> {
        let stored = contained(|| self.persistence.get(&self.config.persistence_key))
            .unwrap_or_else(|_| Err(Error::Persistence("persistence backend panicked".into())));
        let raw = match stored? {
            Some(raw) => raw,
            None => return Ok(0),
        };

        let snapshot: Snapshot =
            serde_json::from_str(&raw).map_err(|e| Error::format("snapshot", e.to_string()))?;

        let cutoff = Utc::now() - chrono::Duration::hours(self.config.snapshot_max_age_hours);
        let total = snapshot.errors.len();

        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        let mut seen: HashSet<Uuid> = events.iter().map(FailureEvent::id).collect();

        let mut merged = 0;
        for event in snapshot.errors {
            if event.timestamp() < cutoff || !seen.insert(event.id()) {
                continue;
            }
            events.push_back(event);
            merged += 1;
        }

        while events.len() > self.config.max_stored_errors {
            events.pop_back();
        }

        info!(
            merged,
            discarded = total - merged,
            previous_session = %snapshot.session_id,
            "Restored persisted failures"
        );
        Ok(merged)
    }

    /// Registers a listener; listeners run in registration order
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&FailureEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(Arc::new(listener))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Computes aggregate statistics
    pub fn stats(&self) -> StoreStats {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        Self::stats_for(&events)
    }

    fn stats_for(events: &VecDeque<FailureEvent>) -> StoreStats {
        let mut by_category = BTreeMap::new();
        let mut by_message: HashMap<String, usize> = HashMap::new();
        let mut last_seen: HashMap<&str, DateTime<Utc>> = HashMap::new();

        for event in events {
            *by_category.entry(event.category()).or_insert(0) += 1;
            *by_message.entry(event.message().to_string()).or_insert(0) += 1;

            let seen = last_seen.entry(event.message()).or_insert(event.timestamp());
            if event.timestamp() > *seen {
                *seen = event.timestamp();
            }
        }

        let mut top_messages: Vec<MessageFrequency> = by_message
            .iter()
            .map(|(message, count)| MessageFrequency {
                message: message.clone(),
                count: *count,
                last_seen: last_seen[message.as_str()],
            })
            .collect();
        top_messages.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| a.message.cmp(&b.message))
        });
        top_messages.truncate(TOP_MESSAGES);

        StoreStats {
            total: events.len(),
            by_category,
            by_message,
            top_messages,
            recent: events.iter().take(RECENT_EVENTS).cloned().collect(),
        }
    }

    /// Failure counts per UTC calendar day, oldest day first
    pub fn trends(&self) -> Vec<TrendPoint> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());

        let mut buckets: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for event in events.iter() {
            *buckets.entry(event.timestamp().date_naive()).or_insert(0) += 1;
        }

        buckets
            .into_iter()
            .map(|(date, count)| TrendPoint { date, count })
            .collect()
    }

    /// Case-insensitive search over message, stack and category
    pub fn search(&self, query: &str) -> Vec<FailureEvent> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events.iter().filter(|e| e.matches_query(query)).cloned().collect()
    }

    /// The `n` most recent events
    pub fn recent(&self, n: usize) -> Vec<FailureEvent> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events.iter().take(n).cloned().collect()
    }

    pub fn by_category(&self, category: FailureCategory) -> Vec<FailureEvent> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .filter(|e| e.category() == category)
            .cloned()
            .collect()
    }

    /// Number of events that occurred within `window` of now
    pub fn count_since(&self, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - window;
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events.iter().filter(|e| e.timestamp() >= cutoff).count()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the ledger and removes the persisted snapshot
    pub fn clear(&self) {
        self.events.write().unwrap_or_else(|e| e.into_inner()).clear();

        let removed = contained(|| self.persistence.remove(&self.config.persistence_key))
            .unwrap_or_else(|_| Err(Error::Persistence("persistence backend panicked".into())));
        if let Err(e) = removed {
            metrics_support::record_persistence_failure();
            warn!(error = %e, "Failed to remove persisted failure snapshot");
        }
    }

    /// Serializes the session's events and statistics as JSON
    pub fn export(&self) -> Result<String> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        let export = StoreExport {
            session_id: &self.session_id,
            exported_at: Utc::now(),
            events: &*events,
            stats: Self::stats_for(&events),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }
}

impl std::fmt::Debug for FailureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureStore")
            .field("session_id", &self.session_id)
            .field("stored", &self.len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

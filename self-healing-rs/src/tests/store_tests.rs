//! Failure store scenarios: bounded ledger and snapshot restore

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{Duration, Utc};
    use tokio_test::assert_ok;

    use crate::persistence::{KeyValueStore, MemoryStore};
    use crate::store::{FailureStore, Snapshot, StoreConfig};
    use crate::types::{FailureCategory, FailureEvent};

    fn store_with(max: usize, persistence: Arc<dyn KeyValueStore>) -> FailureStore {
        FailureStore::new(
            StoreConfig {
                max_stored_errors: max,
                ..Default::default()
            },
            persistence,
        )
    }

    #[test]
    fn test_ledger_keeps_most_recent_events() {
        let store = store_with(7, Arc::new(MemoryStore::new()));

        for i in 0..25 {
            store.report(FailureEvent::new(FailureCategory::RuntimeError, format!("failure {}", i)));
            assert!(store.len() <= 7);
        }

        let messages: Vec<String> = store.recent(100).iter().map(|e| e.message().to_string()).collect();
        let expected: Vec<String> = (18..25).rev().map(|i| format!("failure {}", i)).collect();
        assert_eq!(messages, expected);
    }

    #[test]
    fn test_snapshot_restore_drops_stale_entries() {
        let persistence = Arc::new(MemoryStore::new());
        let config = StoreConfig::default();

        let stale = FailureEvent::new(FailureCategory::RuntimeError, "from yesterday")
            .occurred_at(Utc::now() - Duration::hours(25));
        let fresh = FailureEvent::new(FailureCategory::RuntimeError, "from an hour ago")
            .occurred_at(Utc::now() - Duration::hours(1));
        let snapshot = Snapshot {
            errors: vec![fresh.clone(), stale],
            saved_at: Utc::now() - Duration::hours(1),
            session_id: "previous-session".to_string(),
        };
        assert_ok!(persistence.set(&config.persistence_key, &serde_json::to_string(&snapshot).unwrap()));

        let store = FailureStore::new(config, persistence);
        assert_eq!(assert_ok!(store.load_persisted()), 1);

        let events = store.recent(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), fresh.id());
        assert_eq!(events[0].message(), "from an hour ago");
    }

    #[test]
    fn test_restored_entries_rank_older_than_current_ones() {
        let persistence: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let previous = store_with(100, persistence.clone());
        previous.report(FailureEvent::new(FailureCategory::RuntimeError, "previous run"));

        let current = store_with(100, persistence);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = current.subscribe(move |e| s.lock().unwrap().push(e.message().to_string()));

        assert_eq!(assert_ok!(current.load_persisted()), 1);
        current.report(FailureEvent::new(FailureCategory::RuntimeError, "this run"));

        let messages: Vec<String> = current.recent(10).iter().map(|e| e.message().to_string()).collect();
        assert_eq!(messages, vec!["this run", "previous run"]);
        // Restoring does not notify listeners
        assert_eq!(*seen.lock().unwrap(), vec!["this run".to_string()]);
    }

    #[test]
    fn test_reloading_own_snapshot_adds_nothing() {
        let store = store_with(100, Arc::new(MemoryStore::new()));
        store.report(FailureEvent::new(FailureCategory::RuntimeError, "only once"));

        assert_eq!(assert_ok!(store.load_persisted()), 0);
        assert_eq!(store.len(), 1);
    }
}

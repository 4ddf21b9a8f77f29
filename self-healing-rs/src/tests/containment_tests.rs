//! Panics the pipeline handles itself stay out of the ledger, even with the
//! process panic hook installed

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use crate::capture::{DiagnosticArg, DiagnosticChannel, DiagnosticLevel, DiagnosticSink};
    use crate::config::SelfHealingConfig;
    use crate::context::FailureContext;
    use crate::hooks::RuntimeHooks;
    use crate::matcher::Matcher;
    use crate::monitor::{MonitorComponents, SelfHealingMonitor};
    use crate::persistence::KeyValueStore;
    use crate::remediation::RemediationRule;
    use crate::types::{FailureCategory, FailureEvent, Result};

    struct SilentSink;

    impl DiagnosticSink for SilentSink {
        fn emit(&self, _level: DiagnosticLevel, _args: &[DiagnosticArg]) {}
    }

    struct PanickingBackend;

    impl KeyValueStore for PanickingBackend {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            panic!("backend write crashed: persist-sentinel-3b9d")
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn hooked_monitor(components: MonitorComponents) -> (SelfHealingMonitor, Arc<DiagnosticChannel>) {
        let channel = Arc::new(DiagnosticChannel::new(Arc::new(SilentSink)));
        let monitor = SelfHealingMonitor::new(
            SelfHealingConfig::default(),
            components
                .with_channel(channel.clone())
                .with_host_hooks(Arc::new(RuntimeHooks::new())),
        )
        .unwrap();
        monitor.initialize();
        (monitor, channel)
    }

    async fn explode(_event: FailureEvent, _context: Option<FailureContext>) -> anyhow::Result<bool> {
        panic!("fix crashed: action-sentinel-3b9d")
    }

    #[tokio::test]
    async fn test_panicking_action_is_only_a_failed_attempt() {
        let (monitor, _channel) = hooked_monitor(MonitorComponents::default());
        let rule = RemediationRule::new("explode", "Explode", Matcher::substring("action-trigger-3b9d"), explode);
        monitor.register_rule(rule.clone()).unwrap();

        let event = FailureEvent::new(FailureCategory::RuntimeError, "action-trigger-3b9d");
        assert!(!monitor.apply_fix(&rule, &event, None).await);

        assert_eq!(rule.stats().times_applied, 1);
        assert!(monitor.store().search("action-sentinel-3b9d").is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_report_again() {
        let (monitor, _channel) = hooked_monitor(MonitorComponents::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _sub = monitor.subscribe(move |event| {
            if event.message().contains("listener-trigger-3b9d") {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("listener crashed: listener-sentinel-3b9d");
            }
        });

        monitor.report_failure(FailureEvent::new(FailureCategory::RuntimeError, "listener-trigger-3b9d"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.store().search("listener-trigger-3b9d").len(), 1);
        assert!(monitor.store().search("listener-sentinel-3b9d").is_empty());
    }

    #[test]
    fn test_panicking_condition_and_capture_listener_stay_contained() {
        let (monitor, channel) = hooked_monitor(MonitorComponents::default());
        let rule = RemediationRule::new("guarded", "Guarded", Matcher::substring("condition-trigger-3b9d"), |_, _| async {
            Ok::<_, anyhow::Error>(true)
        })
        .condition(|| panic!("condition crashed: condition-sentinel-3b9d"));
        monitor.register_rule(rule).unwrap();

        let event = FailureEvent::new(FailureCategory::RuntimeError, "condition-trigger-3b9d");
        assert!(monitor.find_match(&event).map_or(true, |r| r.id() != "guarded"));

        let _sub = monitor
            .capture()
            .subscribe(|_| panic!("capture listener crashed: capture-sentinel-3b9d"));
        channel.warn(&["capture-trigger-3b9d".into()]);

        assert_eq!(monitor.capture().records().len(), 1);
        assert!(monitor.store().search("condition-sentinel-3b9d").is_empty());
        assert!(monitor.store().search("capture-sentinel-3b9d").is_empty());
    }

    #[tokio::test]
    async fn test_monitored_task_panic_is_reported_once_as_rejected() {
        let hooks = Arc::new(RuntimeHooks::new());
        let monitor = SelfHealingMonitor::new(
            SelfHealingConfig::default(),
            MonitorComponents::default()
                .with_channel(Arc::new(DiagnosticChannel::new(Arc::new(SilentSink))))
                .with_host_hooks(hooks.clone()),
        )
        .unwrap();
        monitor.initialize();

        let handle = hooks.spawn_monitored("rebuild-index", async {
            if true {
                panic!("index corrupted: task-sentinel-3b9d");
            }
            Ok::<(), String>(())
        });
        assert_eq!(handle.await.unwrap(), None);

        let reported = monitor.store().search("task-sentinel-3b9d");
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].category(), FailureCategory::RejectedOperation);
    }

    #[test]
    fn test_panicking_backend_does_not_block_report() {
        let (monitor, _channel) =
            hooked_monitor(MonitorComponents::default().with_persistence(Arc::new(PanickingBackend)));
        let store = monitor.store().clone();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            store.report(FailureEvent::new(FailureCategory::RuntimeError, "persist-trigger-3b9d"));
            let _ = tx.send(());
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(monitor.store().search("persist-trigger-3b9d").len(), 1);
        assert!(monitor.store().search("persist-sentinel-3b9d").is_empty());
    }
}

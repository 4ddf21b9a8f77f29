//! Capture scenarios: noise filtering and host failure hooks

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::capture::{render_args, DiagnosticArg, DiagnosticChannel, DiagnosticLevel, DiagnosticSink};
    use crate::config::SelfHealingConfig;
    use crate::hooks::RuntimeHooks;
    use crate::matcher::Matcher;
    use crate::monitor::{MonitorComponents, SelfHealingMonitor};
    use crate::types::FailureCategory;

    #[derive(Default)]
    struct ConsoleSink {
        lines: Mutex<Vec<String>>,
    }

    impl DiagnosticSink for ConsoleSink {
        fn emit(&self, level: DiagnosticLevel, args: &[DiagnosticArg]) {
            self.lines.lock().unwrap().push(format!("{}: {}", level, render_args(args)));
        }
    }

    #[test]
    fn test_noisy_warning_is_neither_captured_nor_forwarded() {
        let console = Arc::new(ConsoleSink::default());
        let channel = Arc::new(DiagnosticChannel::new(console.clone()));

        let mut config = SelfHealingConfig::default();
        config.capture.filter_patterns = vec![Matcher::substring("noisy-warning")];
        let monitor =
            SelfHealingMonitor::new(config, MonitorComponents::default().with_channel(channel.clone())).unwrap();
        monitor.initialize();

        channel.error(&["framework says: noisy-warning about legacy API".into()]);
        channel.warn(&["noisy-warning again".into()]);
        channel.error(&["Unhandled failure in checkout".into()]);

        let records = monitor.capture().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "Unhandled failure in checkout");

        let failures = monitor.store().recent(10);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].category(), FailureCategory::DiagnosticOutput);
        assert_eq!(monitor.capture().stats().filtered, 2);

        // The host still saw every line
        assert_eq!(console.lines.lock().unwrap().len(), 3);

        monitor.shutdown();
        channel.error(&["after shutdown".into()]);
        assert_eq!(monitor.store().len(), 1);
    }

    #[test]
    fn test_structured_arguments_are_rendered() {
        let channel = Arc::new(DiagnosticChannel::new(Arc::new(ConsoleSink::default())));
        let monitor =
            SelfHealingMonitor::new(SelfHealingConfig::default(), MonitorComponents::default().with_channel(channel.clone()))
                .unwrap();
        monitor.initialize();

        channel.error(&[
            "Request failed".into(),
            serde_json::json!({ "status": 502 }).into(),
            DiagnosticArg::error_with_stack("Bad gateway", "at fetchOrders"),
        ]);

        let event = monitor.store().recent(1).remove(0);
        assert_eq!(event.message(), r#"Request failed {"status":502} Bad gateway"#);
        assert_eq!(event.stack(), Some("at fetchOrders"));
    }

    #[test]
    fn test_panics_are_reported_as_runtime_errors() {
        let hooks = Arc::new(RuntimeHooks::new());
        let monitor = SelfHealingMonitor::new(
            SelfHealingConfig::default(),
            MonitorComponents::default()
                .with_channel(Arc::new(DiagnosticChannel::new(Arc::new(ConsoleSink::default()))))
                .with_host_hooks(hooks.clone()),
        )
        .unwrap();
        monitor.initialize();
        assert!(hooks.is_installed());

        let outcome = std::thread::spawn(|| panic!("ledger index out of range: sentinel-7f3a")).join();
        assert!(outcome.is_err());

        // Other tests may panic concurrently, so only look for this one
        let reported = monitor.store().search("sentinel-7f3a");
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].category(), FailureCategory::RuntimeError);
        assert!(reported[0].context_map().get_str("location").is_some());

        monitor.shutdown();
        assert!(!hooks.is_installed());
    }
}

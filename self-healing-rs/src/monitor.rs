//! # Monitoring Context
//!
//! [`SelfHealingMonitor`] owns the failure store, the remediation registry
//! and the capture layer. It is constructed once at process start and handed
//! to collaborators; `initialize`/`shutdown`/`restart` are explicit.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::builtin::{register_builtin_rules, HostCapabilities};
use crate::capture::{CaptureLayer, CaptureStats, DiagnosticChannel};
use crate::config::SelfHealingConfig;
use crate::context::FailureContext;
use crate::hooks::HostFailureHooks;
use crate::logging::log_failure_event;
use crate::persistence::{KeyValueStore, MemoryStore};
use crate::recovery::{RecoveryBoundary, RecoveryOrchestrator};
use crate::remediation::{RegistryStats, RemediationRegistry, RemediationRule, RuleCategory};
use crate::store::{FailureStore, StoreStats, TrendPoint};
use crate::subscription::Subscription;
use crate::types::{FailureEvent, Result};

/// Thresholds for health classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Window failures are counted over
    pub window_secs: u64,
    /// More failures than this in the window is a warning
    pub warning_threshold: usize,
    /// More failures than this in the window is critical
    pub critical_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            warning_threshold: 5,
            critical_threshold: 10,
        }
    }
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn classify(&self, recent_failures: usize) -> HealthStatus {
        if recent_failures > self.critical_threshold {
            HealthStatus::Critical
        } else if recent_failures > self.warning_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Overall health of the monitored process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Warning => write!(f, "WARNING"),
            HealthStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Whether each subcomponent is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub failure_store: bool,
    pub capture_layer: bool,
    pub remediation_registry: bool,
    pub stats_listener: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub recent_failures: usize,
    pub window_secs: u64,
    pub total_failures: usize,
    pub components: ComponentStatus,
    pub session_id: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Catalog entry in a monitor report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSummary {
    pub id: String,
    pub name: String,
    pub category: RuleCategory,
    pub priority: i32,
    pub times_applied: u64,
    pub success_rate: f64,
}

/// Full diagnostic snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    pub generated_at: DateTime<Utc>,
    pub health: HealthReport,
    pub failures: StoreStats,
    pub trends: Vec<TrendPoint>,
    pub remediation: RegistryStats,
    pub capture: CaptureStats,
    pub catalog: Vec<RuleSummary>,
}

/// Host-provided collaborators
pub struct MonitorComponents {
    pub persistence: Arc<dyn KeyValueStore>,
    pub channel: Arc<DiagnosticChannel>,
    pub host_hooks: Option<Arc<dyn HostFailureHooks>>,
    pub capabilities: HostCapabilities,
}

impl MonitorComponents {
    pub fn with_persistence(mut self, persistence: Arc<dyn KeyValueStore>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_channel(mut self, channel: Arc<DiagnosticChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_host_hooks(mut self, hooks: Arc<dyn HostFailureHooks>) -> Self {
        self.host_hooks = Some(hooks);
        self
    }

    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl Default for MonitorComponents {
    fn default() -> Self {
        Self {
            persistence: Arc::new(MemoryStore::new()),
            channel: Arc::new(DiagnosticChannel::tracing()),
            host_hooks: None,
            capabilities: HostCapabilities::default(),
        }
    }
}

/// Process-wide self-healing context
pub struct SelfHealingMonitor {
    config: SelfHealingConfig,
    store: Arc<FailureStore>,
    registry: Arc<RemediationRegistry>,
    capture: CaptureLayer,
    initialized: AtomicBool,
    stats_subscription: Mutex<Option<Subscription>>,
    status_tx: Arc<watch::Sender<HealthStatus>>,
    started_at: Instant,
}

impl SelfHealingMonitor {
    /// Builds the store, the registry (with built-in rules) and the capture
    /// layer. Nothing is started until [`Self::initialize`].
    pub fn new(config: SelfHealingConfig, components: MonitorComponents) -> Result<Self> {
        let store = Arc::new(FailureStore::new(config.store.clone(), components.persistence));

        let registry = Arc::new(RemediationRegistry::new());
        register_builtin_rules(&registry, &components.capabilities)?;

        let capture = CaptureLayer::new(components.channel, store.clone(), components.host_hooks);
        let (status_tx, _) = watch::channel(HealthStatus::Healthy);

        Ok(Self {
            config,
            store,
            registry,
            capture,
            initialized: AtomicBool::new(false),
            stats_subscription: Mutex::new(None),
            status_tx: Arc::new(status_tx),
            started_at: Instant::now(),
        })
    }

    /// Restores persisted failures, starts capture and wires the stats
    /// listener. A second call logs a warning and does nothing.
    pub fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("Self-healing monitor already initialized");
            return;
        }

        match self.store.load_persisted() {
            Ok(restored) => debug!(restored, "Loaded persisted failures"),
            Err(e) => warn!(error = %e, "Could not load persisted failures"),
        }

        self.capture.start(self.config.capture.clone());

        let subscription = self.store.subscribe(stats_listener(
            Arc::downgrade(&self.store),
            self.config.health.clone(),
            self.status_tx.clone(),
        ));
        *self.stats_subscription.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);

        self.refresh_status();
        info!(session_id = %self.store.session_id(), rules = self.registry.len(), "Self-healing monitor initialized");
    }

    /// Stops capture and the stats listener. No-op when not initialized.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        self.capture.stop();
        if let Some(mut subscription) = self.stats_subscription.lock().unwrap_or_else(|e| e.into_inner()).take() {
            subscription.unsubscribe();
        }
        info!("Self-healing monitor shut down");
    }

    pub fn restart(&self) {
        self.shutdown();
        self.initialize();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn get_health(&self) -> HealthReport {
        let health = &self.config.health;
        let recent_failures = self.store.count_since(health.window());

        HealthReport {
            status: health.classify(recent_failures),
            recent_failures,
            window_secs: health.window_secs,
            total_failures: self.store.len(),
            components: ComponentStatus {
                failure_store: self.is_initialized(),
                capture_layer: self.capture.is_running(),
                remediation_registry: !self.registry.is_empty(),
                stats_listener: self
                    .stats_subscription
                    .lock()
                    .map(|s| s.as_ref().map_or(false, Subscription::is_active))
                    .unwrap_or(false),
            },
            session_id: self.store.session_id().to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }

    /// Receiver that observes health status changes
    pub fn watch_health(&self) -> watch::Receiver<HealthStatus> {
        self.status_tx.subscribe()
    }

    pub fn generate_report(&self) -> MonitorReport {
        let catalog = self
            .registry
            .get_all()
            .iter()
            .map(|rule| {
                let stats = rule.stats();
                RuleSummary {
                    id: rule.id().to_string(),
                    name: rule.name().to_string(),
                    category: rule.rule_category(),
                    priority: rule.priority_value(),
                    times_applied: stats.times_applied,
                    success_rate: stats.success_rate,
                }
            })
            .collect();

        MonitorReport {
            generated_at: Utc::now(),
            health: self.get_health(),
            failures: self.store.stats(),
            trends: self.store.trends(),
            remediation: self.registry.stats(),
            capture: self.capture.stats(),
            catalog,
        }
    }

    /// Orchestrator for one boundary, wired to the shared store and registry
    pub fn create_orchestrator<S: Into<String>>(
        &self,
        boundary_id: S,
        boundary: Arc<dyn RecoveryBoundary>,
    ) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(
            boundary_id,
            self.config.recovery.clone(),
            self.store.clone(),
            self.registry.clone(),
            boundary,
        )
    }

    pub fn report_failure(&self, event: FailureEvent) -> Uuid {
        self.store.report(event)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&FailureEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn get_stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn register_rule(&self, rule: RemediationRule) -> Result<()> {
        self.registry.register(rule)
    }

    pub fn find_match(&self, event: &FailureEvent) -> Option<RemediationRule> {
        self.registry.find_match(event)
    }

    pub async fn apply_fix(&self, rule: &RemediationRule, event: &FailureEvent, context: Option<FailureContext>) -> bool {
        self.registry.apply(rule, event, context).await
    }

    pub fn store(&self) -> &Arc<FailureStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RemediationRegistry> {
        &self.registry
    }

    pub fn capture(&self) -> &CaptureLayer {
        &self.capture
    }

    pub fn config(&self) -> &SelfHealingConfig {
        &self.config
    }

    fn refresh_status(&self) {
        let status = self.config.health.classify(self.store.count_since(self.config.health.window()));
        publish_status(&self.status_tx, status);
    }
}

impl Drop for SelfHealingMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SelfHealingMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHealingMonitor")
            .field("initialized", &self.is_initialized())
            .field("store", &self.store)
            .field("registry", &self.registry)
            .finish()
    }
}

fn stats_listener(
    store: Weak<FailureStore>,
    health: HealthConfig,
    status_tx: Arc<watch::Sender<HealthStatus>>,
) -> impl Fn(&FailureEvent) + Send + Sync + 'static {
    move |event| {
        log_failure_event(event);

        if let Some(store) = store.upgrade() {
            let recent = store.count_since(health.window());
            let status = health.classify(recent);
            debug!(stored = store.len(), recent, status = %status, "Failure statistics updated");
            publish_status(&status_tx, status);
        }
    }
}

fn publish_status(status_tx: &watch::Sender<HealthStatus>, status: HealthStatus) {
    let changed = status_tx.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
    if changed {
        info!(status = %status, "Health status changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DiagnosticLevel;
    use crate::types::FailureCategory;

    fn monitor() -> SelfHealingMonitor {
        SelfHealingMonitor::new(SelfHealingConfig::default(), MonitorComponents::default()).unwrap()
    }

    fn failure(message: &str) -> FailureEvent {
        FailureEvent::new(FailureCategory::RuntimeError, message)
    }

    #[test]
    fn test_classification_thresholds() {
        let health = HealthConfig::default();
        assert_eq!(health.classify(0), HealthStatus::Healthy);
        assert_eq!(health.classify(5), HealthStatus::Healthy);
        assert_eq!(health.classify(6), HealthStatus::Warning);
        assert_eq!(health.classify(10), HealthStatus::Warning);
        assert_eq!(health.classify(11), HealthStatus::Critical);
    }

    #[test]
    fn test_new_registers_builtin_rules() {
        let monitor = monitor();
        assert_eq!(monitor.registry().len(), 7);
        assert!(!monitor.is_initialized());
        assert!(!monitor.capture().is_running());
    }

    #[test]
    fn test_initialize_is_guarded() {
        let monitor = monitor();
        monitor.initialize();
        monitor.initialize();

        assert!(monitor.is_initialized());
        assert!(monitor.capture().is_running());
        assert_eq!(monitor.store().listener_count(), 1);

        let health = monitor.get_health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.components.capture_layer && health.components.stats_listener);
    }

    #[test]
    fn test_shutdown_and_restart() {
        let monitor = monitor();
        monitor.shutdown();

        monitor.initialize();
        monitor.shutdown();
        assert!(!monitor.capture().is_running());
        assert_eq!(monitor.store().listener_count(), 0);
        assert!(!monitor.get_health().components.stats_listener);

        monitor.restart();
        assert!(monitor.is_initialized());
        assert_eq!(monitor.store().listener_count(), 1);
    }

    #[test]
    fn test_initialize_restores_persisted_failures() {
        let persistence: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        {
            let previous =
                SelfHealingMonitor::new(SelfHealingConfig::default(), MonitorComponents::default().with_persistence(persistence.clone()))
                    .unwrap();
            previous.report_failure(failure("from last run"));
        }

        let monitor = SelfHealingMonitor::new(
            SelfHealingConfig::default(),
            MonitorComponents::default().with_persistence(persistence),
        )
        .unwrap();
        assert!(monitor.store().is_empty());
        monitor.initialize();
        assert_eq!(monitor.get_stats().total, 1);
    }

    #[test]
    fn test_health_tracks_recent_failures() {
        let monitor = monitor();
        monitor.initialize();
        let status = monitor.watch_health();

        for i in 0..6 {
            monitor.report_failure(failure(&format!("f{}", i)));
        }
        assert_eq!(monitor.get_health().status, HealthStatus::Warning);
        assert_eq!(*status.borrow(), HealthStatus::Warning);

        for i in 6..11 {
            monitor.report_failure(failure(&format!("f{}", i)));
        }
        let health = monitor.get_health();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.recent_failures, 11);
        assert_eq!(*status.borrow(), HealthStatus::Critical);
    }

    #[test]
    fn test_old_failures_do_not_count() {
        let monitor = monitor();
        for _ in 0..20 {
            monitor.report_failure(failure("old").occurred_at(Utc::now() - chrono::Duration::minutes(10)));
        }
        let health = monitor.get_health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.total_failures, 20);
    }

    #[test]
    fn test_captured_errors_reach_report() {
        let monitor = monitor();
        monitor.initialize();
        monitor
            .capture()
            .channel()
            .log(DiagnosticLevel::Error, &["Cannot find module 'lodash'".into()]);

        let report = monitor.generate_report();
        assert_eq!(report.failures.total, 1);
        assert_eq!(report.capture.forwarded, 1);
        assert_eq!(report.catalog.len(), 7);
        assert_eq!(report.catalog[0].id, "dependency-missing");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["health"]["status"], "healthy");
        assert!(json["failures"]["byCategory"]["diagnostic-output"].is_number());
    }

    #[tokio::test]
    async fn test_find_and_apply_through_monitor() {
        let monitor = monitor();
        let event = FailureEvent::new(FailureCategory::DiagnosticOutput, "Cannot find module 'lodash'");
        let rule = monitor.find_match(&event).unwrap();
        assert_eq!(rule.id(), "dependency-missing");
        assert!(!monitor.apply_fix(&rule, &event, None).await);
        assert_eq!(monitor.generate_report().remediation.total_applications, 1);
    }
}

//! # Self-Healing Runtime
//!
//! Observes runtime failures of a host application, records them, matches
//! them against remediation rules and drives per-boundary recovery.
//!
//! ## Components
//!
//! - [`capture`]: intercepts the leveled diagnostic channel and turns
//!   error-level output into failure events
//! - [`hooks`]: host failure-hook capability (panics, failed async tasks)
//! - [`store`]: bounded failure ledger with persistence, statistics and
//!   subscriptions
//! - [`remediation`] / [`builtin`]: rule catalog, matching and efficacy
//!   tracking
//! - [`recovery`]: recovery state machine with backoff and exhaustion
//! - [`monitor`]: context object tying the pieces together
//!
//! Nothing in the pipeline panics into the host: listener panics, failed
//! fixes and persistence errors are contained and logged.

pub mod builtin;
pub mod capture;
pub mod config;
pub mod context;
pub mod hooks;
pub mod logging;
pub mod matcher;
pub mod metrics_support;
pub mod monitor;
pub mod persistence;
pub mod recovery;
pub mod remediation;
pub mod store;
pub mod subscription;
pub mod types;

// Re-export commonly used types
pub use builtin::{register_builtin_rules, ConnectivityProbe, HostCapabilities, MemoryReclaimer};
pub use capture::{
    CaptureConfig, CaptureLayer, CaptureRecord, DiagnosticArg, DiagnosticChannel, DiagnosticLevel, DiagnosticSink,
    TracingSink,
};
pub use config::SelfHealingConfig;
pub use context::FailureContext;
pub use hooks::{HostFailure, HostFailureHooks, RuntimeHooks};
pub use logging::{init_logging, LoggingConfig};
pub use matcher::Matcher;
pub use monitor::{HealthConfig, HealthReport, HealthStatus, MonitorComponents, MonitorReport, SelfHealingMonitor};
pub use persistence::{FileStore, KeyValueStore, MemoryStore};
pub use recovery::{
    BoundaryFailure, RecoveryBoundary, RecoveryConfig, RecoveryOrchestrator, RecoveryPhase, RecoveryState,
    RecoveryTransition,
};
pub use remediation::{ImportSummary, RemediationRegistry, RemediationRule, RuleCategory};
pub use store::{FailureStore, StoreConfig, StoreStats};
pub use subscription::Subscription;
pub use types::{Error, FailureCategory, FailureEvent, Result};

/// Initializes logging and builds a monitor from layered configuration
pub fn init(config_path: Option<&std::path::Path>, components: MonitorComponents) -> Result<SelfHealingMonitor> {
    let config = SelfHealingConfig::load(config_path)?;
    init_logging(Some(config.logging.clone()))?;

    let monitor = SelfHealingMonitor::new(config, components)?;
    monitor.initialize();
    Ok(monitor)
}

#[cfg(test)]
mod tests;

//! Metric emission for the self-healing pipeline.
//!
//! Only the `metrics` facade is used here; the host decides whether an
//! exporter is installed. Without one every call is a no-op.

use metrics::{counter, gauge, increment_counter};

use crate::recovery::RecoveryPhase;
use crate::types::FailureEvent;

/// Records a failure accepted by the store
pub fn record_failure(event: &FailureEvent, stored: usize) {
    increment_counter!("self_healing_failures_total", "category" => event.category().as_str());
    gauge!("self_healing_failures_stored", stored as f64);
}

pub fn record_evictions(count: usize) {
    if count > 0 {
        counter!("self_healing_failures_evicted_total", count as u64);
    }
}

pub fn record_persistence_failure() {
    increment_counter!("self_healing_persistence_failures_total");
}

pub fn record_listener_panic() {
    increment_counter!("self_healing_listener_panics_total");
}

/// Records a diagnostic line seen by the capture layer
pub fn record_capture(level: &'static str, filtered: bool) {
    if filtered {
        increment_counter!("self_healing_capture_filtered_total", "level" => level);
    } else {
        increment_counter!("self_healing_capture_total", "level" => level);
    }
}

/// Records one remediation attempt
pub fn record_remediation(rule_id: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    increment_counter!(
        "self_healing_remediation_attempts_total",
        "rule" => rule_id.to_string(),
        "outcome" => outcome
    );
}

pub fn record_rule_count(rules: usize) {
    gauge!("self_healing_rules_registered", rules as f64);
}

/// Records a recovery phase transition
pub fn record_transition(to: RecoveryPhase) {
    increment_counter!("self_healing_recovery_transitions_total", "phase" => to.as_str());
    if to == RecoveryPhase::Exhausted {
        increment_counter!("self_healing_recovery_exhausted_total");
    }
}

//! # Recovery Orchestrator
//!
//! Per-boundary recovery state machine:
//!
//! ```text
//! Stable -> Failed -> Recovering -> Recovered --(delay)--> Stable
//!              \
//!               `--> Exhausted (attempt budget spent; manual reset only)
//! ```
//!
//! Every failure is reported to the shared [`FailureStore`]. While a cycle
//! is in flight, further failures are reported but do not start a second
//! cycle. The delayed reset is a cancellable timer owned by the state;
//! teardown and manual reset cancel it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::FailureContext;
use crate::metrics_support;
use crate::remediation::RemediationRegistry;
use crate::store::FailureStore;
use crate::types::{FailureCategory, FailureEvent};

const TRANSITION_CAPACITY: usize = 64;

/// Recovery phase of a boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPhase {
    /// No active failure
    Stable,
    /// Failure observed and reported
    Failed,
    /// Remediation lookup/apply in flight
    Recovering,
    /// Delayed reset pending
    Recovered,
    /// Attempt budget spent
    Exhausted,
}

impl RecoveryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPhase::Stable => "stable",
            RecoveryPhase::Failed => "failed",
            RecoveryPhase::Recovering => "recovering",
            RecoveryPhase::Recovered => "recovered",
            RecoveryPhase::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt budget and backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub delay_step_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            delay_step_ms: 1000,
        }
    }
}

impl RecoveryConfig {
    /// Reset delay after `attempt` completed attempts
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.base_delay_ms
                .saturating_add(self.delay_step_ms.saturating_mul(u64::from(attempt))),
        )
    }
}

/// A failure observed by a boundary
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFailure {
    pub message: String,
    pub stack: Option<String>,
    /// Path of the failing component inside the boundary
    pub component_stack: Option<String>,
    pub context: FailureContext,
}

impl BoundaryFailure {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            stack: None,
            component_stack: None,
            context: FailureContext::new(),
        }
    }

    pub fn stack<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn component_stack<S: Into<String>>(mut self, component_stack: S) -> Self {
        self.component_stack = Some(component_stack.into());
        self
    }

    pub fn context_entry<K: Into<String>, V: Serialize>(mut self, key: K, value: V) -> Self {
        self.context = self.context.add(key, value);
        self
    }

    fn into_event(self, boundary_id: &str) -> FailureEvent {
        let mut context = self.context.add("boundary", boundary_id);
        if let Some(component_stack) = self.component_stack {
            context = context.add("componentStack", component_stack);
        }

        let mut event = FailureEvent::new(FailureCategory::RenderBoundary, self.message).context(context);
        if let Some(stack) = self.stack {
            event = event.stack_trace(stack);
        }
        event
    }
}

/// The unit whose failures an orchestrator tracks
pub trait RecoveryBoundary: Send + Sync {
    /// Re-render or retry the children after a reset
    fn retry_children(&self);

    /// Show the terminal failure surface once attempts are exhausted
    fn show_terminal_failure(&self, _state: &RecoveryState) {}

    /// Full reload of the host
    fn request_reload(&self) {}
}

/// Point-in-time view of a boundary's recovery state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    pub boundary_id: String,
    pub phase: RecoveryPhase,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_failure: Option<FailureEvent>,
    pub applied_fix_id: Option<String>,
    pub pending_reset: bool,
}

/// Emitted on every phase change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTransition {
    pub boundary_id: String,
    pub from: RecoveryPhase,
    pub to: RecoveryPhase,
    /// Rule being tried, on entry into `Recovering`
    pub rule_id: Option<String>,
    pub attempt: u32,
}

/// Handle to a scheduled reset
#[derive(Debug, Default)]
struct CancellableTimer {
    handle: Option<JoinHandle<()>>,
}

impl CancellableTimer {
    fn schedule(&mut self, handle: JoinHandle<()>) {
        self.cancel();
        self.handle = Some(handle);
    }

    /// Idempotent
    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forgets the handle without aborting; used by the timer task itself
    fn release(&mut self) {
        self.handle = None;
    }

    fn is_pending(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

#[derive(Debug)]
struct StateInner {
    phase: RecoveryPhase,
    attempt_count: u32,
    last_failure: Option<FailureEvent>,
    applied_fix_id: Option<String>,
    timer: CancellableTimer,
    // Bumped whenever the running cycle is invalidated
    generation: u64,
    torn_down: bool,
}

struct OrchestratorInner {
    boundary_id: String,
    config: RecoveryConfig,
    store: Arc<FailureStore>,
    registry: Arc<RemediationRegistry>,
    boundary: Arc<dyn RecoveryBoundary>,
    state: Mutex<StateInner>,
    transitions: broadcast::Sender<RecoveryTransition>,
}

enum Decision {
    Recover(u64),
    Exhaust(u64),
    Coalesce,
    AlreadyExhausted,
}

/// Recovery state machine for one boundary
pub struct RecoveryOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl RecoveryOrchestrator {
    pub fn new<S: Into<String>>(
        boundary_id: S,
        config: RecoveryConfig,
        store: Arc<FailureStore>,
        registry: Arc<RemediationRegistry>,
        boundary: Arc<dyn RecoveryBoundary>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);

        Self {
            inner: Arc::new(OrchestratorInner {
                boundary_id: boundary_id.into(),
                config,
                store,
                registry,
                boundary,
                state: Mutex::new(StateInner {
                    phase: RecoveryPhase::Stable,
                    attempt_count: 0,
                    last_failure: None,
                    applied_fix_id: None,
                    timer: CancellableTimer::default(),
                    generation: 0,
                    torn_down: false,
                }),
                transitions,
            }),
        }
    }

    pub fn boundary_id(&self) -> &str {
        &self.inner.boundary_id
    }

    /// Handles a failure observed by the boundary and returns the phase it
    /// leaves the boundary in.
    pub async fn on_failure(&self, failure: BoundaryFailure) -> RecoveryPhase {
        let inner = &self.inner;
        let event = failure.into_event(&inner.boundary_id);

        let decision = {
            let mut state = inner.lock();
            if state.torn_down {
                debug!(boundary = %inner.boundary_id, "Failure after teardown ignored");
                return state.phase;
            }

            match state.phase {
                RecoveryPhase::Exhausted => Decision::AlreadyExhausted,
                RecoveryPhase::Failed | RecoveryPhase::Recovering | RecoveryPhase::Recovered => Decision::Coalesce,
                RecoveryPhase::Stable => {
                    state.generation += 1;
                    state.last_failure = Some(event.clone());
                    state.applied_fix_id = None;
                    inner.transition(&mut state, RecoveryPhase::Failed, None);

                    if state.attempt_count.saturating_add(1) >= inner.config.max_attempts {
                        Decision::Exhaust(state.generation)
                    } else {
                        Decision::Recover(state.generation)
                    }
                }
            }
        };

        inner.store.report(event.clone());

        match decision {
            Decision::AlreadyExhausted => {
                debug!(boundary = %inner.boundary_id, "Failure on exhausted boundary recorded");
                RecoveryPhase::Exhausted
            }
            Decision::Coalesce => {
                let state = inner.lock();
                debug!(
                    boundary = %inner.boundary_id,
                    phase = %state.phase,
                    "Recovery already in flight; failure recorded only"
                );
                state.phase
            }
            Decision::Exhaust(generation) => inner.exhaust(generation),
            Decision::Recover(generation) => self.recover(generation, event).await,
        }
    }

    async fn recover(&self, generation: u64, event: FailureEvent) -> RecoveryPhase {
        let inner = &self.inner;
        let rule = inner.registry.find_match(&event);

        {
            let mut state = inner.lock();
            if state.generation != generation || state.torn_down {
                return state.phase;
            }
            let rule_id = rule.as_ref().map(|r| r.id().to_string());
            state.applied_fix_id = rule_id.clone();
            inner.transition(&mut state, RecoveryPhase::Recovering, rule_id);
        }

        match &rule {
            Some(rule) => {
                info!(boundary = %inner.boundary_id, rule_id = %rule.id(), "Trying remediation");
                let fixed = inner.registry.apply(rule, &event, Some(event.context_map().clone())).await;
                debug!(boundary = %inner.boundary_id, rule_id = %rule.id(), fixed, "Remediation finished");
            }
            None => debug!(boundary = %inner.boundary_id, "No remediation rule; using generic retry"),
        }

        let mut state = inner.lock();
        if state.generation != generation || state.torn_down {
            // Reset or torn down while the action ran; its result is recorded already
            return state.phase;
        }

        inner.transition(&mut state, RecoveryPhase::Recovered, None);

        let delay = inner.config.delay_for(state.attempt_count);
        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.complete_reset(generation);
            }
        });
        state.timer.schedule(handle);

        info!(
            boundary = %inner.boundary_id,
            attempt = state.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduled boundary reset"
        );
        state.phase
    }

    /// Clears the attempt count and returns to `Stable`
    pub fn manual_reset(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            if state.torn_down {
                warn!(boundary = %inner.boundary_id, "Manual reset after teardown ignored");
                return;
            }
            state.timer.cancel();
            state.generation += 1;
            state.attempt_count = 0;
            state.last_failure = None;
            state.applied_fix_id = None;
            if state.phase != RecoveryPhase::Stable {
                inner.transition(&mut state, RecoveryPhase::Stable, None);
            }
        }

        info!(boundary = %inner.boundary_id, "Boundary manually reset");
        inner.boundary.retry_children();
    }

    /// Forwards a full-reload request to the boundary
    pub fn request_reload(&self) {
        info!(boundary = %self.inner.boundary_id, "Full reload requested");
        self.inner.boundary.request_reload();
    }

    /// Cancels any pending reset. Idempotent.
    pub fn teardown(&self) {
        let mut state = self.inner.lock();
        if state.torn_down {
            return;
        }
        state.timer.cancel();
        state.generation += 1;
        state.torn_down = true;
        debug!(boundary = %self.inner.boundary_id, "Boundary torn down");
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.inner.lock().phase
    }

    pub fn attempt_count(&self) -> u32 {
        self.inner.lock().attempt_count
    }

    pub fn has_pending_reset(&self) -> bool {
        self.inner.lock().timer.is_pending()
    }

    pub fn snapshot(&self) -> RecoveryState {
        self.inner.snapshot(&self.inner.lock())
    }

    /// Receiver for phase transitions
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryTransition> {
        self.inner.transitions.subscribe()
    }
}

impl Drop for RecoveryOrchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RecoveryOrchestrator")
            .field("boundary_id", &self.inner.boundary_id)
            .field("phase", &state.phase)
            .field("attempt_count", &state.attempt_count)
            .finish()
    }
}

impl OrchestratorInner {
    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, state: &mut StateInner, to: RecoveryPhase, rule_id: Option<String>) {
        let from = state.phase;
        state.phase = to;
        metrics_support::record_transition(to);
        debug!(boundary = %self.boundary_id, from = %from, to = %to, "Recovery transition");

        // No receivers is fine
        let _ = self.transitions.send(RecoveryTransition {
            boundary_id: self.boundary_id.clone(),
            from,
            to,
            rule_id,
            attempt: state.attempt_count,
        });
    }

    fn snapshot(&self, state: &StateInner) -> RecoveryState {
        RecoveryState {
            boundary_id: self.boundary_id.clone(),
            phase: state.phase,
            attempt_count: state.attempt_count,
            max_attempts: self.config.max_attempts,
            last_failure: state.last_failure.clone(),
            applied_fix_id: state.applied_fix_id.clone(),
            pending_reset: state.timer.is_pending(),
        }
    }

    fn exhaust(&self, generation: u64) -> RecoveryPhase {
        let snapshot = {
            let mut state = self.lock();
            if state.generation != generation || state.torn_down {
                return state.phase;
            }
            state.attempt_count = self.config.max_attempts;
            self.transition(&mut state, RecoveryPhase::Exhausted, None);
            self.snapshot(&state)
        };

        error!(
            boundary = %self.boundary_id,
            attempts = snapshot.attempt_count,
            "Recovery attempts exhausted; manual reset required"
        );
        self.boundary.show_terminal_failure(&snapshot);
        RecoveryPhase::Exhausted
    }

    fn complete_reset(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation || state.torn_down || state.phase != RecoveryPhase::Recovered {
                return;
            }
            state.timer.release();
            state.attempt_count += 1;
            self.transition(&mut state, RecoveryPhase::Stable, None);
            info!(boundary = %self.boundary_id, attempt = state.attempt_count, "Boundary reset; retrying children");
        }

        self.boundary.retry_children();
    }
}

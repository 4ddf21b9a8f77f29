//! Built-in remediation rules.
//!
//! Most of these only advise: they log guidance and report failure so no
//! state is marked healthy by accident. The transient-network rule is the
//! one that can actually resolve a failure, and the runaway-update rule
//! reclaims memory when the host offers a way to.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::matcher::Matcher;
use crate::remediation::{action, RemediationAction, RemediationRegistry, RemediationRule, RuleCategory};
use crate::types::{FailureCategory, FailureEvent, Result};

pub const DEPENDENCY_MISSING: &str = "dependency-missing";
pub const TRANSIENT_NETWORK: &str = "transient-network";
pub const RUNAWAY_UPDATE: &str = "runaway-update";
pub const CORS_MISCONFIGURATION: &str = "cors-misconfiguration";
pub const UNDEFINED_REFERENCE: &str = "undefined-reference";
pub const UI_LIST_KEY: &str = "ui-list-key";
pub const UNMOUNT_STATE_UPDATE: &str = "unmount-state-update";

static MODULE_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)(?:cannot find module|module not found|can't resolve|unresolved import)[:\s]*['"`]?([^'"`\s]+)"#).ok());

/// Checks whether the network is reachable again
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> BoxFuture<'_, bool>;
}

/// Frees memory held by the host, e.g. caches
pub trait MemoryReclaimer: Send + Sync {
    /// Returns `Ok(true)` when something was reclaimed
    fn reclaim(&self) -> anyhow::Result<bool>;
}

/// Optional host capabilities used by the built-in rules
#[derive(Clone)]
pub struct HostCapabilities {
    pub connectivity: Option<Arc<dyn ConnectivityProbe>>,
    pub reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    /// Wait before re-checking connectivity
    pub network_settle_delay: Duration,
}

impl HostCapabilities {
    pub fn new() -> Self {
        Self {
            connectivity: None,
            reclaimer: None,
            network_settle_delay: Duration::from_secs(1),
        }
    }

    pub fn with_connectivity(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = Some(probe);
        self
    }

    pub fn with_reclaimer(mut self, reclaimer: Arc<dyn MemoryReclaimer>) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    pub fn with_network_settle_delay(mut self, delay: Duration) -> Self {
        self.network_settle_delay = delay;
        self
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCapabilities")
            .field("connectivity", &self.connectivity.is_some())
            .field("reclaimer", &self.reclaimer.is_some())
            .field("network_settle_delay", &self.network_settle_delay)
            .finish()
    }
}

/// Builds the built-in rule set
pub fn builtin_rules(capabilities: &HostCapabilities) -> Result<Vec<RemediationRule>> {
    Ok(vec![
        dependency_missing()?,
        transient_network(capabilities)?,
        runaway_update(capabilities)?,
        advisory_rule(
            CORS_MISCONFIGURATION,
            "CORS misconfiguration",
            r"(?i)(\bCORS\b|cross-origin|Access-Control-Allow-Origin)",
            "Check the server's allowed origins or route the request through a proxy",
            80,
            RuleCategory::Configuration,
        )?,
        advisory_rule(
            UNDEFINED_REFERENCE,
            "Undefined reference",
            r"(?i)(cannot read propert(y|ies) of (undefined|null)|is not defined|undefined is not|on a `None` value)",
            "Guard the access with a presence check or provide a default value",
            70,
            RuleCategory::Runtime,
        )?,
        advisory_rule(
            UI_LIST_KEY,
            "List item key",
            r#"(?i)each child in a list should have a unique "?key"?"#,
            "Give each rendered list item a stable, unique key",
            60,
            RuleCategory::Ui,
        )?,
        advisory_rule(
            UNMOUNT_STATE_UPDATE,
            "State update after unmount",
            r"(?i)(state update on an unmounted component|update on a component that (has been|was) (dropped|unmounted))",
            "Cancel pending work when the component is torn down",
            50,
            RuleCategory::Ui,
        )?,
    ])
}

/// Registers the built-in rules, returning how many were added
pub fn register_builtin_rules(registry: &RemediationRegistry, capabilities: &HostCapabilities) -> Result<usize> {
    let rules = builtin_rules(capabilities)?;
    let count = rules.len();
    for rule in rules {
        registry.register(rule)?;
    }
    info!(count, "Registered built-in remediation rules");
    Ok(count)
}

fn dependency_missing() -> Result<RemediationRule> {
    let rule = RemediationRule::new(
        DEPENDENCY_MISSING,
        "Missing dependency",
        Matcher::pattern(r"(?i)(cannot find module|module not found|can't resolve|unresolved import)")?,
        |event: FailureEvent, _| async move {
            match missing_module(&event) {
                Some(module) => warn!(
                    module = %module,
                    event_id = %event.id(),
                    "Missing dependency; install it (e.g. `npm install {}` or `cargo add {}`) and restart",
                    module,
                    module
                ),
                None => warn!(event_id = %event.id(), "Missing dependency; install it and restart"),
            }
            // Installing is out of our hands
            Ok(false)
        },
    )
    .description("An imported module could not be resolved; suggests the install command")
    .priority(100)
    .category(RuleCategory::Dependency)
    .applies_to(FailureCategory::DiagnosticOutput)
    .applies_to(FailureCategory::RuntimeError)
    .applies_to(FailureCategory::RenderBoundary);
    Ok(rule)
}

fn transient_network(capabilities: &HostCapabilities) -> Result<RemediationRule> {
    let probe = capabilities.connectivity.clone();
    let delay = capabilities.network_settle_delay;

    let rule = RemediationRule::new(
        TRANSIENT_NETWORK,
        "Transient network failure",
        Matcher::pattern(
            r"(?i)(failed to fetch|network ?error|connection (reset|refused|closed)|timed? ?out|ECONNRESET|ETIMEDOUT|\b503\b)",
        )?,
        move |_, _| {
            let probe = probe.clone();
            async move {
                tokio::time::sleep(delay).await;
                let online = match &probe {
                    Some(probe) => probe.is_online().await,
                    None => true,
                };
                info!(online, "Re-checked connectivity after transient network failure");
                Ok(online)
            }
        },
    )
    .description("Waits briefly and re-checks connectivity so the boundary can retry")
    .priority(90)
    .category(RuleCategory::Runtime)
    .applies_to(FailureCategory::RejectedOperation)
    .applies_to(FailureCategory::DiagnosticOutput);
    Ok(rule)
}

fn runaway_update(capabilities: &HostCapabilities) -> Result<RemediationRule> {
    let reclaimer = capabilities.reclaimer.clone();

    let rule = RemediationRule::new(
        RUNAWAY_UPDATE,
        "Runaway update or memory pressure",
        Matcher::pattern(
            r"(?i)(maximum update depth exceeded|too much recursion|out of memory|memory allocation of \d+ bytes failed|stack overflow)",
        )?,
        move |_, _| {
            let reclaimer = reclaimer.clone();
            async move {
                match reclaimer {
                    Some(reclaimer) => reclaimer.reclaim(),
                    None => {
                        warn!("Memory pressure detected but the host offers no way to reclaim memory");
                        Ok(false)
                    }
                }
            }
        },
    )
    .description("Attempts a best-effort memory reclaim when the host supports one")
    .priority(85)
    .category(RuleCategory::Runtime)
    .applies_to(FailureCategory::RuntimeError)
    .applies_to(FailureCategory::RenderBoundary);
    Ok(rule)
}

fn advisory_rule(
    id: &'static str,
    name: &'static str,
    pattern: &str,
    guidance: &'static str,
    priority: i32,
    category: RuleCategory,
) -> Result<RemediationRule> {
    Ok(
        RemediationRule::with_action(id, name, Matcher::pattern(pattern)?, advisory(id, guidance))
            .description(guidance)
            .priority(priority)
            .category(category)
            .applies_to(FailureCategory::DiagnosticOutput)
            .applies_to(FailureCategory::RuntimeError),
    )
}

fn advisory(rule_id: &'static str, guidance: &'static str) -> RemediationAction {
    action(move |event: FailureEvent, _| async move {
        warn!(rule_id, event_id = %event.id(), suggestion = guidance, "Advisory remediation");
        Ok(false)
    })
}

/// Module name mentioned by a missing-dependency failure
pub fn missing_module(event: &FailureEvent) -> Option<String> {
    let re = MODULE_NAME.as_ref()?;
    re.captures(event.message())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

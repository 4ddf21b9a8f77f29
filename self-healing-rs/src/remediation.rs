//! # Remediation Registry
//!
//! Catalog of fix strategies. Rules are kept sorted by descending priority;
//! [`RemediationRegistry::find_match`] returns the first rule whose matcher
//! and conditions accept a failure, and [`RemediationRegistry::apply`] runs
//! its action and tracks how often it works.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::FailureContext;
use crate::hooks::{contained, Contained};
use crate::matcher::Matcher;
use crate::metrics_support;
use crate::types::{Error, FailureCategory, FailureEvent, Result};

const HISTORY_LIMIT: usize = 100;
const HISTORY_TRIMMED: usize = 50;

/// Reporting category of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Dependency,
    Configuration,
    Runtime,
    Ui,
    Build,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Dependency => "dependency",
            RuleCategory::Configuration => "configuration",
            RuleCategory::Runtime => "runtime",
            RuleCategory::Ui => "ui",
            RuleCategory::Build => "build",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous fix strategy. `Ok(true)` means the fix worked.
pub type RemediationAction =
    Arc<dyn Fn(FailureEvent, Option<FailureContext>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Zero-argument predicate that must hold for a rule to match
pub type RuleCondition = Arc<dyn Fn() -> bool + Send + Sync>;

/// Boxes an async closure into a [`RemediationAction`]
pub fn action<F, Fut>(f: F) -> RemediationAction
where
    F: Fn(FailureEvent, Option<FailureContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(move |event, context| f(event, context).boxed())
}

/// Running efficacy statistics of a rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStats {
    pub times_applied: u64,
    pub success_rate: f64,
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl RuleStats {
    fn record(&mut self, success: bool, at: DateTime<Utc>) {
        self.times_applied += 1;
        let n = self.times_applied as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = ((self.success_rate * (n - 1.0)) + outcome) / n;
        self.last_applied_at = Some(at);
    }
}

/// One fix strategy.
///
/// Clones share statistics, so a rule returned by
/// [`RemediationRegistry::find_match`] reports into the registered entry.
#[derive(Clone)]
pub struct RemediationRule {
    id: String,
    name: String,
    description: String,
    matcher: Matcher,
    applicable_categories: BTreeSet<FailureCategory>,
    action: RemediationAction,
    priority: i32,
    category: RuleCategory,
    conditions: Vec<RuleCondition>,
    stats: Arc<Mutex<RuleStats>>,
}

impl RemediationRule {
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, matcher: Matcher, f: F) -> Self
    where
        F: Fn(FailureEvent, Option<FailureContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self::with_action(id, name, matcher, action(f))
    }

    pub fn with_action(
        id: impl Into<String>,
        name: impl Into<String>,
        matcher: Matcher,
        action: RemediationAction,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            matcher,
            applicable_categories: BTreeSet::new(),
            action,
            priority: 0,
            category: RuleCategory::Runtime,
            conditions: Vec::new(),
            stats: Arc::new(Mutex::new(RuleStats::default())),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn category(mut self, category: RuleCategory) -> Self {
        self.category = category;
        self
    }

    /// Declares a failure category this rule is meant for
    pub fn applies_to(mut self, category: FailureCategory) -> Self {
        self.applicable_categories.insert(category);
        self
    }

    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.conditions.push(Arc::new(condition));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description_text(&self) -> &str {
        &self.description
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn applicable_categories(&self) -> &BTreeSet<FailureCategory> {
        &self.applicable_categories
    }

    pub fn priority_value(&self) -> i32 {
        self.priority
    }

    pub fn rule_category(&self) -> RuleCategory {
        self.category
    }

    pub fn stats(&self) -> RuleStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Matcher against message or stack, and every condition
    pub fn matches(&self, event: &FailureEvent) -> bool {
        self.matcher.matches(event)
            && self
                .conditions
                .iter()
                .all(|condition| contained(|| condition()).unwrap_or(false))
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRule("rule id is required".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidRule(format!("rule '{}' has no name", self.id)));
        }
        if self.matcher.is_empty() {
            return Err(Error::InvalidRule(format!("rule '{}' has an empty matcher", self.id)));
        }
        Ok(())
    }

    fn export(&self) -> RuleExport {
        let stats = self.stats();
        RuleExport {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            matcher: self.matcher.clone(),
            applicable_categories: self.applicable_categories.clone(),
            priority: self.priority,
            category: self.category,
            times_applied: stats.times_applied,
            success_rate: stats.success_rate,
            last_applied_at: stats.last_applied_at,
        }
    }
}

impl fmt::Debug for RemediationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemediationRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("priority", &self.priority)
            .field("category", &self.category)
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

/// Serialized form of a rule. Actions and conditions are not exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleExport {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub matcher: Matcher,
    #[serde(default)]
    pub applicable_categories: BTreeSet<FailureCategory>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_rule_category")]
    pub category: RuleCategory,
    #[serde(default)]
    pub times_applied: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub last_applied_at: Option<DateTime<Utc>>,
}

fn default_rule_category() -> RuleCategory {
    RuleCategory::Runtime
}

impl RuleExport {
    /// Rebuilds a rule around an advisory action that logs the description
    fn into_rule(self) -> RemediationRule {
        let description = self.description.clone();
        let rule_id = self.id.clone();
        let advisory = action(move |event: FailureEvent, _| {
            let description = description.clone();
            let rule_id = rule_id.clone();
            async move {
                info!(rule_id = %rule_id, event_id = %event.id(), suggestion = %description, "Advisory remediation");
                Ok(false)
            }
        });

        let mut rule = RemediationRule::with_action(self.id, self.name, self.matcher, advisory)
            .description(self.description)
            .priority(self.priority)
            .category(self.category);
        rule.applicable_categories = self.applicable_categories;
        rule
    }
}

/// One recorded application of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationAttempt {
    pub rule_id: String,
    pub rule_name: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub event_id: Uuid,
    pub event_message: String,
}

/// Outcome of [`RemediationRegistry::import`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUsage {
    pub id: String,
    pub name: String,
    pub times_applied: u64,
    pub success_rate: f64,
}

/// Aggregate registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_rules: usize,
    pub by_category: BTreeMap<RuleCategory, usize>,
    pub total_applications: u64,
    pub overall_success_rate: f64,
    pub most_applied: Vec<RuleUsage>,
    pub recent_attempts: Vec<RemediationAttempt>,
}

/// Registry of remediation rules, sorted by descending priority
pub struct RemediationRegistry {
    rules: RwLock<Vec<RemediationRule>>,
    history: Mutex<VecDeque<RemediationAttempt>>,
}

impl RemediationRegistry {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds a rule. Rejects rules missing an id, name or matcher, and ids
    /// that are already registered; a rejected rule leaves the registry
    /// untouched.
    pub fn register(&self, rule: RemediationRule) -> Result<()> {
        rule.validate()?;

        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(Error::DuplicateRule(rule.id));
        }

        debug!(rule_id = %rule.id, priority = rule.priority, "Registering remediation rule");
        rules.push(rule);
        // Stable: equal priorities keep registration order
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        metrics_support::record_rule_count(rules.len());
        Ok(())
    }

    /// Removes a rule, returning it if it was registered
    pub fn remove(&self, id: &str) -> Option<RemediationRule> {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        let index = rules.iter().position(|r| r.id == id)?;
        let rule = rules.remove(index);
        metrics_support::record_rule_count(rules.len());
        Some(rule)
    }

    pub fn get(&self, id: &str) -> Option<RemediationRule> {
        self.read().iter().find(|r| r.id == id).cloned()
    }

    /// All rules in priority order
    pub fn get_all(&self) -> Vec<RemediationRule> {
        self.read().clone()
    }

    pub fn get_by_category(&self, category: RuleCategory) -> Vec<RemediationRule> {
        self.read().iter().filter(|r| r.category == category).cloned().collect()
    }

    /// Case-insensitive search over id, name, description and matcher source
    pub fn search(&self, query: &str) -> Vec<RemediationRule> {
        let query = query.to_lowercase();
        self.read()
            .iter()
            .filter(|r| {
                [r.id.as_str(), r.name.as_str(), r.description.as_str(), r.matcher.source()]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// First rule, in priority order, that matches the event
    pub fn find_match(&self, event: &FailureEvent) -> Option<RemediationRule> {
        let found = self.read().iter().find(|r| r.matches(event)).cloned();
        match &found {
            Some(rule) => debug!(rule_id = %rule.id, event_id = %event.id(), "Remediation rule matched"),
            None => debug!(event_id = %event.id(), "No remediation rule matched"),
        }
        found
    }

    /// Runs the rule's action. Errors and panics count as a failed attempt
    /// and are logged, never returned.
    pub async fn apply(&self, rule: &RemediationRule, event: &FailureEvent, context: Option<FailureContext>) -> bool {
        info!(rule_id = %rule.id, event_id = %event.id(), "Applying remediation");

        let outcome = match contained(|| (rule.action)(event.clone(), context)) {
            Ok(future) => AssertUnwindSafe(Contained::new(future)).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let result = match outcome {
            Ok(Ok(success)) => Ok(success),
            Ok(Err(e)) => Err(Error::Remediation(format!("{:#}", e))),
            Err(_) => Err(Error::Remediation("action panicked".to_string())),
        };
        let success = result.unwrap_or_else(|e| {
            error!(rule_id = %rule.id, error = %e, "Remediation action failed");
            false
        });

        let now = Utc::now();
        rule.stats.lock().unwrap_or_else(|e| e.into_inner()).record(success, now);
        self.record_attempt(RemediationAttempt {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            success,
            timestamp: now,
            event_id: event.id(),
            event_message: event.message().to_string(),
        });
        metrics_support::record_remediation(&rule.id, success);

        if success {
            info!(rule_id = %rule.id, "Remediation succeeded");
        } else {
            debug!(rule_id = %rule.id, "Remediation did not resolve the failure");
        }
        success
    }

    fn record_attempt(&self, attempt: RemediationAttempt) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(attempt);
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_TRIMMED;
            history.drain(..excess);
        }
    }

    /// Recorded attempts, oldest first
    pub fn history(&self) -> Vec<RemediationAttempt> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let rules = self.read().clone();

        let mut by_category = BTreeMap::new();
        let mut usage = Vec::with_capacity(rules.len());
        let mut total_applications = 0;
        let mut weighted_successes = 0.0;

        for rule in &rules {
            *by_category.entry(rule.category).or_insert(0) += 1;
            let stats = rule.stats();
            total_applications += stats.times_applied;
            weighted_successes += stats.success_rate * stats.times_applied as f64;
            usage.push(RuleUsage {
                id: rule.id.clone(),
                name: rule.name.clone(),
                times_applied: stats.times_applied,
                success_rate: stats.success_rate,
            });
        }

        usage.retain(|u| u.times_applied > 0);
        usage.sort_by(|a, b| b.times_applied.cmp(&a.times_applied));
        usage.truncate(5);

        let recent_attempts = {
            let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.iter().rev().take(10).cloned().collect()
        };

        RegistryStats {
            total_rules: rules.len(),
            by_category,
            total_applications,
            overall_success_rate: if total_applications > 0 {
                weighted_successes / total_applications as f64
            } else {
                0.0
            },
            most_applied: usage,
            recent_attempts,
        }
    }

    /// Serializes the catalog as a JSON array
    pub fn export(&self) -> Result<String> {
        let rules: Vec<RuleExport> = self.read().iter().map(RemediationRule::export).collect();
        Ok(serde_json::to_string_pretty(&rules)?)
    }

    /// Registers rules from a JSON array produced by [`Self::export`].
    ///
    /// Entries without an id, name or valid matcher, and entries that fail
    /// registration, are skipped with a warning. Anything other than an
    /// array is a format error.
    pub fn import(&self, json: &str) -> Result<ImportSummary> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| Error::format("rule catalog", e.to_string()))?;
        let entries = match value {
            serde_json::Value::Array(entries) => entries,
            other => {
                return Err(Error::format(
                    "rule catalog",
                    format!("expected an array of rules, found {}", json_kind(&other)),
                ))
            }
        };

        let mut summary = ImportSummary::default();
        for (index, entry) in entries.into_iter().enumerate() {
            let parsed: RuleExport = match serde_json::from_value(entry) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(index, error = %e, "Skipping malformed rule during import");
                    summary.skipped += 1;
                    continue;
                }
            };

            let id = parsed.id.clone();
            match self.register(parsed.into_rule()) {
                Ok(()) => summary.imported += 1,
                Err(e) => {
                    warn!(rule_id = %id, error = %e, "Skipping rule during import");
                    summary.skipped += 1;
                }
            }
        }

        info!(imported = summary.imported, skipped = summary.skipped, "Imported remediation rules");
        Ok(summary)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<RemediationRule>> {
        self.rules.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RemediationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RemediationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemediationRegistry")
            .field("rules", &self.len())
            .finish()
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

//! # Core Types
//!
//! Failure events, their categories, and the crate-wide error type.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::FailureContext;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the self-healing pipeline.
///
/// Most failures inside the pipeline are contained and only logged; the
/// variants that reach a caller are registration errors, format errors on
/// import/export, and configuration or initialization problems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A remediation rule is missing a required field
    #[error("invalid remediation rule: {0}")]
    InvalidRule(String),

    /// A remediation rule with the same id is already registered
    #[error("remediation rule `{0}` is already registered")]
    DuplicateRule(String),

    /// A matcher pattern failed to compile
    #[error("invalid matcher pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Imported or restored data does not have the expected shape
    #[error("unrecognized {what} format: {reason}")]
    Format { what: &'static str, reason: String },

    /// The key-value persistence surface rejected an operation
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Logging or lifecycle initialization failed
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Processing an intercepted diagnostic call failed
    #[error("capture error: {0}")]
    Capture(String),

    /// A remediation action failed or panicked
    #[error("remediation failed: {0}")]
    Remediation(String),
}

impl Error {
    /// Creates a format error for the named payload
    pub fn format<S: Into<String>>(what: &'static str, reason: S) -> Self {
        Error::Format {
            what,
            reason: reason.into(),
        }
    }

    /// Returns true for errors raised by rule registration
    pub fn is_registration_error(&self) -> bool {
        matches!(self, Error::InvalidRule(_) | Error::DuplicateRule(_))
    }
}

/// The source a failure was observed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    /// A UI render boundary caught a failure in its subtree
    RenderBoundary,
    /// An error-level line on the diagnostic-output channel
    DiagnosticOutput,
    /// An asynchronous operation completed with an error
    RejectedOperation,
    /// An uncaught runtime failure
    RuntimeError,
}

impl FailureCategory {
    /// Every category, in declaration order
    pub const ALL: [FailureCategory; 4] = [
        FailureCategory::RenderBoundary,
        FailureCategory::DiagnosticOutput,
        FailureCategory::RejectedOperation,
        FailureCategory::RuntimeError,
    ];

    /// The wire name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::RenderBoundary => "render-boundary",
            FailureCategory::DiagnosticOutput => "diagnostic-output",
            FailureCategory::RejectedOperation => "rejected-operation",
            FailureCategory::RuntimeError => "runtime-error",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed runtime failure.
///
/// Events are immutable once built. The builder methods consume the event,
/// so a reporter constructs it fully before handing it to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEvent {
    id: Uuid,
    category: FailureCategory,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack_trace: Option<String>,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    context: FailureContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
}

impl FailureEvent {
    /// Creates a new failure event of the given category, stamped now
    pub fn new<S: Into<String>>(category: FailureCategory, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            message: message.into(),
            stack_trace: None,
            occurred_at: Utc::now(),
            context: FailureContext::new(),
            session_id: None,
            origin: None,
        }
    }

    /// Sets the stack trace
    pub fn stack_trace<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack_trace = Some(stack.into());
        self
    }

    /// Replaces the context mapping
    pub fn context(mut self, context: FailureContext) -> Self {
        self.context = context;
        self
    }

    /// Adds a single context entry
    pub fn context_entry<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        self.context = self.context.add(key, value);
        self
    }

    /// Overrides the occurrence timestamp
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    /// Sets the session id
    pub fn session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the origin (host agent / location) string
    pub fn origin<S: Into<String>>(mut self, origin: S) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Fills in session and origin when the reporter left them unset
    pub(crate) fn stamped(mut self, session_id: &str, origin: Option<&str>) -> Self {
        if self.session_id.is_none() {
            self.session_id = Some(session_id.to_string());
        }
        if self.origin.is_none() {
            self.origin = origin.map(str::to_string);
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn category(&self) -> FailureCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn context_map(&self) -> &FailureContext {
        &self.context
    }

    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn origin_str(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Case-insensitive substring match over message, stack and category
    pub fn matches_query(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.message.to_lowercase().contains(&needle)
            || self
                .stack_trace
                .as_deref()
                .map_or(false, |s| s.to_lowercase().contains(&needle))
            || self.category.as_str().contains(&needle)
    }
}

impl fmt::Display for FailureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;

        if let Some(session) = &self.session_id {
            write!(f, " [Session: {}]", session)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = FailureEvent::new(FailureCategory::RenderBoundary, "boom")
            .stack_trace("at Widget")
            .context_entry("componentPath", "App > Widget")
            .origin("test-host");

        assert_eq!(event.category(), FailureCategory::RenderBoundary);
        assert_eq!(event.message(), "boom");
        assert_eq!(event.stack(), Some("at Widget"));
        assert_eq!(event.origin_str(), Some("test-host"));
        assert!(event.session().is_none());
        assert_eq!(
            event.context_map().get("componentPath"),
            Some(&serde_json::json!("App > Widget"))
        );
    }

    #[test]
    fn test_stamped_keeps_existing_values() {
        let event = FailureEvent::new(FailureCategory::RuntimeError, "x").session_id("mine");
        let stamped = event.stamped("store-session", Some("store-origin"));

        assert_eq!(stamped.session(), Some("mine"));
        assert_eq!(stamped.origin_str(), Some("store-origin"));
    }

    #[test]
    fn test_category_wire_names() {
        let json = serde_json::to_string(&FailureCategory::DiagnosticOutput).unwrap();
        assert_eq!(json, "\"diagnostic-output\"");

        for category in FailureCategory::ALL {
            let value = serde_json::to_value(category).unwrap();
            assert_eq!(value, serde_json::json!(category.as_str()));
        }
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = FailureEvent::new(FailureCategory::RejectedOperation, "timeout")
            .stack_trace("trace");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["category"], "rejected-operation");
        assert_eq!(value["stackTrace"], "trace");
        assert!(value.get("occurredAt").is_some());

        let back: FailureEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_matches_query_is_case_insensitive() {
        let event = FailureEvent::new(FailureCategory::RuntimeError, "Cannot read property 'x'")
            .stack_trace("at LoaderPanel");

        assert!(event.matches_query("cannot READ"));
        assert!(event.matches_query("loaderpanel"));
        assert!(event.matches_query("Runtime-Error"));
        assert!(!event.matches_query("network"));
    }

    #[test]
    fn test_registration_error_family() {
        assert!(Error::DuplicateRule("a".into()).is_registration_error());
        assert!(Error::InvalidRule("b".into()).is_registration_error());
        assert!(!Error::Persistence("c".into()).is_registration_error());
    }
}

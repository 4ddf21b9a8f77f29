//! # Capture Layer
//!
//! Intercepts the host's leveled diagnostic-output channel without changing
//! what the host observes, keeps a capped buffer of qualifying lines, and
//! turns error-level lines into failure events.
//!
//! The channel is modelled by [`DiagnosticChannel`]: the host writes through
//! it, and by default every call goes straight to the original
//! [`DiagnosticSink`]. While the capture layer is running it installs itself
//! as the interceptor for each enabled level.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hooks::{contained, FailureSink, HostFailure, HostFailureHooks};
use crate::matcher::Matcher;
use crate::metrics_support;
use crate::store::FailureStore;
use crate::subscription::{SubscriberSet, Subscription};
use crate::types::{Error, FailureCategory, FailureEvent, Result};

thread_local! {
    // Set while this thread is inside capture processing
    static CAPTURING: Cell<bool> = Cell::new(false);
}

/// Severity levels of the diagnostic channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl DiagnosticLevel {
    pub const ALL: [DiagnosticLevel; 4] = [
        DiagnosticLevel::Error,
        DiagnosticLevel::Warn,
        DiagnosticLevel::Info,
        DiagnosticLevel::Debug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warn => "warn",
            DiagnosticLevel::Info => "info",
            DiagnosticLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One argument of a diagnostic call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DiagnosticArg {
    Text(String),
    /// Structured value, rendered as JSON
    Value(serde_json::Value),
    /// Error-like value, rendered as its message
    Error {
        message: String,
        stack: Option<String>,
    },
}

impl DiagnosticArg {
    pub fn text<S: Into<String>>(text: S) -> Self {
        DiagnosticArg::Text(text.into())
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        DiagnosticArg::Error {
            message: message.into(),
            stack: None,
        }
    }

    pub fn error_with_stack<S: Into<String>, T: Into<String>>(message: S, stack: T) -> Self {
        DiagnosticArg::Error {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }

    /// Renders the argument the way it appears in a captured message
    pub fn render(&self) -> String {
        match self {
            DiagnosticArg::Text(text) => text.clone(),
            DiagnosticArg::Value(serde_json::Value::String(s)) => s.clone(),
            DiagnosticArg::Value(value) => value.to_string(),
            DiagnosticArg::Error { message, .. } => message.clone(),
        }
    }
}

impl From<&str> for DiagnosticArg {
    fn from(text: &str) -> Self {
        DiagnosticArg::Text(text.to_string())
    }
}

impl From<String> for DiagnosticArg {
    fn from(text: String) -> Self {
        DiagnosticArg::Text(text)
    }
}

impl From<serde_json::Value> for DiagnosticArg {
    fn from(value: serde_json::Value) -> Self {
        DiagnosticArg::Value(value)
    }
}

impl From<&Error> for DiagnosticArg {
    fn from(err: &Error) -> Self {
        DiagnosticArg::error(err.to_string())
    }
}

/// Joins rendered arguments with spaces
pub fn render_args(args: &[DiagnosticArg]) -> String {
    args.iter()
        .map(DiagnosticArg::render)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Destination of diagnostic output
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, level: DiagnosticLevel, args: &[DiagnosticArg]);
}

/// Default sink that writes diagnostic output through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, level: DiagnosticLevel, args: &[DiagnosticArg]) {
        let message = render_args(args);
        match level {
            DiagnosticLevel::Error => tracing::error!(target: "diagnostic", "{}", message),
            DiagnosticLevel::Warn => tracing::warn!(target: "diagnostic", "{}", message),
            DiagnosticLevel::Info => tracing::info!(target: "diagnostic", "{}", message),
            DiagnosticLevel::Debug => tracing::debug!(target: "diagnostic", "{}", message),
        }
    }
}

/// Receives intercepted calls together with the untouched original sink
pub trait DiagnosticInterceptor: Send + Sync {
    fn intercept(&self, level: DiagnosticLevel, args: &[DiagnosticArg], original: &dyn DiagnosticSink);
}

/// The host's leveled diagnostic-output channel
pub struct DiagnosticChannel {
    original: Arc<dyn DiagnosticSink>,
    interceptors: RwLock<HashMap<DiagnosticLevel, Arc<dyn DiagnosticInterceptor>>>,
}

impl DiagnosticChannel {
    pub fn new(original: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            original,
            interceptors: RwLock::new(HashMap::new()),
        }
    }

    /// Channel writing to [`TracingSink`]
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    pub fn log(&self, level: DiagnosticLevel, args: &[DiagnosticArg]) {
        let interceptor = self
            .interceptors
            .read()
            .ok()
            .and_then(|map| map.get(&level).cloned());

        match interceptor {
            Some(interceptor) => interceptor.intercept(level, args, self.original.as_ref()),
            None => self.original.emit(level, args),
        }
    }

    pub fn error(&self, args: &[DiagnosticArg]) {
        self.log(DiagnosticLevel::Error, args)
    }

    pub fn warn(&self, args: &[DiagnosticArg]) {
        self.log(DiagnosticLevel::Warn, args)
    }

    pub fn info(&self, args: &[DiagnosticArg]) {
        self.log(DiagnosticLevel::Info, args)
    }

    pub fn debug(&self, args: &[DiagnosticArg]) {
        self.log(DiagnosticLevel::Debug, args)
    }

    pub fn is_intercepted(&self, level: DiagnosticLevel) -> bool {
        self.interceptors
            .read()
            .map(|map| map.contains_key(&level))
            .unwrap_or(false)
    }

    /// The sink that receives calls when no interceptor is installed
    pub fn original(&self) -> &Arc<dyn DiagnosticSink> {
        &self.original
    }

    fn install(&self, level: DiagnosticLevel, interceptor: Arc<dyn DiagnosticInterceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(level, interceptor);
    }

    fn uninstall(&self, level: DiagnosticLevel) {
        self.interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&level);
    }
}

/// Configuration for the capture layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub capture_errors: bool,
    pub capture_warnings: bool,
    pub capture_info: bool,
    pub capture_debug: bool,
    /// Lines matching any of these are dropped as host/framework noise
    pub filter_patterns: Vec<Matcher>,
    pub max_captured_messages: usize,
    /// Call the original sink before capturing
    pub preserve_original: bool,
    /// Also subscribe to the host's global failure hooks
    pub capture_host_failures: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_errors: true,
            capture_warnings: true,
            capture_info: false,
            capture_debug: false,
            filter_patterns: Vec::new(),
            max_captured_messages: 100,
            preserve_original: true,
            capture_host_failures: true,
        }
    }
}

impl CaptureConfig {
    /// Whether calls at `level` are intercepted
    pub fn captures(&self, level: DiagnosticLevel) -> bool {
        match level {
            DiagnosticLevel::Error => self.capture_errors,
            DiagnosticLevel::Warn => self.capture_warnings,
            DiagnosticLevel::Info => self.capture_info,
            DiagnosticLevel::Debug => self.capture_debug,
        }
    }

    fn is_filtered(&self, message: &str) -> bool {
        self.filter_patterns.iter().any(|m| m.is_match(message))
    }
}

/// One captured diagnostic call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub level: DiagnosticLevel,
    pub message: String,
    pub raw_args: Vec<DiagnosticArg>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Counters describing capture activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub running: bool,
    pub total_captured: usize,
    pub by_level: BTreeMap<DiagnosticLevel, usize>,
    pub filtered: usize,
    pub forwarded: usize,
    pub internal_errors: usize,
    pub buffered: usize,
}

/// Callback invoked for every captured record
pub type CaptureListener = dyn Fn(&CaptureRecord) + Send + Sync;

struct CaptureInner {
    channel: Arc<DiagnosticChannel>,
    store: Arc<FailureStore>,
    config: RwLock<CaptureConfig>,
    running: AtomicBool,
    records: Mutex<VecDeque<CaptureRecord>>,
    listeners: SubscriberSet<CaptureListener>,
    stats: Mutex<CaptureStats>,
}

/// Capture layer over a diagnostic channel
pub struct CaptureLayer {
    inner: Arc<CaptureInner>,
    host_hooks: Option<Arc<dyn HostFailureHooks>>,
    /// Set only when `start` installed the host hooks
    hooks_installed: AtomicBool,
}

impl CaptureLayer {
    pub fn new(
        channel: Arc<DiagnosticChannel>,
        store: Arc<FailureStore>,
        host_hooks: Option<Arc<dyn HostFailureHooks>>,
    ) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                channel,
                store,
                config: RwLock::new(CaptureConfig::default()),
                running: AtomicBool::new(false),
                records: Mutex::new(VecDeque::new()),
                listeners: SubscriberSet::new(),
                stats: Mutex::new(CaptureStats::default()),
            }),
            host_hooks,
            hooks_installed: AtomicBool::new(false),
        }
    }

    /// Starts intercepting the enabled levels. Calling this while already
    /// running logs a warning and changes nothing.
    pub fn start(&self, config: CaptureConfig) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Capture layer already running; ignoring start");
            return;
        }

        let levels: Vec<DiagnosticLevel> = DiagnosticLevel::ALL
            .into_iter()
            .filter(|level| config.captures(*level))
            .collect();
        let hook_host = config.capture_host_failures;

        *self.inner.config.write().unwrap_or_else(|e| e.into_inner()) = config;

        let interceptor: Arc<dyn DiagnosticInterceptor> = self.inner.clone();
        for level in &levels {
            self.inner.channel.install(*level, interceptor.clone());
        }

        if hook_host {
            if let Some(hooks) = &self.host_hooks {
                let store = self.inner.store.clone();
                let sink: FailureSink = Arc::new(move |failure: HostFailure| {
                    store.report(failure.into_event());
                });
                match hooks.install(sink) {
                    Ok(()) => self.hooks_installed.store(true, Ordering::SeqCst),
                    Err(e) => warn!(error = %e, "Failed to install host failure hooks"),
                }
            }
        }

        info!(levels = ?levels, host_hooks = hook_host, "Capture layer started");
    }

    /// Restores the original sink for every level. No-op when not running.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for level in DiagnosticLevel::ALL {
            self.inner.channel.uninstall(level);
        }
        if self.hooks_installed.swap(false, Ordering::SeqCst) {
            if let Some(hooks) = &self.host_hooks {
                hooks.uninstall();
            }
        }

        info!("Capture layer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> CaptureConfig {
        self.inner.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn channel(&self) -> &Arc<DiagnosticChannel> {
        &self.inner.channel
    }

    /// Captured records, newest first
    pub fn records(&self) -> Vec<CaptureRecord> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn records_by_level(&self, level: DiagnosticLevel) -> Vec<CaptureRecord> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    pub fn clear_records(&self) {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Registers a listener for captured records
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CaptureRecord) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(Arc::new(listener))
    }

    pub fn stats(&self) -> CaptureStats {
        let mut stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner()).clone();
        stats.running = self.is_running();
        stats.buffered = self.inner.records.lock().unwrap_or_else(|e| e.into_inner()).len();
        stats
    }
}

impl Drop for CaptureLayer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DiagnosticInterceptor for CaptureInner {
    fn intercept(&self, level: DiagnosticLevel, args: &[DiagnosticArg], original: &dyn DiagnosticSink) {
        let preserve = self
            .config
            .read()
            .map(|c| c.preserve_original)
            .unwrap_or(true);
        if preserve {
            original.emit(level, args);
        }

        // Output produced while capturing (e.g. by a listener) is not
        // captured again
        if CAPTURING.with(|flag| flag.replace(true)) {
            return;
        }

        let outcome = contained(|| self.process(level, args, original));
        CAPTURING.with(|flag| flag.set(false));

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(Error::Capture("capture processing panicked".to_string())),
        };

        if let Some(e) = failure {
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).internal_errors += 1;
            original.emit(
                DiagnosticLevel::Error,
                &[DiagnosticArg::text(format!("[self-healing] {}", e))],
            );
        }
    }
}

impl CaptureInner {
    fn process(&self, level: DiagnosticLevel, args: &[DiagnosticArg], original: &dyn DiagnosticSink) -> Result<()> {
        let message = render_args(args);

        let (filtered, max_records) = {
            let config = self
                .config
                .read()
                .map_err(|_| Error::Capture("capture config lock poisoned".to_string()))?;
            (config.is_filtered(&message), config.max_captured_messages)
        };

        metrics_support::record_capture(level.as_str(), filtered);
        if filtered {
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).filtered += 1;
            return Ok(());
        }

        let error_stack = args.iter().find_map(|arg| match arg {
            DiagnosticArg::Error { stack, .. } => Some(stack.clone()),
            _ => None,
        });

        let stack_trace = match (&error_stack, level) {
            (Some(stack), _) => stack.clone(),
            // No error-like argument: synthesize one for error-level lines
            (None, DiagnosticLevel::Error) => synthesized_stack(),
            (None, _) => None,
        };

        let record = CaptureRecord {
            level,
            message: message.clone(),
            raw_args: args.to_vec(),
            timestamp: Utc::now(),
            stack_trace: stack_trace.clone(),
        };

        {
            let mut records = self
                .records
                .lock()
                .map_err(|_| Error::Capture("capture buffer lock poisoned".to_string()))?;
            records.push_front(record.clone());
            records.truncate(max_records);
        }

        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.total_captured += 1;
            *stats.by_level.entry(level).or_insert(0) += 1;
        }

        for listener in self.listeners.snapshot() {
            if contained(|| listener(&record)).is_err() {
                original.emit(
                    DiagnosticLevel::Error,
                    &[DiagnosticArg::text("[self-healing] capture listener panicked")],
                );
            }
        }

        if level == DiagnosticLevel::Error {
            let mut event = FailureEvent::new(FailureCategory::DiagnosticOutput, message)
                .context_entry("level", level.as_str())
                .context_entry("argumentCount", args.len());
            if let Some(stack) = stack_trace {
                event = event.stack_trace(stack);
            }

            self.store.report(event);
            self.stats.lock().unwrap_or_else(|e| e.into_inner()).forwarded += 1;
            debug!("Forwarded diagnostic error to failure store");
        }

        Ok(())
    }
}

fn synthesized_stack() -> Option<String> {
    let backtrace = std::backtrace::Backtrace::capture();
    match backtrace.status() {
        std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

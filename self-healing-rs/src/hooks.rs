//! Host failure hooks.
//!
//! The capture layer never touches process-global failure handling
//! directly. It depends on a [`HostFailureHooks`] capability, and each host
//! runtime supplies an adapter. [`RuntimeHooks`] is the adapter for plain
//! Rust hosts: a panic hook stands in for uncaught failures, and
//! [`RuntimeHooks::spawn_monitored`] reports asynchronous operations that
//! end in an error.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{FailureCategory, FailureEvent, Result};

thread_local! {
    // Set while a failure is being forwarded from the panic hook
    static IN_HOOK: Cell<bool> = Cell::new(false);
    // Depth of pipeline code whose panics are caught and handled locally
    static CONTAINING: Cell<usize> = Cell::new(0);
}

struct ContainGuard;

impl ContainGuard {
    fn enter() -> Self {
        CONTAINING.with(|depth| depth.set(depth.get() + 1));
        ContainGuard
    }
}

impl Drop for ContainGuard {
    fn drop(&mut self) {
        CONTAINING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn is_containing() -> bool {
    CONTAINING.with(|depth| depth.get() > 0)
}

/// Runs `f`, catching a panic. The panic hook does not forward panics
/// raised inside, since the caller handles them.
pub(crate) fn contained<F, R>(f: F) -> std::thread::Result<R>
where
    F: FnOnce() -> R,
{
    let _guard = ContainGuard::enter();
    catch_unwind(AssertUnwindSafe(f))
}

/// Future wrapper that marks every poll of the inner future as contained.
/// Pair it with `FutureExt::catch_unwind`.
pub(crate) struct Contained<F>(F);

impl<F> Contained<F> {
    pub(crate) fn new(future: F) -> Self {
        Contained(future)
    }
}

impl<F: Future + Unpin> Future for Contained<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = ContainGuard::enter();
        Pin::new(&mut self.0).poll(cx)
    }
}

/// Which global notification produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFailureKind {
    /// An uncaught failure (a panic for Rust hosts)
    Uncaught,
    /// An asynchronous operation that completed with an error
    Rejected,
}

/// A failure delivered by a host hook
#[derive(Debug, Clone, PartialEq)]
pub struct HostFailure {
    pub kind: HostFailureKind,
    pub message: String,
    pub stack: Option<String>,
    /// Source location or operation name
    pub location: Option<String>,
}

impl HostFailure {
    pub fn uncaught<S: Into<String>>(message: S) -> Self {
        Self {
            kind: HostFailureKind::Uncaught,
            message: message.into(),
            stack: None,
            location: None,
        }
    }

    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self {
            kind: HostFailureKind::Rejected,
            message: message.into(),
            stack: None,
            location: None,
        }
    }

    pub fn location<S: Into<String>>(mut self, location: S) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn stack<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Converts into a failure event of the matching category
    pub fn into_event(self) -> FailureEvent {
        let category = match self.kind {
            HostFailureKind::Uncaught => FailureCategory::RuntimeError,
            HostFailureKind::Rejected => FailureCategory::RejectedOperation,
        };

        let mut event = FailureEvent::new(category, self.message);
        if let Some(stack) = self.stack {
            event = event.stack_trace(stack);
        }
        if let Some(location) = self.location {
            event = event.context_entry("location", location);
        }
        event
    }
}

/// Receives failures from installed hooks
pub type FailureSink = Arc<dyn Fn(HostFailure) + Send + Sync>;

/// Capability for subscribing to a host's global failure notifications
pub trait HostFailureHooks: Send + Sync {
    /// Starts forwarding host failures to `sink`, replacing any previous sink
    fn install(&self, sink: FailureSink) -> Result<()>;

    /// Stops forwarding. Idempotent.
    fn uninstall(&self);
}

/// Hook adapter for Rust hosts
pub struct RuntimeHooks {
    sink: Arc<RwLock<Option<FailureSink>>>,
    use_panic_hook: bool,
    panic_hook_installed: AtomicBool,
}

impl RuntimeHooks {
    /// Adapter that also installs a process panic hook
    pub fn new() -> Self {
        Self {
            sink: Arc::new(RwLock::new(None)),
            use_panic_hook: true,
            panic_hook_installed: AtomicBool::new(false),
        }
    }

    /// Adapter that only reports monitored tasks
    pub fn without_panic_hook() -> Self {
        Self {
            use_panic_hook: false,
            ..Self::new()
        }
    }

    pub fn is_installed(&self) -> bool {
        self.sink.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Forwards a failure to the installed sink, if any
    pub fn report(&self, failure: HostFailure) {
        forward(&self.sink, failure);
    }

    /// Spawns a task and reports an `Err` result or a panic as a rejected
    /// operation. The returned handle yields `Some(value)` on success.
    pub fn spawn_monitored<F, T, E>(&self, operation: &str, future: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let sink = self.sink.clone();
        let operation = operation.to_string();
        // Panics surface through the join handle below, not the panic hook
        let task = tokio::spawn(Contained::new(Box::pin(future)));

        tokio::spawn(async move {
            match task.await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    forward(&sink, HostFailure::rejected(e.to_string()).location(operation));
                    None
                }
                Err(join_error) if join_error.is_panic() => {
                    let message = panic_message(join_error.into_panic().as_ref());
                    forward(&sink, HostFailure::rejected(message).location(operation));
                    None
                }
                Err(_) => {
                    debug!(operation = %operation, "Monitored task cancelled");
                    None
                }
            }
        })
    }

    fn install_panic_hook(&self) {
        if self.panic_hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }

        // The hook stays chained for the life of the process; once the
        // adapter is uninstalled it only calls the previous hook.
        let previous = std::panic::take_hook();
        let sink = self.sink.clone();

        std::panic::set_hook(Box::new(move |info| {
            previous(info);

            if is_containing() {
                return;
            }

            if IN_HOOK.with(|flag| flag.replace(true)) {
                return;
            }

            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
            let mut failure = HostFailure::uncaught(panic_message(info.payload()));
            if let Some(location) = location {
                failure = failure.location(location);
            }

            let backtrace = std::backtrace::Backtrace::capture();
            if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
                failure = failure.stack(backtrace.to_string());
            }

            forward(&sink, failure);
            IN_HOOK.with(|flag| flag.set(false));
        }));
    }
}

impl Default for RuntimeHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl HostFailureHooks for RuntimeHooks {
    fn install(&self, sink: FailureSink) -> Result<()> {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
        if self.use_panic_hook {
            self.install_panic_hook();
        }
        Ok(())
    }

    fn uninstall(&self) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn forward(slot: &RwLock<Option<FailureSink>>, failure: HostFailure) {
    let sink = match slot.read() {
        Ok(guard) => guard.clone(),
        Err(_) => {
            warn!("Host failure sink lock poisoned; dropping failure");
            return;
        }
    };

    if let Some(sink) = sink {
        sink(failure);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (FailureSink, Arc<Mutex<Vec<HostFailure>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (Arc::new(move |f| s.lock().unwrap().push(f)), seen)
    }

    #[test]
    fn test_into_event_categories() {
        let uncaught = HostFailure::uncaught("boom").location("src/main.rs:1:1").into_event();
        assert_eq!(uncaught.category(), FailureCategory::RuntimeError);
        assert_eq!(uncaught.context_map().get_str("location"), Some("src/main.rs:1:1"));

        let rejected = HostFailure::rejected("timed out").stack("at fetch").into_event();
        assert_eq!(rejected.category(), FailureCategory::RejectedOperation);
        assert_eq!(rejected.stack(), Some("at fetch"));
    }

    #[test]
    fn test_report_without_sink_is_dropped() {
        let hooks = RuntimeHooks::without_panic_hook();
        hooks.report(HostFailure::uncaught("nobody listening"));
        assert!(!hooks.is_installed());
    }

    #[tokio::test]
    async fn test_spawn_monitored_reports_errors() {
        let hooks = RuntimeHooks::without_panic_hook();
        let (sink, seen) = collecting_sink();
        hooks.install(sink).unwrap();

        let ok = hooks.spawn_monitored("load-user", async { Ok::<_, String>(7) });
        assert_eq!(ok.await.unwrap(), Some(7));

        let failed = hooks.spawn_monitored("load-feed", async { Err::<u8, _>("connection reset") });
        assert_eq!(failed.await.unwrap(), None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, HostFailureKind::Rejected);
        assert_eq!(seen[0].message, "connection reset");
        assert_eq!(seen[0].location.as_deref(), Some("load-feed"));
    }

    #[tokio::test]
    async fn test_uninstall_stops_forwarding() {
        let hooks = RuntimeHooks::without_panic_hook();
        let (sink, seen) = collecting_sink();
        hooks.install(sink).unwrap();
        hooks.uninstall();
        hooks.uninstall();

        let failed = hooks.spawn_monitored("op", async { Err::<(), _>("late") });
        assert_eq!(failed.await.unwrap(), None);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_contained_panics_are_not_forwarded() {
        let hooks = RuntimeHooks::new();
        let (sink, seen) = collecting_sink();
        hooks.install(sink).unwrap();

        assert!(contained(|| panic!("handled-sentinel-91ad")).is_err());
        assert_eq!(contained(|| 4).unwrap(), 4);
        assert!(!is_containing());

        let outcome = std::thread::spawn(|| panic!("loose-sentinel-91ad")).join();
        assert!(outcome.is_err());
        hooks.uninstall();

        let seen = seen.lock().unwrap();
        assert!(!seen.iter().any(|f| f.message.contains("handled-sentinel-91ad")));
        assert_eq!(seen.iter().filter(|f| f.message.contains("loose-sentinel-91ad")).count(), 1);
    }

    #[tokio::test]
    async fn test_contained_future_marks_each_poll() {
        use futures::FutureExt;

        let hooks = RuntimeHooks::new();
        let (sink, seen) = collecting_sink();
        hooks.install(sink).unwrap();

        let future: futures::future::BoxFuture<'static, ()> = Box::pin(async {
            tokio::task::yield_now().await;
            assert!(is_containing());
            panic!("async-sentinel-91ad");
        });
        let outcome = AssertUnwindSafe(Contained::new(future)).catch_unwind().await;
        assert!(outcome.is_err());
        assert!(!is_containing());
        hooks.uninstall();

        assert!(!seen.lock().unwrap().iter().any(|f| f.message.contains("async-sentinel-91ad")));
    }
}

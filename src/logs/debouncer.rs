//! Coalesces bursts of dev server output into single log events.
//!
//! Dev servers are chatty: a rebuild can print dozens of lines in a few
//! milliseconds. [`LogDebouncer`] buffers standard output lines and emits
//! them as one block once the process has been quiet for the debounce
//! window.

use crate::logs::output::{FilterDecision, FilterId, LogLine, LogSource, OutputFilter, OutputRouter};
use regex::Regex;
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Quiet period after which buffered lines are emitted
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("ANSI escape pattern is valid"));

/// Remove ANSI colour and cursor sequences from `text`
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// Receives coalesced blocks of dev server output
pub trait LogSink: Send + Sync {
    /// Emit one block of lines, joined with newlines
    fn emit(&self, block: &str);
}

/// [`LogSink`] writing to `tracing` at info level
#[derive(Debug, Clone)]
pub struct TracingSink {
    server: String,
}

impl TracingSink {
    /// Create a sink tagging events with `server`
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }
}

impl LogSink for TracingSink {
    fn emit(&self, block: &str) {
        tracing::info!(server = %self.server, "Dev server has spoken:\n{}", block);
    }
}

#[derive(Default)]
struct DebounceState {
    buffer: Vec<String>,
    pending: Option<JoinHandle<()>>,
    generation: u64,
    closed: bool,
    attachment: Option<(Arc<OutputRouter>, FilterId)>,
}

struct Inner {
    enabled: bool,
    window: Duration,
    sink: Arc<dyn LogSink>,
    runtime: Handle,
    state: Mutex<DebounceState>,
}

impl Inner {
    fn flush(&self, generation: u64) {
        let block = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            // A newer line re-armed the timer after this one was already running.
            if state.closed || state.generation != generation {
                return;
            }
            state.pending = None;
            if state.buffer.is_empty() {
                return;
            }
            state.buffer.drain(..).collect::<Vec<_>>().join("\n")
        };

        self.sink.emit(&block);
    }
}

/// Buffers standard output lines and emits them after a quiet period.
///
/// Standard error lines always pass through to the default echo. When log
/// forwarding is disabled, standard output lines are consumed and dropped so
/// the default echo stays silent as well.
///
/// Requires a tokio runtime: the debounce timer runs as a task on the runtime
/// that was current when the debouncer was created.
///
/// # Example
///
/// ```
/// use devserver_runner::logs::{LogDebouncer, LogLine, TracingSink, DEFAULT_DEBOUNCE_WINDOW};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let debouncer = LogDebouncer::new(true, DEFAULT_DEBOUNCE_WINDOW, Arc::new(TracingSink::new("vite")));
///     debouncer.accept(&LogLine::stdout("\u{1b}[32mready\u{1b}[0m in 312 ms"));
///     assert_eq!(debouncer.buffered_len(), 1);
///     debouncer.close();
/// }
/// ```
#[derive(Clone)]
pub struct LogDebouncer {
    inner: Arc<Inner>,
}

impl LogDebouncer {
    /// Create a debouncer that is not attached to any process
    pub fn new(enabled: bool, window: Duration, sink: Arc<dyn LogSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                enabled,
                window,
                sink,
                runtime: Handle::current(),
                state: Mutex::new(DebounceState::default()),
            }),
        }
    }

    /// Create a debouncer and register it on `router`
    pub fn attach(
        router: &Arc<OutputRouter>,
        enabled: bool,
        window: Duration,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let debouncer = Self::new(enabled, window, sink);
        let id = router.add_filter(Arc::new(debouncer.clone()));
        if let Ok(mut state) = debouncer.inner.state.lock() {
            state.attachment = Some((Arc::clone(router), id));
        }
        tracing::debug!(server = %router.name(), enabled, "Attached log debouncer");
        debouncer
    }

    /// Whether log forwarding is enabled
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Number of lines waiting for the timer
    pub fn buffered_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.buffer.len())
            .unwrap_or(0)
    }

    /// Whether a flush is scheduled
    pub fn has_pending_flush(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.pending.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// Feed one line
    pub fn accept(&self, line: &LogLine) -> FilterDecision {
        if line.source == LogSource::Stderr {
            return FilterDecision::Pass;
        }
        if !self.inner.enabled {
            return FilterDecision::Consume;
        }

        let text = strip_ansi(&line.text).into_owned();
        let Ok(mut state) = self.inner.state.lock() else {
            return FilterDecision::Consume;
        };
        if state.closed {
            return FilterDecision::Consume;
        }

        state.buffer.push(text);

        // Cancel and re-arm under the same lock so two racing lines cannot
        // leave an orphaned timer behind.
        if let Some(previous) = state.pending.take() {
            previous.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        let window = self.inner.window;
        state.pending = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            inner.flush(generation);
        }));

        FilterDecision::Consume
    }

    /// Cancel the pending flush, drop buffered lines and detach from the router.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        let attachment = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
            state.buffer.clear();
            state.attachment.take()
        };

        if let Some((router, id)) = attachment {
            router.remove_filter(id);
            tracing::debug!(server = %router.name(), "Detached log debouncer");
        }
    }
}

impl OutputFilter for LogDebouncer {
    fn filter(&self, line: &LogLine) -> FilterDecision {
        self.accept(line)
    }
}

impl fmt::Debug for LogDebouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogDebouncer")
            .field("enabled", &self.inner.enabled)
            .field("window", &self.inner.window)
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

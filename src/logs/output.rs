//! Line-oriented output feed of a supervised process.
//!
//! Every line read from the process goes through an ordered chain of
//! [`OutputFilter`]s. The first filter that consumes a line stops it; lines
//! nobody consumes are echoed through `tracing`, which is the default console
//! output of the dev server.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Stream a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Stdout => write!(f, "stdout"),
            LogSource::Stderr => write!(f, "stderr"),
        }
    }
}

/// A single line of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Raw text, without the trailing newline
    pub text: String,
    /// Stream the line came from
    pub source: LogSource,
    /// When the line was read
    pub arrived_at: Instant,
}

impl LogLine {
    /// Create a line stamped with the current instant
    pub fn new(text: impl Into<String>, source: LogSource) -> Self {
        Self {
            text: text.into(),
            source,
            arrived_at: Instant::now(),
        }
    }

    /// Create a standard output line
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(text, LogSource::Stdout)
    }

    /// Create a standard error line
    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(text, LogSource::Stderr)
    }

    /// Whether the line came from the error stream
    pub fn is_error(&self) -> bool {
        self.source == LogSource::Stderr
    }
}

/// What a filter did with a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Let the next filter, and eventually the default echo, see the line
    Pass,
    /// The line was handled; nothing else sees it
    Consume,
}

/// A stage in an [`OutputRouter`] chain
pub trait OutputFilter: Send + Sync {
    /// Decide what happens to `line`
    fn filter(&self, line: &LogLine) -> FilterDecision;
}

/// Identifies a filter registered on an [`OutputRouter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

type FilterEntry = (FilterId, Arc<dyn OutputFilter>);

/// Routes the output lines of one process through its filters
pub struct OutputRouter {
    /// Name used in echoed log events
    name: String,
    /// Registered filters, in registration order
    filters: Mutex<Vec<FilterEntry>>,
    /// Next filter id
    next_id: AtomicU64,
}

impl OutputRouter {
    /// Create a router with no filters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Name of the process this router belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a filter to the chain
    pub fn add_filter(&self, filter: Arc<dyn OutputFilter>) -> FilterId {
        let id = FilterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut filters) = self.filters.lock() {
            filters.push((id, filter));
        }
        id
    }

    /// Remove a filter; returns false when it was not registered
    pub fn remove_filter(&self, id: FilterId) -> bool {
        match self.filters.lock() {
            Ok(mut filters) => {
                let before = filters.len();
                filters.retain(|(filter_id, _)| *filter_id != id);
                filters.len() != before
            }
            Err(_) => false,
        }
    }

    /// Number of registered filters
    pub fn filter_count(&self) -> usize {
        self.filters.lock().map(|filters| filters.len()).unwrap_or(0)
    }

    /// Run `line` through the chain and echo it if no filter consumed it.
    ///
    /// Returns the final decision.
    pub fn dispatch(&self, line: LogLine) -> FilterDecision {
        // Filters may take their own locks, so run them on a snapshot.
        let snapshot: Vec<Arc<dyn OutputFilter>> = match self.filters.lock() {
            Ok(filters) => filters.iter().map(|(_, f)| Arc::clone(f)).collect(),
            Err(_) => Vec::new(),
        };

        for filter in snapshot {
            if filter.filter(&line) == FilterDecision::Consume {
                return FilterDecision::Consume;
            }
        }

        self.echo(&line);
        FilterDecision::Pass
    }

    fn echo(&self, line: &LogLine) {
        match line.source {
            LogSource::Stdout => {
                tracing::info!(target: "devserver_runner::output", server = %self.name, "{}", line.text)
            }
            LogSource::Stderr => {
                tracing::warn!(target: "devserver_runner::output", server = %self.name, "{}", line.text)
            }
        }
    }
}

impl fmt::Debug for OutputRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRouter")
            .field("name", &self.name)
            .field("filters", &self.filter_count())
            .finish()
    }
}

use crate::logs::output::{FilterDecision, FilterId, LogLine, OutputFilter, OutputRouter};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Lines kept while a dev server starts
pub const STARTUP_CAPTURE_LINES: usize = 500;

struct Captured {
    lines: VecDeque<LogLine>,
    dropped: usize,
}

/// Holds back process output while the dev server starts.
///
/// Start-up noise is hidden from the console; if the start fails, the
/// captured lines are dumped at error level to explain why.
pub struct StartupLogCapture {
    router: Arc<OutputRouter>,
    id: FilterId,
    captured: Arc<CaptureFilter>,
}

struct CaptureFilter {
    limit: usize,
    captured: Mutex<Captured>,
}

impl OutputFilter for CaptureFilter {
    fn filter(&self, line: &LogLine) -> FilterDecision {
        if let Ok(mut captured) = self.captured.lock() {
            if captured.lines.len() == self.limit {
                captured.lines.pop_front();
                captured.dropped += 1;
            }
            captured.lines.push_back(line.clone());
        }
        FilterDecision::Consume
    }
}

impl StartupLogCapture {
    /// Start capturing every line dispatched on `router`
    pub fn attach(router: &Arc<OutputRouter>) -> Self {
        Self::attach_with_limit(router, STARTUP_CAPTURE_LINES)
    }

    /// Start capturing, keeping at most `limit` of the most recent lines
    pub fn attach_with_limit(router: &Arc<OutputRouter>, limit: usize) -> Self {
        let captured = Arc::new(CaptureFilter {
            limit: limit.max(1),
            captured: Mutex::new(Captured {
                lines: VecDeque::new(),
                dropped: 0,
            }),
        });
        let id = router.add_filter(captured.clone());
        Self {
            router: Arc::clone(router),
            id,
            captured,
        }
    }

    /// Lines captured so far, oldest first
    pub fn lines(&self) -> Vec<LogLine> {
        self.captured
            .captured
            .lock()
            .map(|captured| captured.lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop capturing and discard what was captured
    pub fn close(self) {
        self.router.remove_filter(self.id);
    }

    /// Stop capturing and log what was captured at error level
    pub fn close_and_dump(self) {
        self.router.remove_filter(self.id);

        let Ok(captured) = self.captured.captured.lock() else {
            return;
        };
        if captured.lines.is_empty() {
            return;
        }

        let mut dump = String::new();
        if captured.dropped > 0 {
            dump.push_str(&format!("... {} earlier lines omitted\n", captured.dropped));
        }
        for line in &captured.lines {
            dump.push_str(&format!("[{}] {}\n", line.source, line.text));
        }
        tracing::error!(
            server = %self.router.name(),
            "Dev server output captured during start:\n{}",
            dump.trim_end()
        );
    }
}

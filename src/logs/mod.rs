/// Output handling for supervised dev server processes.
///
/// # Components
///
/// * `output` - The line feed of a process and its filter chain
/// * `debouncer` - Coalesces bursts of output into single log events
/// * `capture` - Holds back output while a dev server starts
pub mod capture;
pub mod debouncer;
pub mod output;

pub use capture::StartupLogCapture;
pub use debouncer::{DEFAULT_DEBOUNCE_WINDOW, LogDebouncer, LogSink, TracingSink, strip_ansi};
pub use output::{FilterDecision, FilterId, LogLine, LogSource, OutputFilter, OutputRouter};

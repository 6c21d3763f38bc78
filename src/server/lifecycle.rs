use crate::error::{Error, Result};
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

/// Events kept before the oldest are discarded
const MAX_EVENTS: usize = 1000;

/// Unique identifier for a dev server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    // Private constructor, only usable within our crate
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a [`DevServerManager`](crate::DevServerManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevServerState {
    /// No dev server
    Absent,
    /// A managed dev server is being started
    Starting,
    /// A managed dev server is running
    Running,
    /// An externally started dev server answered and is in use
    Unmanaged,
    /// The current dev server is being torn down
    Stopping,
}

impl DevServerState {
    /// Whether a dev server endpoint is available
    pub fn is_running(&self) -> bool {
        matches!(self, DevServerState::Running | DevServerState::Unmanaged)
    }
}

/// Dev server lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A managed start began
    Starting,
    /// A managed dev server became ready
    Started,
    /// An acquire reused the running dev server
    Reused,
    /// An unmanaged dev server answered and was adopted
    Adopted,
    /// A dev server was torn down
    Stopped,
    /// A start failed or a running dev server died
    Failed,
}

/// A recorded lifecycle event
#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    /// Instance the event belongs to
    pub instance: InstanceId,
    /// Event type
    pub event: LifecycleEvent,
    /// Event timestamp
    pub timestamp: Instant,
    /// Event details
    pub details: Option<String>,
}

/// Bounded history of dev server lifecycle events
pub struct LifecycleLog {
    /// Recorded events, oldest first
    events: Mutex<Vec<LifecycleRecord>>,
}

impl LifecycleLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Record an event
    pub fn record(&self, instance: InstanceId, event: LifecycleEvent, details: Option<String>) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock lifecycle events".to_string()))?;

        events.push(LifecycleRecord {
            instance,
            event,
            timestamp: Instant::now(),
            details,
        });

        // Limit event history
        if events.len() > MAX_EVENTS {
            events.remove(0);
        }

        Ok(())
    }

    /// Events of one instance, oldest first
    pub fn instance_events(&self, instance: InstanceId) -> Result<Vec<LifecycleRecord>> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock lifecycle events".to_string()))?;

        Ok(events.iter().filter(|e| e.instance == instance).cloned().collect())
    }

    /// All events, oldest first, optionally only the most recent `limit`
    pub fn events(&self, limit: Option<usize>) -> Result<Vec<LifecycleRecord>> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock lifecycle events".to_string()))?;

        let skip = limit.map_or(0, |limit| events.len().saturating_sub(limit));
        Ok(events[skip..].to_vec())
    }

    /// Clear events
    pub fn clear(&self) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock lifecycle events".to_string()))?;

        events.clear();

        Ok(())
    }
}

impl Default for LifecycleLog {
    fn default() -> Self {
        Self::new()
    }
}

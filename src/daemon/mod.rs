//! Scheduler daemon
//!
//! Runs assigner passes on a fixed interval. Passes never overlap: the
//! event loop awaits each pass before it looks at the next tick or command.

mod runner;

pub use runner::AssignerDaemon;

use crate::dep::RunSummary;
use std::time::Duration;

/// Default time between passes
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default event channel capacity
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub interval: Duration,

    pub event_channel_capacity: usize,

    /// Stop on SIGINT/SIGTERM
    pub handle_signals: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            handle_signals: true,
        }
    }
}

impl DaemonConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_signals(mut self, handle_signals: bool) -> Self {
        self.handle_signals = handle_signals;
        self
    }
}

/// Events emitted by the daemon
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Started,
    PassStarted,
    PassCompleted(RunSummary),
    PassFailed(String),
    Stopped,
}

/// Commands that can be sent to a running daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Run a pass now and restart the interval
    RunNow,
    Shutdown,
}

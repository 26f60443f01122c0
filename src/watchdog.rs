use std::time::Duration;

use serde::Serialize;
use strum_macros::Display;
use tokio::time::Instant;

/// Default time without a successful command before streaming is stopped.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_millis(4_000);

/// Default period of the inactivity check.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(1_000);

/// Logical streaming mode tracked by the watchdog.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingState {
    #[default]
    Off,
    Active {
        #[serde(skip)]
        last_success_at: Instant,
    },
}

impl StreamingState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Timestamp of the last successful command, or of streaming start.
    #[must_use]
    pub fn last_success_at(&self) -> Option<Instant> {
        match self {
            Self::Off => None,
            Self::Active { last_success_at } => Some(*last_success_at),
        }
    }
}

/// Why streaming left the active state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamingStopReason {
    /// The caller turned streaming off.
    User,
    /// The watchdog saw no successful command within the threshold.
    Inactivity,
    /// The connection went away.
    DisconnectCleanup,
}

/// Result of one periodic check.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WatchdogVerdict {
    Off,
    Healthy { idle: Duration },
    Tripped { idle: Duration },
}

/// Compares the time since the last successful command with a threshold.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreamingWatchdog {
    threshold: Duration,
}

impl StreamingWatchdog {
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Trips once the idle time strictly exceeds the threshold.
    #[must_use]
    pub fn check(&self, state: &StreamingState, now: Instant) -> WatchdogVerdict {
        let Some(last_success_at) = state.last_success_at() else {
            return WatchdogVerdict::Off;
        };

        let idle = now.saturating_duration_since(last_success_at);
        if idle > self.threshold {
            WatchdogVerdict::Tripped { idle }
        } else {
            WatchdogVerdict::Healthy { idle }
        }
    }
}

impl Default for StreamingWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY_THRESHOLD)
    }
}

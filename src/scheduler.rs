//! Instance state machine and expiry timers

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// State of a preview instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Port reserved, listener or process coming up
    Starting,
    /// Routable
    Running,
    /// Teardown in progress
    Expiring,
    /// Torn down, port released
    Reclaimed,
    /// Launch did not complete
    Failed,
}

impl InstanceState {
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Expiring)
                | (Expiring, Reclaimed)
                | (Expiring, Running)
        )
    }

    /// Move `self` from `expected` to `next`, returning whether it happened
    pub fn compare_and_transition(&mut self, expected: InstanceState, next: InstanceState) -> bool {
        if *self != expected || !expected.can_transition_to(next) {
            return false;
        }
        *self = next;
        true
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Expiring => "expiring",
            InstanceState::Reclaimed => "reclaimed",
            InstanceState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted when an instance's TTL elapses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEvent {
    pub app_id: String,
    pub generation: u64,
}

/// Cancellable handle to an armed expiry timer
#[derive(Debug)]
pub struct ExpiryTimer {
    abort: AbortHandle,
}

impl ExpiryTimer {
    pub fn cancel(self) {
        self.abort.abort();
    }
}

/// Arms expiry timers that report into a single channel
#[derive(Clone)]
pub struct LifecycleScheduler {
    events: mpsc::UnboundedSender<ExpiryEvent>,
}

impl LifecycleScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExpiryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    /// Arm a timer for `app_id` firing at `expires_at`
    ///
    /// A deadline in the past fires immediately.
    pub fn arm(&self, app_id: &str, generation: u64, expires_at: DateTime<Utc>) -> ExpiryTimer {
        let delay = delay_until(expires_at, Utc::now());
        let events = self.events.clone();
        let event = ExpiryEvent {
            app_id: app_id.to_string(),
            generation,
        };

        debug!(app_id, generation, delay_ms = delay.as_millis() as u64, "Armed expiry timer");

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(app_id = %event.app_id, generation = event.generation, "Expiry timer fired");
            // Receiver only goes away at shutdown
            let _ = events.send(event);
        });

        ExpiryTimer {
            abort: task.abort_handle(),
        }
    }
}

/// Time from `now` until `deadline`, clamped at zero
pub fn delay_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/*!
 * Utility functions and helpers for LabKit.
 */
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How a background task ended when it was joined with a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The task finished before the deadline
    Finished,
    /// The task panicked or was aborted
    Failed,
    /// The deadline passed; the task is still running and has been detached
    TimedOut,
}

/// Wait for a spawned task to exit, giving up after `deadline`.
///
/// A task that misses the deadline is left running (detached) and logged.
pub async fn join_with_timeout(name: &str, handle: JoinHandle<()>, deadline: Duration) -> JoinOutcome {
    match timeout(deadline, handle).await {
        Ok(Ok(())) => {
            debug!("Task '{}' exited", name);
            JoinOutcome::Finished
        }
        Ok(Err(e)) => {
            warn!("Task '{}' failed: {}", name, e);
            JoinOutcome::Failed
        }
        Err(_) => {
            warn!("Task '{}' did not exit within {:?}; detaching it", name, deadline);
            JoinOutcome::TimedOut
        }
    }
}

/// Convert a rate in hertz into a polling period, never shorter than `min`.
///
/// Non-positive or non-finite rates yield `None`.
pub fn period_from_rate(rate_hz: f64, min: Duration) -> Option<Duration> {
    if !rate_hz.is_finite() || rate_hz <= 0.0 {
        return None;
    }
    let period = Duration::try_from_secs_f64(1.0 / rate_hz).ok()?;
    Some(period.max(min))
}

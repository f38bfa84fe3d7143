/*!
 * Connection state machine.
 *
 * Every equipment instance embeds one [`StateMachine`]. It owns the current
 * [`EquipmentStatus`] and refuses any transition that is not an edge of the
 * lifecycle graph:
 *
 * ```text
 * Disconnected -> Connecting -> Ready <-> Busy
 *                     |          |  \
 *                     v          v   Measuring -> Ready
 *                   Error <------+------'
 *                     |
 *                     '-> Connecting            (any) -> Disconnected
 * ```
 */
use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Lifecycle status of an equipment instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentStatus {
    /// No transport session is open
    Disconnected,
    /// A session is being opened and the device identified
    Connecting,
    /// Connected and idle
    Ready,
    /// A continuous measurement worker is running
    Measuring,
    /// A synchronous operation (reset, apply, self-test) is in flight
    Busy,
    /// A transport-level failure occurred; needs an explicit `connect()`
    Error,
}

impl EquipmentStatus {
    /// The lowercase name used in status reports and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentStatus::Disconnected => "disconnected",
            EquipmentStatus::Connecting => "connecting",
            EquipmentStatus::Ready => "ready",
            EquipmentStatus::Measuring => "measuring",
            EquipmentStatus::Busy => "busy",
            EquipmentStatus::Error => "error",
        }
    }

    /// Whether a session is open and usable in this status
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            EquipmentStatus::Ready | EquipmentStatus::Measuring | EquipmentStatus::Busy
        )
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: EquipmentStatus) -> bool {
        use EquipmentStatus::*;

        if next == Disconnected {
            return true;
        }

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Ready)
                | (Connecting, Error)
                | (Ready, Busy)
                | (Ready, Measuring)
                | (Ready, Error)
                | (Busy, Ready)
                | (Busy, Error)
                | (Measuring, Ready)
                | (Measuring, Error)
                | (Error, Connecting)
        )
    }
}

impl fmt::Display for EquipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected status change
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal status transition {from} -> {to}")]
pub struct IllegalTransition {
    /// Status before the attempted change
    pub from: EquipmentStatus,
    /// Requested status
    pub to: EquipmentStatus,
}

/// A recorded status change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusTransition {
    /// Previous status
    pub from: EquipmentStatus,
    /// New status
    pub to: EquipmentStatus,
    /// When the change happened
    pub at: DateTime<Utc>,
}

const DEFAULT_HISTORY: usize = 64;

/// Tracks and validates the lifecycle status of one equipment instance
#[derive(Debug, Clone)]
pub struct StateMachine {
    status: EquipmentStatus,
    history: VecDeque<StatusTransition>,
    history_capacity: usize,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine in `Disconnected`
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY)
    }

    /// Create a state machine that keeps at most `capacity` transitions
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            status: EquipmentStatus::Disconnected,
            history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY)),
            history_capacity: capacity,
        }
    }

    /// The current status
    pub fn status(&self) -> EquipmentStatus {
        self.status
    }

    /// Move to `next`, returning the previous status.
    ///
    /// Re-entering the current status is accepted and not recorded.
    pub fn transition(&mut self, next: EquipmentStatus) -> Result<EquipmentStatus, IllegalTransition> {
        let previous = self.status;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            return Err(IllegalTransition { from: previous, to: next });
        }

        self.status = next;
        debug!("Status {} -> {}", previous, next);

        if self.history_capacity > 0 {
            if self.history.len() == self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(StatusTransition {
                from: previous,
                to: next,
                at: Utc::now(),
            });
        }

        Ok(previous)
    }

    /// Recorded transitions, oldest first
    pub fn history(&self) -> Vec<StatusTransition> {
        self.history.iter().cloned().collect()
    }
}

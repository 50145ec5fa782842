use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::utils::current_timestamp;

/// Status label reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runtime state of one instance. Process details only exist in the variants
/// where a process can exist, so a pid on a `Stopped` instance is
/// unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    Starting {
        since: u64,
    },
    Running {
        pid: u32,
        started_at: u64,
    },
    Stopping {
        pid: u32,
        started_at: u64,
    },
    /// Kept until the next start so the last pid and uptime stay visible.
    Error {
        last_pid: Option<u32>,
        started_at: Option<u64>,
        failed_at: u64,
        reason: String,
    },
}

impl RuntimeState {
    pub fn status(&self) -> ServerStatus {
        match self {
            Self::Stopped => ServerStatus::Stopped,
            Self::Starting { .. } => ServerStatus::Starting,
            Self::Running { .. } => ServerStatus::Running,
            Self::Stopping { .. } => ServerStatus::Stopping,
            Self::Error { .. } => ServerStatus::Error,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid, .. } | Self::Stopping { pid, .. } => Some(*pid),
            Self::Error { last_pid, .. } => *last_pid,
            Self::Stopped | Self::Starting { .. } => None,
        }
    }

    /// Seconds since the process started. Frozen at the failure time for `Error`.
    pub fn uptime(&self, now: u64) -> Option<u64> {
        match self {
            Self::Running { started_at, .. } | Self::Stopping { started_at, .. } => {
                Some(now.saturating_sub(*started_at))
            }
            Self::Error {
                started_at: Some(started_at),
                failed_at,
                ..
            } => Some(failed_at.saturating_sub(*started_at)),
            _ => None,
        }
    }

    /// No process is alive in this state.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error { .. })
    }

    pub fn error(last_pid: Option<u32>, started_at: Option<u64>, reason: impl Into<String>) -> Self {
        Self::Error {
            last_pid,
            started_at,
            failed_at: current_timestamp(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0} -> {1}")]
    InvalidTransition(ServerStatus, ServerStatus),
}

pub fn can_transition(from: ServerStatus, to: ServerStatus) -> bool {
    use ServerStatus::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Error, Starting)
            | (Starting, Running)
            | (Starting, Stopping)
            | (Starting, Stopped)
            | (Starting, Error)
            | (Running, Stopping)
            | (Running, Stopped)
            | (Running, Error)
            | (Stopping, Stopped)
    )
}

/// Validates transitions before applying them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    pub state: RuntimeState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: RuntimeState::Stopped,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ServerStatus {
        self.state.status()
    }

    pub fn transition(&mut self, to: RuntimeState) -> Result<(), TransitionError> {
        let from = self.state.status();
        if can_transition(from, to.status()) {
            tracing::debug!("State transition: {} -> {}", from, to.status());
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(from, to.status()))
        }
    }
}

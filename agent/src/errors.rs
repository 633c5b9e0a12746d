//! Typed error taxonomy for the assessment loop.
//!
//! Most plumbing returns `anyhow::Result`; these variants are the ones callers
//! branch on (via `downcast_ref`) to pick a stop state or exit code.
//! Command-level failures (`CommandBlocked`, `CommandTimeout`, `CommandFailed`,
//! `ElevationFailure`) are normally carried as data inside records and only
//! materialize as errors when rendered for the planner or the operator.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::ExecStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("planner returned an unusable response: {0}")]
    PlannerProtocol(String),

    #[error("planner unreachable: {0}")]
    PlannerTransport(String),

    #[error("command blocked: {0}")]
    CommandBlocked(String),

    #[error("command timed out after {}s", .0.as_secs())]
    CommandTimeout(Duration),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("elevation failed: {0}")]
    ElevationFailure(String),

    #[error("session {step} failed: {reason}")]
    SessionTransaction { step: &'static str, reason: String },

    #[error("workspace busy: {0}")]
    WorkspaceBusy(String),
}

impl AgentError {
    /// Wrap any error raised midway through a session transaction.
    pub fn session(step: &'static str, err: &anyhow::Error) -> Self {
        AgentError::SessionTransaction {
            step,
            reason: format!("{err:#}"),
        }
    }

    /// Map a non-successful execution status onto the taxonomy.
    pub fn from_status(status: &ExecStatus, timeout: Duration) -> Option<Self> {
        match status {
            ExecStatus::Exited { code: 0 } => None,
            ExecStatus::Exited { code } => {
                Some(AgentError::CommandFailed(format!("exit code {code}")))
            }
            ExecStatus::TimedOut => Some(AgentError::CommandTimeout(timeout)),
            ExecStatus::Killed { .. } | ExecStatus::SpawnFailed { .. } => {
                Some(AgentError::CommandFailed(status.describe()))
            }
            ExecStatus::ElevationFailed { reason } => {
                Some(AgentError::ElevationFailure(reason.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_distinguishes_elevation_failures() {
        let timeout = Duration::from_secs(5);
        assert_eq!(
            AgentError::from_status(&ExecStatus::Exited { code: 0 }, timeout),
            None
        );
        assert_eq!(
            AgentError::from_status(&ExecStatus::TimedOut, timeout),
            Some(AgentError::CommandTimeout(timeout))
        );
        assert!(matches!(
            AgentError::from_status(
                &ExecStatus::ElevationFailed {
                    reason: "bad password".to_string()
                },
                timeout
            ),
            Some(AgentError::ElevationFailure(_))
        ));
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = AgentError::CommandTimeout(Duration::from_secs(120));
        assert_eq!(err.to_string(), "command timed out after 120s");
    }
}

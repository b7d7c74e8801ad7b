use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::gateway::SchedulerState;

/// Lifecycle of a tracked job.
///
/// `Created → Submitted → Pending → Running → {Completed, Failed, Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobStatus {
    Created,
    Submitted,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Submitted => 1,
            JobStatus::Pending => 2,
            JobStatus::Running => 3,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true if the job can still be cancelled.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Pending | JobStatus::Running
        )
    }

    /// The job has been given an allocation (or ended).
    pub fn has_started(self) -> bool {
        self.rank() >= JobStatus::Running.rank()
    }

    /// Returns the status after observing `observed`.
    /// Transitions never go backwards and terminal states are final.
    pub fn advance(self, observed: JobStatus) -> JobStatus {
        if self.is_terminal() || observed.rank() <= self.rank() {
            self
        } else {
            observed
        }
    }

    /// Lifecycle status of a scheduler state, `None` when the state carries no information.
    pub fn from_scheduler(state: &SchedulerState) -> Option<JobStatus> {
        let status = match state {
            SchedulerState::Pending
            | SchedulerState::Configuring
            | SchedulerState::Requeued
            | SchedulerState::Suspended => JobStatus::Pending,
            SchedulerState::Running | SchedulerState::Completing => JobStatus::Running,
            SchedulerState::Completed => JobStatus::Completed,
            SchedulerState::Failed
            | SchedulerState::Timeout
            | SchedulerState::NodeFail
            | SchedulerState::OutOfMemory
            | SchedulerState::BootFail
            | SchedulerState::Deadline
            | SchedulerState::Preempted => JobStatus::Failed,
            SchedulerState::Cancelled => JobStatus::Cancelled,
            SchedulerState::Other(_) | SchedulerState::Unknown => return None,
        };
        Some(status)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Created => "CREATED",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        })
    }
}

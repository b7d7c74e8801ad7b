use std::time::Duration;

use serde::Deserialize;

use crate::JobId;
use crate::common::config::deserialize_human_duration;
use crate::common::error::HpcError;
use crate::common::utils::str::pluralize;
use crate::tracker::{InstanceTracker, JobRecord};

/// Bounded polling for a node assignment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitPolicy {
    /// Delay between two polls.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 6,
        }
    }
}

impl WaitPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound of the time spent sleeping by [`wait_for_node`].
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Polls the job until the scheduler reports its node.
///
/// Fails with `PollTimeoutError` after `max_attempts` polls and with `JobTerminated` when the job
/// ends before it got a node. The record itself is never modified by the failure.
pub async fn wait_for_node(
    tracker: &mut InstanceTracker<'_>,
    job_id: &JobId,
    stage: &str,
    policy: &WaitPolicy,
) -> crate::Result<JobRecord> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let record = tracker.status(job_id).await?;
        if record.node.is_some() {
            log::debug!(
                "Job {job_id} of stage `{stage}` got a node after {attempt} {}",
                pluralize("attempt", attempt as usize)
            );
            return Ok(record);
        }
        if record.status.is_terminal() {
            return Err(HpcError::JobTerminated {
                stage: stage.to_string(),
                job_id: job_id.to_string(),
                status: record.status,
            });
        }
        log::info!(
            "Waiting for a node of stage `{stage}` (job {job_id}, {}), attempt {attempt}/{attempts}",
            record.status
        );
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(HpcError::PollTimeoutError {
        stage: stage.to_string(),
        job_id: job_id.to_string(),
        attempts,
    })
}

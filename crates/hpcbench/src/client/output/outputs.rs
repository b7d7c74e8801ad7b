use crate::JobId;
use crate::gateway::{ListedJob, PollResult};
use crate::job::JobCategory;
use crate::script::BatchScript;
use crate::session::SessionRecord;
use crate::tracker::JobRecord;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Outputs {
    #[value(name = "cli")]
    Cli,
    #[value(name = "json")]
    Json,
}

/// Scheduler state of a job that is not tracked by this process.
pub struct SchedulerJobStatus {
    pub scheduler_id: String,
    /// Scheduler job name, known for listed jobs.
    pub name: Option<String>,
    /// Set for jobs submitted by hpcbench.
    pub job_id: Option<JobId>,
    pub result: PollResult,
}

impl SchedulerJobStatus {
    pub fn polled(scheduler_id: String, result: PollResult) -> Self {
        Self {
            scheduler_id,
            name: None,
            job_id: None,
            result,
        }
    }
}

impl From<ListedJob> for SchedulerJobStatus {
    fn from(job: ListedJob) -> Self {
        Self {
            job_id: job.job_id(),
            scheduler_id: job.scheduler_id,
            name: Some(job.name),
            result: job.result,
        }
    }
}

pub trait Output {
    // Sessions
    fn print_session(&self, session: &SessionRecord, jobs: &[JobRecord]);
    fn print_session_aborted(&self, session: &SessionRecord, jobs: &[JobRecord]);

    // Scheduler jobs
    fn print_scheduler_status(&self, jobs: &[SchedulerJobStatus]);
    fn print_cancel_result(&self, results: &[(String, bool)]);

    // Dry run
    fn print_scripts(&self, scripts: &[(String, BatchScript)]);

    fn print_job_types(&self, types: &[(&str, JobCategory)]);

    fn print_error(&self, error: anyhow::Error);
}

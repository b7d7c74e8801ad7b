//! Lifecycle tracking of submitted jobs.

pub mod state;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::error::HpcError;
use crate::common::idcounter::IdCounter;
use crate::common::utils::time::now_monotonic;
use crate::gateway::retry::RetryPolicy;
use crate::gateway::{JobGateway, PollResult};
use crate::job::{JobCategory, JobModel, JobSpec, ServiceEndpoint};
use crate::registry::JobRegistry;
use crate::script;
use crate::{JobId, Map};

pub use state::JobStatus;

/// Snapshot of a tracked job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub name: String,
    pub category: JobCategory,
    /// Assigned by the scheduler at submission, never changes afterwards.
    pub scheduler_id: Option<String>,
    pub status: JobStatus,
    /// First host of the allocation, known once the job runs.
    pub node: Option<String>,
    pub elapsed: Option<Duration>,
    /// First exposed port, services only.
    pub primary_port: Option<u16>,
    pub sidecar_port: Option<u16>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn new(job_id: JobId, model: &JobModel) -> Self {
        Self {
            job_id,
            name: model.spec().name().to_string(),
            category: model.category(),
            scheduler_id: None,
            status: JobStatus::Created,
            node: None,
            elapsed: None,
            primary_port: model.primary_port(),
            sidecar_port: model.spec().sidecar().map(|sidecar| sidecar.port),
            submitted_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Endpoint of `port` on the assigned node.
    pub fn endpoint(&self, port: u16) -> Option<ServiceEndpoint> {
        self.node
            .as_ref()
            .map(|node| ServiceEndpoint::new(node.clone(), port))
    }

    fn set_status(&mut self, status: JobStatus) -> bool {
        let new_status = self.status.advance(status);
        if new_status == self.status {
            return false;
        }
        log::debug!(
            "Job {} ({}) changed state {} -> {new_status}",
            self.job_id,
            self.name,
            self.status
        );
        let now = Utc::now();
        if new_status == JobStatus::Running {
            self.started_at.get_or_insert(now);
        }
        if new_status.is_terminal() {
            self.completed_at.get_or_insert(now);
        }
        self.status = new_status;
        true
    }

    fn apply_poll(&mut self, result: PollResult) {
        match JobStatus::from_scheduler(&result.state) {
            Some(status) => {
                self.set_status(status);
            }
            None => log::debug!(
                "Scheduler reported state `{}` for job {}, keeping {}",
                result.state,
                self.job_id,
                self.status
            ),
        }
        if self.node.is_none() && self.status.has_started() {
            if let Some(node) = result.node.filter(|node| !node.is_empty()) {
                log::info!("Job {} ({}) runs on {node}", self.job_id, self.name);
                self.node = Some(node);
            }
        }
        if result.elapsed.is_some() {
            self.elapsed = result.elapsed;
        }
    }
}

struct TrackedJob {
    record: JobRecord,
    order: u32,
    terminal_since: Option<Instant>,
}

impl TrackedJob {
    fn mark_terminal(&mut self) {
        if self.record.status.is_terminal() && self.terminal_since.is_none() {
            self.terminal_since = Some(now_monotonic());
        }
    }
}

/// Tracks the jobs of one category and drives them through the gateway.
pub struct InstanceTracker<'a> {
    registry: &'a JobRegistry,
    gateway: &'a dyn JobGateway,
    category: JobCategory,
    retention: Duration,
    /// Applied to polls only, submission and cancellation are never repeated.
    poll_retry: RetryPolicy,
    jobs: Map<JobId, TrackedJob>,
    submission_counter: IdCounter,
}

impl<'a> InstanceTracker<'a> {
    pub fn new(
        registry: &'a JobRegistry,
        gateway: &'a dyn JobGateway,
        category: JobCategory,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            gateway,
            category,
            retention,
            poll_retry: RetryPolicy::default(),
            jobs: Default::default(),
            submission_counter: IdCounter::new(0),
        }
    }

    pub fn with_poll_retry(mut self, policy: RetryPolicy) -> Self {
        self.poll_retry = policy;
        self
    }

    pub fn category(&self) -> JobCategory {
        self.category
    }

    /// Builds and submits the job, returns as soon as the scheduler accepted it.
    pub async fn start(&mut self, spec: JobSpec) -> crate::Result<JobId> {
        let tag = spec.tag().to_string();
        let name = spec.name().to_string();
        if let Some(category) = self.registry.category(&tag) {
            if category != self.category {
                return Err(HpcError::configuration(
                    &name,
                    format!(
                        "`{tag}` is a {category} job and cannot be started as a {} job",
                        self.category
                    ),
                ));
            }
        }
        let model = self.registry.create(&tag, spec)?;

        let job_id = JobId::generate();
        let mut record = JobRecord::new(job_id.clone(), &model);
        let batch_script = script::generate(&model, &job_id);
        log::debug!("Batch script of job {job_id}:\n{}", batch_script.render());

        let scheduler_id = self.gateway.submit(&batch_script).await?;
        log::info!("Job {job_id} ({name}) submitted as scheduler job {scheduler_id}");
        record.scheduler_id = Some(scheduler_id);
        record.submitted_at = Some(Utc::now());
        record.set_status(JobStatus::Submitted);

        self.jobs.insert(
            job_id.clone(),
            TrackedJob {
                record,
                order: self.submission_counter.increment(),
                terminal_since: None,
            },
        );
        Ok(job_id)
    }

    /// Asks the scheduler to cancel the job.
    ///
    /// Returns `false` without any remote call when the job is not active, and also when the
    /// scheduler reports that the job has already finished. The state of such a job is updated
    /// by the next [`InstanceTracker::status`] call.
    pub async fn stop(&mut self, job_id: &JobId) -> crate::Result<bool> {
        let job = self.job_mut(job_id)?;
        if !job.record.status.is_active() {
            log::debug!(
                "Job {job_id} is {}, nothing to cancel",
                job.record.status
            );
            return Ok(false);
        }
        let Some(scheduler_id) = job.record.scheduler_id.clone() else {
            return Ok(false);
        };
        let cancelled = self.gateway.cancel(&scheduler_id).await?;
        if cancelled {
            let job = self.job_mut(job_id)?;
            job.record.set_status(JobStatus::Cancelled);
            job.mark_terminal();
            log::info!("Job {job_id} (scheduler job {scheduler_id}) was cancelled");
        }
        Ok(cancelled)
    }

    /// Polls the scheduler and returns the updated record.
    ///
    /// Connection failures are retried with the poll retry policy.
    pub async fn status(&mut self, job_id: &JobId) -> crate::Result<JobRecord> {
        let job = self.job_mut(job_id)?;
        let scheduler_id = job
            .record
            .scheduler_id
            .clone()
            .filter(|_| !job.record.status.is_terminal());
        if let Some(scheduler_id) = scheduler_id {
            let gateway = self.gateway;
            let remote_id = scheduler_id.as_str();
            let result = self
                .poll_retry
                .run(&format!("Polling scheduler job {remote_id}"), |_| {
                    gateway.poll(remote_id)
                })
                .await?;
            let job = self.job_mut(job_id)?;
            job.record.apply_poll(result);
            job.mark_terminal();
        }
        let record = self.record(job_id)?.clone();
        self.evict_expired(job_id);
        Ok(record)
    }

    /// Tracked records in submission order, terminal ones included until they are evicted.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<&TrackedJob> = self.jobs.values().collect();
        jobs.sort_by_key(|job| job.order);
        jobs.into_iter().map(|job| job.record.clone()).collect()
    }

    pub fn record(&self, job_id: &JobId) -> crate::Result<&JobRecord> {
        self.jobs
            .get(job_id)
            .map(|job| &job.record)
            .ok_or_else(|| HpcError::UnknownJob(job_id.to_string()))
    }

    /// Endpoint of `port` on the node of the job, `None` until a node is assigned.
    pub fn endpoint(&self, job_id: &JobId, port: u16) -> crate::Result<Option<ServiceEndpoint>> {
        Ok(self.record(job_id)?.endpoint(port))
    }

    fn job_mut(&mut self, job_id: &JobId) -> crate::Result<&mut TrackedJob> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| HpcError::UnknownJob(job_id.to_string()))
    }

    fn evict_expired(&mut self, current: &JobId) {
        let now = now_monotonic();
        let retention = self.retention;
        self.jobs.retain(|job_id, job| {
            let expired = job_id != current
                && job
                    .terminal_since
                    .is_some_and(|since| now.saturating_duration_since(since) > retention);
            if expired {
                log::debug!("Evicting record of job {job_id} ({})", job.record.status);
            }
            !expired
        });
    }
}

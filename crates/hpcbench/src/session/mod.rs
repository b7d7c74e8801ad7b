//! Sequencing of dependent jobs.
//!
//! A dependent stage often needs to know where an earlier job runs (e.g. a benchmark client needs
//! the node of its service). The coordinator starts the stages of a [`Pipeline`] in order and
//! waits for node assignments whenever a stage needs one.

pub mod pipeline;
pub mod wait;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::JobId;
use crate::common::error::HpcError;
use crate::gateway::JobGateway;
use crate::gateway::retry::RetryPolicy;
use crate::job::{JobCategory, ServiceEndpoint};
use crate::registry::JobRegistry;
use crate::tracker::{InstanceTracker, JobRecord};

pub use pipeline::{EndpointKind, Injection, Need, Pipeline, Stage};
pub use wait::{WaitPolicy, wait_for_node};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedStage {
    pub stage: String,
    pub category: JobCategory,
    pub job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyEdge {
    pub dependency: String,
    pub dependent: String,
    pub endpoint: EndpointKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InjectedEndpoint {
    pub stage: String,
    pub dependency: String,
    pub endpoint: ServiceEndpoint,
    pub inject: Injection,
}

/// Outcome of one coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionRecord {
    /// Stages in the order in which they were started.
    pub stages: Vec<StartedStage>,
    pub edges: Vec<DependencyEdge>,
    pub injected: Vec<InjectedEndpoint>,
}

impl SessionRecord {
    pub fn job_id(&self, stage: &str) -> Option<&JobId> {
        self.stages
            .iter()
            .find(|started| started.stage == stage)
            .map(|started| &started.job_id)
    }

    fn started(&self, stage: &str) -> Option<&StartedStage> {
        self.stages.iter().find(|started| started.stage == stage)
    }
}

/// A run that failed part-way.
///
/// Jobs of the stages in `record` were already submitted and keep running.
#[derive(Debug, Error)]
#[error("Session aborted with {started} started stage(s): {error}", started = .record.stages.len())]
pub struct SessionAborted {
    pub record: SessionRecord,
    #[source]
    pub error: HpcError,
}

/// Result of cancelling one job of a session.
#[derive(Debug)]
pub struct StopOutcome {
    pub stage: String,
    pub job_id: JobId,
    /// `Ok(false)` when the job was not running anymore.
    pub result: crate::Result<bool>,
}

pub struct SessionCoordinator<'a> {
    services: InstanceTracker<'a>,
    clients: InstanceTracker<'a>,
    default_wait: WaitPolicy,
}

impl<'a> SessionCoordinator<'a> {
    pub fn new(
        registry: &'a JobRegistry,
        gateway: &'a dyn JobGateway,
        retention: Duration,
        default_wait: WaitPolicy,
    ) -> Self {
        Self {
            services: InstanceTracker::new(registry, gateway, JobCategory::Service, retention),
            clients: InstanceTracker::new(registry, gateway, JobCategory::Client, retention),
            default_wait,
        }
    }

    /// Retry policy of scheduler polls in both trackers.
    pub fn with_poll_retry(self, policy: RetryPolicy) -> Self {
        Self {
            services: self.services.with_poll_retry(policy.clone()),
            clients: self.clients.with_poll_retry(policy),
            default_wait: self.default_wait,
        }
    }

    pub fn tracker(&self, category: JobCategory) -> &InstanceTracker<'a> {
        match category {
            JobCategory::Service => &self.services,
            JobCategory::Client => &self.clients,
        }
    }

    pub fn tracker_mut(&mut self, category: JobCategory) -> &mut InstanceTracker<'a> {
        match category {
            JobCategory::Service => &mut self.services,
            JobCategory::Client => &mut self.clients,
        }
    }

    /// Starts all stages of the pipeline in order.
    ///
    /// On failure the remaining stages are skipped, jobs that were already started are left
    /// running and are listed in [`SessionAborted::record`].
    pub async fn run(&mut self, pipeline: &Pipeline) -> Result<SessionRecord, SessionAborted> {
        let mut record = SessionRecord::default();
        if let Err(error) = pipeline.validate() {
            return Err(SessionAborted { record, error });
        }
        for stage in pipeline.stages() {
            if let Err(error) = self.run_stage(pipeline, stage, &mut record).await {
                log::error!("Stage `{}` failed: {error}", stage.name);
                return Err(SessionAborted { record, error });
            }
        }
        log::info!("Session started {} stages", record.stages.len());
        Ok(record)
    }

    async fn run_stage(
        &mut self,
        pipeline: &Pipeline,
        stage: &Stage,
        record: &mut SessionRecord,
    ) -> crate::Result<()> {
        let mut spec = stage.spec.clone();
        for need in &stage.needs {
            let endpoint = self.resolve(pipeline, need, record).await?;
            log::info!(
                "Stage `{}` uses {} endpoint {endpoint} of stage `{}`",
                stage.name,
                need.endpoint,
                need.stage
            );
            spec = need.inject.apply(spec, &endpoint);
            record.injected.push(InjectedEndpoint {
                stage: stage.name.clone(),
                dependency: need.stage.clone(),
                endpoint,
                inject: need.inject.clone(),
            });
        }

        let job_id = self.tracker_mut(stage.category).start(spec).await?;
        record.stages.push(StartedStage {
            stage: stage.name.clone(),
            category: stage.category,
            job_id: job_id.clone(),
        });
        record
            .edges
            .extend(stage.needs.iter().map(|need| DependencyEdge {
                dependency: need.stage.clone(),
                dependent: stage.name.clone(),
                endpoint: need.endpoint,
            }));

        if let Some(policy) = &stage.wait {
            wait_for_node(self.tracker_mut(stage.category), &job_id, &stage.name, policy).await?;
        }
        Ok(())
    }

    /// Endpoint of a dependency, waits for its node when it is not known yet.
    async fn resolve(
        &mut self,
        pipeline: &Pipeline,
        need: &Need,
        record: &SessionRecord,
    ) -> crate::Result<ServiceEndpoint> {
        let Some(started) = record.started(&need.stage) else {
            return Err(HpcError::configuration(
                &need.stage,
                "stage was not started",
            ));
        };
        let tracker = self.tracker(started.category);
        let mut dependency = tracker.record(&started.job_id)?.clone();
        if dependency.node.is_none() {
            let policy = pipeline
                .stage(&need.stage)
                .and_then(|stage| stage.wait.clone())
                .unwrap_or_else(|| self.default_wait.clone());
            dependency = wait_for_node(
                self.tracker_mut(started.category),
                &started.job_id,
                &need.stage,
                &policy,
            )
            .await?;
        }
        need.endpoint.resolve(&dependency).ok_or_else(|| {
            HpcError::configuration(
                &need.stage,
                format!("job {} has no {} endpoint", started.job_id, need.endpoint),
            )
        })
    }

    /// Refreshes the records of all jobs of a session.
    pub async fn refresh(&mut self, record: &SessionRecord) -> crate::Result<Vec<JobRecord>> {
        let mut records = Vec::with_capacity(record.stages.len());
        for started in &record.stages {
            records.push(
                self.tracker_mut(started.category)
                    .status(&started.job_id)
                    .await?,
            );
        }
        Ok(records)
    }

    /// Cancels the jobs of a session in reverse start order, so clients stop before their
    /// services. A failed cancellation does not prevent the others.
    pub async fn stop(&mut self, record: &SessionRecord) -> Vec<StopOutcome> {
        let mut outcomes = Vec::with_capacity(record.stages.len());
        for started in record.stages.iter().rev() {
            let result = self
                .tracker_mut(started.category)
                .stop(&started.job_id)
                .await;
            if let Err(error) = &result {
                log::warn!(
                    "Cannot stop job {} of stage `{}`: {error}",
                    started.job_id,
                    started.stage
                );
            }
            outcomes.push(StopOutcome {
                stage: started.stage.clone(),
                job_id: started.job_id.clone(),
                result,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{EndpointKind, Injection, Pipeline, SessionCoordinator, Stage, WaitPolicy};
    use crate::Error;
    use crate::gateway::SchedulerState;
    use crate::job::{JobCategory, JobSpec, ServiceEndpoint, SidecarSpec};
    use crate::registry::JobRegistry;
    use crate::tracker::JobStatus;
    use crate::tracker::tests::{PollBuilder, ScriptedGateway, running_on};

    fn coordinator<'a>(
        registry: &'a JobRegistry,
        gateway: &'a ScriptedGateway,
    ) -> SessionCoordinator<'a> {
        SessionCoordinator::new(
            registry,
            gateway,
            Duration::from_secs(600),
            WaitPolicy::new(Duration::from_secs(5), 6),
        )
    }

    fn service() -> JobSpec {
        JobSpec::new("llm", "ollama", "ollama.sif").with_sidecar(SidecarSpec::default())
    }

    fn monitor() -> JobSpec {
        JobSpec::new("prom", "prometheus", "prometheus.sif")
    }

    fn client() -> JobSpec {
        JobSpec::new("bench", "ollama-benchmark", "bench.sif").with_parameter("model", "llama3")
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_service_running() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        let pipeline = Pipeline::new(vec![
            Stage::new("service", JobCategory::Service, service())
                .wait(WaitPolicy::new(Duration::from_secs(1), 3)),
            Stage::new("client", JobCategory::Client, client()).need(super::Need::new(
                "service",
                EndpointKind::Primary,
                Injection::Parameter("endpoint".into()),
            )),
        ]);
        for _ in 0..3 {
            gateway.push_poll(PollBuilder::default().build());
        }

        let aborted = coordinator.run(&pipeline).await.unwrap_err();
        assert!(matches!(
            aborted.error,
            Error::PollTimeoutError { attempts: 3, .. }
        ));
        assert_eq!(gateway.poll_count(), 3);
        assert_eq!(gateway.submitted.borrow().len(), 1);

        assert_eq!(aborted.record.stages.len(), 1);
        let service_id = aborted.record.job_id("service").unwrap();
        let record = coordinator
            .tracker(JobCategory::Service)
            .record(service_id)
            .unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(coordinator.tracker(JobCategory::Client).list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injects_polled_node() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        gateway.push_poll(PollBuilder::default().build());
        gateway.push_poll(running_on("mel2001"));
        gateway.push_poll(running_on("mel2002"));

        let pipeline = Pipeline::benchmark(service(), Some(monitor()), client());
        let record = coordinator.run(&pipeline).await.unwrap();

        // The client does not wait again, the node of the service is already known
        assert_eq!(*gateway.polled.borrow(), vec!["100", "100", "101"]);
        let stages: Vec<_> = record.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, vec!["service", "monitor", "client"]);
        assert_eq!(record.edges.len(), 2);
        assert_eq!(record.injected.len(), 2);
        assert_eq!(
            record.injected[0].endpoint,
            ServiceEndpoint::new("mel2001", 8080)
        );
        assert_eq!(
            record.injected[1].endpoint,
            ServiceEndpoint::new("mel2001", 11434)
        );
        for injected in &record.injected {
            assert_eq!(injected.endpoint.host, "mel2001");
        }

        let submitted = gateway.submitted.borrow();
        assert!(submitted[1].render().contains("mel2001:8080"));
        assert!(submitted[2].render().contains("mel2001:11434"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_failure() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        gateway.push_poll(
            PollBuilder::default()
                .state(SchedulerState::OutOfMemory)
                .build(),
        );

        let pipeline = Pipeline::benchmark(service(), None, client());
        let aborted = coordinator.run(&pipeline).await.unwrap_err();
        assert!(matches!(aborted.error, Error::JobTerminated { .. }));
        assert_eq!(aborted.record.stages.len(), 1);
        assert_eq!(gateway.submitted.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_client_keeps_started_service() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        gateway.push_poll(running_on("mel2001"));

        // Missing `model`
        let client = JobSpec::new("bench", "ollama-benchmark", "bench.sif");
        let pipeline = Pipeline::benchmark(service(), None, client);
        let aborted = coordinator.run(&pipeline).await.unwrap_err();
        assert!(aborted.error.is_preflight());
        assert_eq!(aborted.record.stages.len(), 1);
        assert_eq!(aborted.record.stages[0].stage, "service");
        assert_eq!(gateway.submitted.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_pipeline_submits_nothing() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        let pipeline = Pipeline::new(vec![
            Stage::new("service", JobCategory::Service, service()),
            Stage::new("service", JobCategory::Service, service()),
        ]);
        let aborted = coordinator.run(&pipeline).await.unwrap_err();
        assert!(matches!(aborted.error, Error::ConfigurationError { .. }));
        assert!(aborted.record.stages.is_empty());
        assert!(gateway.submitted.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_in_reverse_order() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        gateway.push_poll(running_on("mel2001"));
        gateway.push_poll(running_on("mel2002"));
        let pipeline = Pipeline::benchmark(service(), Some(monitor()), client());
        let record = coordinator.run(&pipeline).await.unwrap();

        let outcomes = coordinator.stop(&record).await;
        let stages: Vec<_> = outcomes.iter().map(|o| o.stage.as_str()).collect();
        assert_eq!(stages, vec!["client", "monitor", "service"]);
        assert!(outcomes.iter().all(|o| matches!(o.result, Ok(true))));
        assert_eq!(*gateway.cancelled.borrow(), vec!["102", "101", "100"]);

        let records = coordinator.refresh(&record).await.unwrap();
        assert!(records.iter().all(|r| r.status == JobStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_waits_for_monitor_node() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        gateway.push_poll(running_on("mel2001"));
        gateway.push_poll(PollBuilder::default().build());
        gateway.push_poll(PollBuilder::default().build());
        gateway.push_poll(running_on("mel2002"));

        let start = tokio::time::Instant::now();
        let pipeline = Pipeline::benchmark(service(), Some(monitor()), client());
        let record = coordinator.run(&pipeline).await.unwrap();

        assert_eq!(*gateway.polled.borrow(), vec!["100", "101", "101", "101"]);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(gateway.submitted.borrow().len(), 3);
        let monitor_id = record.job_id("monitor").unwrap();
        let monitor = coordinator
            .tracker(JobCategory::Service)
            .record(monitor_id)
            .unwrap();
        assert_eq!(monitor.node.as_deref(), Some("mel2002"));
        assert_eq!(monitor.status, JobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_timeout_skips_client() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        gateway.push_poll(running_on("mel2001"));

        let pipeline = Pipeline::benchmark(service(), Some(monitor()), client());
        let aborted = coordinator.run(&pipeline).await.unwrap_err();
        assert!(matches!(
            &aborted.error,
            Error::PollTimeoutError { stage, attempts: 6, .. } if stage == "monitor"
        ));
        assert_eq!(gateway.poll_count(), 7);
        assert_eq!(gateway.submitted.borrow().len(), 2);
        assert!(gateway.cancelled.borrow().is_empty());

        let stages: Vec<_> = aborted.record.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, vec!["service", "monitor"]);
        let services = coordinator.tracker(JobCategory::Service);
        let service_id = aborted.record.job_id("service").unwrap();
        let monitor_id = aborted.record.job_id("monitor").unwrap();
        assert_eq!(services.record(service_id).unwrap().status, JobStatus::Running);
        assert_eq!(services.record(monitor_id).unwrap().status, JobStatus::Submitted);
        assert!(coordinator.tracker(JobCategory::Client).list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_error_does_not_abort_session() {
        let registry = JobRegistry::with_builtin_variants();
        let gateway = ScriptedGateway::default();
        let mut coordinator = coordinator(&registry, &gateway);
        gateway.push_poll_error(Error::ConnectionError {
            host: "login".to_string(),
            message: "Connection reset".to_string(),
        });
        gateway.push_poll(running_on("mel2001"));

        let pipeline = Pipeline::benchmark(service(), None, client());
        let record = coordinator.run(&pipeline).await.unwrap();
        assert_eq!(gateway.poll_count(), 2);
        assert_eq!(record.stages.len(), 2);
        assert_eq!(
            record.injected[0].endpoint,
            ServiceEndpoint::new("mel2001", 11434)
        );
    }
}

pub mod client;
pub mod container;
pub mod service;
pub mod spec;

use crate::job::client::{BenchmarkClient, OllamaBenchmark};
use crate::job::service::{
    ChromaService, GrafanaService, MysqlService, OllamaService, PrometheusService, RedisService,
};
pub use crate::job::spec::{
    JobCategory, JobSpec, ParamValue, ResourceRequest, ServiceEndpoint, SidecarSpec,
};

/// Shell fragments that a job contributes to its batch script.
pub trait JobCommands {
    /// Commands executed before the container starts.
    fn setup_commands(&self) -> Vec<String>;
    /// The container invocation, without the trailing `&`.
    fn container_command(&self) -> String;
    /// Commands executed after the container was started in the background.
    fn health_check_commands(&self) -> Vec<String>;
}

/// Technology specific part of a job, evaluated against the spec it was created from.
pub trait VariantCommands {
    fn setup_commands(&self, _spec: &JobSpec) -> Vec<String> {
        vec![]
    }
    fn container_command(&self, spec: &JobSpec) -> String;
    fn health_check_commands(&self, _spec: &JobSpec) -> Vec<String> {
        vec![]
    }
}

#[derive(Debug, Clone)]
pub enum JobVariant {
    Ollama(OllamaService),
    Redis(RedisService),
    Chroma(ChromaService),
    Mysql(MysqlService),
    Prometheus(PrometheusService),
    Grafana(GrafanaService),
    OllamaBenchmark(OllamaBenchmark),
    RedisBenchmark(BenchmarkClient),
    ChromaBenchmark(BenchmarkClient),
    MysqlBenchmark(BenchmarkClient),
}

impl JobVariant {
    pub fn category(&self) -> JobCategory {
        match self {
            JobVariant::Ollama(_)
            | JobVariant::Redis(_)
            | JobVariant::Chroma(_)
            | JobVariant::Mysql(_)
            | JobVariant::Prometheus(_)
            | JobVariant::Grafana(_) => JobCategory::Service,
            JobVariant::OllamaBenchmark(_)
            | JobVariant::RedisBenchmark(_)
            | JobVariant::ChromaBenchmark(_)
            | JobVariant::MysqlBenchmark(_) => JobCategory::Client,
        }
    }

    fn commands(&self) -> &dyn VariantCommands {
        match self {
            JobVariant::Ollama(variant) => variant,
            JobVariant::Redis(variant) => variant,
            JobVariant::Chroma(variant) => variant,
            JobVariant::Mysql(variant) => variant,
            JobVariant::Prometheus(variant) => variant,
            JobVariant::Grafana(variant) => variant,
            JobVariant::OllamaBenchmark(variant) => variant,
            JobVariant::RedisBenchmark(variant)
            | JobVariant::ChromaBenchmark(variant)
            | JobVariant::MysqlBenchmark(variant) => variant,
        }
    }
}

/// Validated job: the spec together with its technology variant.
#[derive(Debug, Clone)]
pub struct JobModel {
    spec: JobSpec,
    variant: JobVariant,
}

impl JobModel {
    pub(crate) fn new(spec: JobSpec, variant: JobVariant) -> Self {
        Self { spec, variant }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn variant(&self) -> &JobVariant {
        &self.variant
    }

    pub fn category(&self) -> JobCategory {
        self.variant.category()
    }

    /// First exposed port of a service.
    pub fn primary_port(&self) -> Option<u16> {
        match self.category() {
            JobCategory::Service => self.spec.ports().first().copied(),
            JobCategory::Client => None,
        }
    }
}

impl JobCommands for JobModel {
    fn setup_commands(&self) -> Vec<String> {
        let mut commands = container::build_commands(&self.spec);
        commands.extend(self.variant.commands().setup_commands(&self.spec));
        commands
    }

    fn container_command(&self) -> String {
        self.variant.commands().container_command(&self.spec)
    }

    fn health_check_commands(&self) -> Vec<String> {
        self.variant.commands().health_check_commands(&self.spec)
    }
}

/// Checks shared by all variants.
pub(crate) fn validate_common(spec: &JobSpec) -> crate::Result<()> {
    if spec.name().trim().is_empty() {
        return Err(crate::Error::configuration(spec.tag(), "job name is empty"));
    }
    if spec.image().trim().is_empty() {
        return Err(crate::Error::configuration(
            spec.name(),
            "container image is empty",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{JobCategory, JobCommands, JobSpec};
    use crate::job::{client, service};

    #[test]
    fn test_service_primary_port() {
        let model = service::create_redis(JobSpec::new("kv", "redis", "redis.sif")).unwrap();
        assert_eq!(model.category(), JobCategory::Service);
        assert_eq!(model.primary_port(), Some(6379));
    }

    #[test]
    fn test_client_has_no_primary_port() {
        let spec = JobSpec::new("bench", "redis-benchmark", "client.sif")
            .with_parameter("endpoint", "mel2001:6379");
        let model = client::create_redis_benchmark(spec).unwrap();
        assert_eq!(model.category(), JobCategory::Client);
        assert_eq!(model.primary_port(), None);
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let error = service::create_redis(JobSpec::new("kv", "redis", " ")).unwrap_err();
        assert!(error.is_preflight());
    }

    #[test]
    fn test_build_commands_come_first() {
        let spec = JobSpec::new("kv", "redis", "redis.sif").with_build_source("docker://redis", false);
        let model = service::create_redis(spec).unwrap();
        assert_eq!(model.setup_commands()[0], "# Container management");
    }
}

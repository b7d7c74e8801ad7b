use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::error::HpcError;
use crate::job::{JobCategory, JobModel, JobSpec, ServiceEndpoint};
use crate::registry::JobRegistry;
use crate::script::{self, BatchScript};
use crate::session::wait::WaitPolicy;
use crate::tracker::JobRecord;
use crate::{JobId, Map, Set};

/// Port of a dependency stage that a dependent stage connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// First exposed port of a service.
    Primary,
    Port(u16),
    /// Port of the monitoring sidecar.
    Sidecar,
}

impl EndpointKind {
    /// Resolves the endpoint from a record, `None` while the record has no node.
    pub fn resolve(&self, record: &JobRecord) -> Option<ServiceEndpoint> {
        let port = match self {
            EndpointKind::Primary => record.primary_port?,
            EndpointKind::Port(port) => *port,
            EndpointKind::Sidecar => record.sidecar_port?,
        };
        record.endpoint(port)
    }

    /// Port of a built job model.
    pub fn port_of(&self, model: &JobModel) -> Option<u16> {
        match self {
            EndpointKind::Primary => model.primary_port(),
            EndpointKind::Port(port) => Some(*port),
            EndpointKind::Sidecar => model.spec().sidecar().map(|sidecar| sidecar.port),
        }
    }
}

impl Display for EndpointKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Primary => f.write_str("primary"),
            EndpointKind::Port(port) => write!(f, "port {port}"),
            EndpointKind::Sidecar => f.write_str("sidecar"),
        }
    }
}

/// Where a resolved endpoint ends up in the dependent spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Injection {
    /// Technology parameter, e.g. `endpoint` of benchmark clients.
    Parameter(String),
    /// Environment variable of the container.
    Environment(String),
    /// Entry of the `scrape_targets` list with the given job label.
    ScrapeTarget(String),
}

impl Injection {
    pub fn apply(&self, spec: JobSpec, endpoint: &ServiceEndpoint) -> JobSpec {
        match self {
            Injection::Parameter(key) => spec.with_parameter(key.clone(), endpoint.to_string()),
            Injection::Environment(key) => spec.with_environment(key.clone(), endpoint.to_string()),
            Injection::ScrapeTarget(job) => spec.with_scrape_target(job, endpoint),
        }
    }
}

/// Dependency of a stage on an endpoint of an earlier stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Need {
    pub stage: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: EndpointKind,
    pub inject: Injection,
}

fn default_endpoint() -> EndpointKind {
    EndpointKind::Primary
}

impl Need {
    pub fn new(stage: impl Into<String>, endpoint: EndpointKind, inject: Injection) -> Self {
        Self {
            stage: stage.into(),
            endpoint,
            inject,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub category: JobCategory,
    pub spec: JobSpec,
    pub needs: Vec<Need>,
    /// Wait for a node right after the stage is started.
    pub wait: Option<WaitPolicy>,
}

impl Stage {
    pub fn new(name: impl Into<String>, category: JobCategory, spec: JobSpec) -> Self {
        Self {
            name: name.into(),
            category,
            spec,
            needs: vec![],
            wait: None,
        }
    }

    pub fn need(mut self, need: Need) -> Self {
        self.needs.push(need);
        self
    }

    pub fn wait(mut self, policy: WaitPolicy) -> Self {
        self.wait = Some(policy);
        self
    }
}

/// Ordered list of stages, each stage may only depend on stages before it.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Service, monitor and client stages.
    ///
    /// The monitor scrapes the sidecar of the service (or its primary port when the service has
    /// no sidecar) and the client gets the service endpoint as its `endpoint` parameter.
    /// The client is started only after the monitor got a node.
    pub fn benchmark(service: JobSpec, monitor: Option<JobSpec>, client: JobSpec) -> Self {
        let service_stage = Stage::new("service", JobCategory::Service, service);
        let scraped = if service_stage.spec.sidecar().is_some() {
            EndpointKind::Sidecar
        } else {
            EndpointKind::Primary
        };
        let mut stages = vec![service_stage];
        if let Some(monitor) = monitor {
            stages.push(
                Stage::new("monitor", JobCategory::Service, monitor)
                    .need(Need::new(
                        "service",
                        scraped,
                        Injection::ScrapeTarget("service".to_string()),
                    ))
                    .wait(WaitPolicy::default()),
            );
        }
        stages.push(Stage::new("client", JobCategory::Client, client).need(Need::new(
            "service",
            EndpointKind::Primary,
            Injection::Parameter("endpoint".to_string()),
        )));
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Checks stage names and dependencies without contacting anything.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen: Set<&str> = Set::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(HpcError::configuration(stage.spec.name(), "stage name is empty"));
            }
            for need in &stage.needs {
                let Some(dependency) = self
                    .stage(&need.stage)
                    .filter(|_| seen.contains(need.stage.as_str()))
                else {
                    return Err(HpcError::configuration(
                        &stage.name,
                        format!("depends on `{}` which is not an earlier stage", need.stage),
                    ));
                };
                match need.endpoint {
                    EndpointKind::Sidecar if dependency.spec.sidecar().is_none() => {
                        return Err(HpcError::configuration(
                            &stage.name,
                            format!("stage `{}` has no sidecar", dependency.name),
                        ));
                    }
                    EndpointKind::Primary if dependency.category != JobCategory::Service => {
                        return Err(HpcError::configuration(
                            &stage.name,
                            format!("stage `{}` is not a service", dependency.name),
                        ));
                    }
                    _ => {}
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(HpcError::configuration(
                    &stage.name,
                    "stage name is used more than once",
                ));
            }
        }
        Ok(())
    }

    /// Renders the batch scripts of all stages without submitting anything.
    ///
    /// Nodes are not known before submission, every dependency is assumed to run on the
    /// placeholder host `<stage>-node`.
    pub fn render_scripts(
        &self,
        registry: &JobRegistry,
    ) -> crate::Result<Vec<(String, BatchScript)>> {
        self.validate()?;
        let mut models: Map<&str, JobModel> = Map::new();
        let mut scripts = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut spec = stage.spec.clone();
            for need in &stage.needs {
                let port = models
                    .get(need.stage.as_str())
                    .and_then(|model| need.endpoint.port_of(model))
                    .ok_or_else(|| {
                        HpcError::configuration(
                            &stage.name,
                            format!("stage `{}` has no {} endpoint", need.stage, need.endpoint),
                        )
                    })?;
                let endpoint = ServiceEndpoint::new(format!("{}-node", need.stage), port);
                spec = need.inject.apply(spec, &endpoint);
            }
            let tag = spec.tag().to_string();
            let model = registry.create(&tag, spec)?;
            let job_id = JobId::new(format!("{}-dryrun", stage.name));
            scripts.push((stage.name.clone(), script::generate(&model, &job_id)));
            models.insert(stage.name.as_str(), model);
        }
        Ok(scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::{EndpointKind, Injection, Need, Pipeline, Stage};
    use crate::Error;
    use crate::session::wait::WaitPolicy;
    use crate::job::{JobCategory, JobSpec, ServiceEndpoint, SidecarSpec};
    use crate::registry::JobRegistry;

    fn service() -> JobSpec {
        JobSpec::new("llm", "ollama", "ollama.sif")
    }

    fn client() -> JobSpec {
        JobSpec::new("bench", "ollama-benchmark", "bench.sif").with_parameter("model", "llama3")
    }

    fn monitor() -> JobSpec {
        JobSpec::new("prom", "prometheus", "prometheus.sif")
    }

    #[test]
    fn test_benchmark_pipeline() {
        let pipeline = Pipeline::benchmark(
            service().with_sidecar(SidecarSpec::default()),
            Some(monitor()),
            client(),
        );
        let names: Vec<_> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["service", "monitor", "client"]);
        assert_eq!(
            pipeline.stage("monitor").unwrap().needs[0].endpoint,
            EndpointKind::Sidecar
        );
        assert_eq!(
            pipeline.stage("client").unwrap().needs[0].inject,
            Injection::Parameter("endpoint".to_string())
        );
        assert_eq!(
            pipeline.stage("monitor").unwrap().wait,
            Some(WaitPolicy::default())
        );
        assert_eq!(pipeline.stage("client").unwrap().wait, None);
        pipeline.validate().unwrap();
    }

    #[test]
    fn test_benchmark_without_sidecar_scrapes_primary_port() {
        let pipeline = Pipeline::benchmark(service(), Some(monitor()), client());
        assert_eq!(
            pipeline.stage("monitor").unwrap().needs[0].endpoint,
            EndpointKind::Primary
        );
        assert_eq!(
            Pipeline::benchmark(service(), None, client()).stages().len(),
            2
        );
    }

    #[test]
    fn test_forward_reference() {
        let pipeline = Pipeline::new(vec![
            Stage::new("client", JobCategory::Client, client()).need(Need::new(
                "service",
                EndpointKind::Primary,
                Injection::Parameter("endpoint".into()),
            )),
            Stage::new("service", JobCategory::Service, service()),
        ]);
        assert!(matches!(
            pipeline.validate(),
            Err(Error::ConfigurationError { job, .. }) if job == "client"
        ));
    }

    #[test]
    fn test_self_reference() {
        let pipeline = Pipeline::new(vec![
            Stage::new("service", JobCategory::Service, service()).need(Need::new(
                "service",
                EndpointKind::Primary,
                Injection::Environment("SELF".into()),
            )),
        ]);
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_duplicate_names() {
        let pipeline = Pipeline::new(vec![
            Stage::new("service", JobCategory::Service, service()),
            Stage::new("service", JobCategory::Service, service()),
        ]);
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_sidecar_need_without_sidecar() {
        let pipeline = Pipeline::new(vec![
            Stage::new("service", JobCategory::Service, service()),
            Stage::new("monitor", JobCategory::Service, monitor()).need(Need::new(
                "service",
                EndpointKind::Sidecar,
                Injection::ScrapeTarget("llm".into()),
            )),
        ]);
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_primary_need_on_client() {
        let pipeline = Pipeline::new(vec![
            Stage::new("client", JobCategory::Client, client()),
            Stage::new("other", JobCategory::Client, client()).need(Need::new(
                "client",
                EndpointKind::Primary,
                Injection::Parameter("endpoint".into()),
            )),
        ]);
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_injection() {
        let endpoint = ServiceEndpoint::new("mel2001", 11434);
        let spec = Injection::Parameter("endpoint".into()).apply(client(), &endpoint);
        assert_eq!(spec.str_parameter("endpoint"), Some("mel2001:11434"));

        let spec = Injection::Environment("TARGET".into()).apply(client(), &endpoint);
        assert_eq!(
            spec.environment().get("TARGET").map(|v| v.as_str()),
            Some("mel2001:11434")
        );

        let spec = Injection::ScrapeTarget("llm".into()).apply(monitor(), &endpoint);
        assert_eq!(
            spec.parameter("scrape_targets").unwrap().to_string(),
            "llm=mel2001:11434"
        );
    }

    #[test]
    fn test_parse_need() {
        let need: Need =
            toml::from_str("stage = \"service\"\ninject = { parameter = \"endpoint\" }").unwrap();
        assert_eq!(
            need,
            Need::new(
                "service",
                EndpointKind::Primary,
                Injection::Parameter("endpoint".into())
            )
        );
        let need: Need = toml::from_str(
            "stage = \"service\"\nendpoint = \"sidecar\"\ninject = { scrape_target = \"llm\" }",
        )
        .unwrap();
        assert_eq!(need.endpoint, EndpointKind::Sidecar);
        let need: Need = toml::from_str(
            "stage = \"service\"\nendpoint = { port = 9100 }\ninject = { environment = \"X\" }",
        )
        .unwrap();
        assert_eq!(need.endpoint, EndpointKind::Port(9100));
    }

    #[test]
    fn test_render_scripts_with_placeholder_hosts() {
        let registry = JobRegistry::with_builtin_variants();
        let pipeline = Pipeline::benchmark(
            service().with_sidecar(SidecarSpec::default()),
            Some(monitor()),
            client(),
        );
        let scripts = pipeline.render_scripts(&registry).unwrap();
        let names: Vec<_> = scripts.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["service", "monitor", "client"]);
        assert!(scripts[1].1.render().contains("service-node:8080"));
        assert!(scripts[2].1.render().contains("service-node:11434"));
        assert!(
            scripts[0]
                .1
                .directives()
                .any(|d| d == "--job-name=llm_service-dryrun")
        );
    }

    #[test]
    fn test_render_scripts_reports_invalid_stage() {
        let registry = JobRegistry::with_builtin_variants();
        let client = JobSpec::new("bench", "ollama-benchmark", "bench.sif");
        let pipeline = Pipeline::benchmark(service(), None, client);
        assert!(matches!(
            pipeline.render_scripts(&registry),
            Err(Error::ConfigurationError { .. })
        ));
    }
}

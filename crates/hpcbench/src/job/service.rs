//! Long-running service variants.

use crate::job::container::ContainerCommand;
use crate::job::spec::{JobSpec, SCRAPE_TARGETS, ServiceEndpoint};
use crate::job::{JobModel, JobVariant, VariantCommands, validate_common};

pub const OLLAMA_PORT: u16 = 11434;
pub const REDIS_PORT: u16 = 6379;
pub const CHROMA_PORT: u16 = 8000;
pub const MYSQL_PORT: u16 = 3306;
pub const PROMETHEUS_PORT: u16 = 9090;
pub const GRAFANA_PORT: u16 = 3000;

const READY_ATTEMPTS: u32 = 30;

/// Validates the spec of a service and fills in the default port.
fn prepare_service(spec: JobSpec, default_port: u16) -> crate::Result<JobSpec> {
    validate_common(&spec)?;
    let spec = if spec.ports().is_empty() {
        spec.with_ports(vec![default_port])
    } else {
        spec
    };
    if spec.ports().contains(&0) {
        return Err(crate::Error::configuration(
            spec.name(),
            "service has no usable exposed port (port 0)",
        ));
    }
    if let Some(sidecar) = spec.sidecar() {
        if spec.ports().contains(&sidecar.port) {
            return Err(crate::Error::configuration(
                spec.name(),
                format!(
                    "sidecar port {} collides with an exposed port",
                    sidecar.port
                ),
            ));
        }
    }
    Ok(spec)
}

fn port(spec: &JobSpec) -> u16 {
    spec.ports().first().copied().unwrap_or_default()
}

/// Polls `check` until it succeeds, the job keeps running either way.
fn wait_until_ready(name: &str, check: &str) -> Vec<String> {
    vec![
        format!("for i in $(seq 1 {READY_ATTEMPTS}); do"),
        format!("    if {check}; then"),
        format!("        echo \"{name} is ready on $(hostname)\""),
        "        break".to_string(),
        "    fi".to_string(),
        format!("    echo \"Waiting for {name} ($i/{READY_ATTEMPTS})\""),
        "    sleep 5".to_string(),
        "done".to_string(),
    ]
}

fn http_check(port: u16, path: &str) -> String {
    format!("curl -sf http://localhost:{port}{path} > /dev/null 2>&1")
}

fn tcp_check(port: u16) -> String {
    format!("(exec 3<>/dev/tcp/localhost/{port}) 2>/dev/null")
}

/// Inference server. When `model` is set, it is pulled once the server responds.
#[derive(Debug, Clone)]
pub struct OllamaService {
    model: Option<String>,
}

pub fn create_ollama(spec: JobSpec) -> crate::Result<JobModel> {
    let spec = prepare_service(spec, OLLAMA_PORT)?;
    let model = spec.str_parameter("model").map(|model| model.to_string());
    Ok(JobModel::new(
        spec,
        JobVariant::Ollama(OllamaService { model }),
    ))
}

impl VariantCommands for OllamaService {
    fn container_command(&self, spec: &JobSpec) -> String {
        ContainerCommand::for_spec(spec)
            .env("OLLAMA_HOST", format!("0.0.0.0:{}", port(spec)))
            .program_or(spec, &["ollama", "serve"])
            .render()
    }

    fn health_check_commands(&self, spec: &JobSpec) -> Vec<String> {
        let mut commands = wait_until_ready(spec.name(), &http_check(port(spec), "/api/tags"));
        if let Some(model) = &self.model {
            commands.push(
                ContainerCommand::new(spec.image())
                    .env("OLLAMA_HOST", format!("localhost:{}", port(spec)))
                    .args(["ollama", "pull", model.as_str()])
                    .render(),
            );
        }
        commands
    }
}

#[derive(Debug, Clone)]
pub struct RedisService;

pub fn create_redis(spec: JobSpec) -> crate::Result<JobModel> {
    let spec = prepare_service(spec, REDIS_PORT)?;
    Ok(JobModel::new(spec, JobVariant::Redis(RedisService)))
}

impl VariantCommands for RedisService {
    fn container_command(&self, spec: &JobSpec) -> String {
        let port = port(spec).to_string();
        ContainerCommand::for_spec(spec)
            .program_or(
                spec,
                &[
                    "redis-server",
                    "--port",
                    &port,
                    "--bind",
                    "0.0.0.0",
                    "--protected-mode",
                    "no",
                ],
            )
            .render()
    }

    fn health_check_commands(&self, spec: &JobSpec) -> Vec<String> {
        wait_until_ready(spec.name(), &tcp_check(port(spec)))
    }
}

#[derive(Debug, Clone)]
pub struct ChromaService {
    data_dir: String,
}

pub fn create_chroma(spec: JobSpec) -> crate::Result<JobModel> {
    let spec = prepare_service(spec, CHROMA_PORT)?;
    let data_dir = spec
        .str_parameter("data_dir")
        .map(|dir| dir.to_string())
        .unwrap_or_else(|| format!("$HOME/chroma/{}", spec.name()));
    Ok(JobModel::new(
        spec,
        JobVariant::Chroma(ChromaService { data_dir }),
    ))
}

impl VariantCommands for ChromaService {
    fn setup_commands(&self, _spec: &JobSpec) -> Vec<String> {
        vec![format!("mkdir -p {}", self.data_dir)]
    }

    fn container_command(&self, spec: &JobSpec) -> String {
        let port = port(spec).to_string();
        ContainerCommand::for_spec(spec)
            .bind(&self.data_dir, "/data")
            .program_or(
                spec,
                &[
                    "chroma", "run", "--host", "0.0.0.0", "--port", &port, "--path", "/data",
                ],
            )
            .render()
    }

    fn health_check_commands(&self, spec: &JobSpec) -> Vec<String> {
        wait_until_ready(spec.name(), &http_check(port(spec), "/api/v1/heartbeat"))
    }
}

/// Relational store, the data directory is initialized on first start.
#[derive(Debug, Clone)]
pub struct MysqlService {
    data_dir: String,
}

pub fn create_mysql(spec: JobSpec) -> crate::Result<JobModel> {
    let spec = prepare_service(spec, MYSQL_PORT)?;
    let data_dir = spec
        .str_parameter("data_dir")
        .ok_or_else(|| crate::Error::configuration(spec.name(), "missing `data_dir` parameter"))?
        .to_string();
    Ok(JobModel::new(spec, JobVariant::Mysql(MysqlService { data_dir })))
}

impl MysqlService {
    fn container(&self, spec: &JobSpec) -> ContainerCommand {
        ContainerCommand::new(spec.image()).bind(&self.data_dir, "/mysql")
    }
}

impl VariantCommands for MysqlService {
    fn setup_commands(&self, spec: &JobSpec) -> Vec<String> {
        let initialize = self
            .container(spec)
            .args([
                "mysqld",
                "--initialize-insecure",
                "--datadir=/mysql/data",
            ])
            .render();
        vec![
            format!(
                "mkdir -p {dir}/data {dir}/run {dir}/tmp",
                dir = self.data_dir
            ),
            format!("if [ ! -d \"{}/data/mysql\" ]; then", self.data_dir),
            format!("    {initialize}"),
            "fi".to_string(),
        ]
    }

    fn container_command(&self, spec: &JobSpec) -> String {
        let port = format!("--port={}", port(spec));
        self.container(spec)
            .gpu(spec.resources().uses_gpu())
            .envs(spec.environment())
            .program_or(
                spec,
                &[
                    "mysqld",
                    "--datadir=/mysql/data",
                    "--socket=/mysql/run/mysqld.sock",
                    "--pid-file=/mysql/run/mysqld.pid",
                    "--tmpdir=/mysql/tmp",
                    "--bind-address=0.0.0.0",
                    &port,
                ],
            )
            .render()
    }

    fn health_check_commands(&self, spec: &JobSpec) -> Vec<String> {
        let ping = self
            .container(spec)
            .args(["mysqladmin", "--socket=/mysql/run/mysqld.sock", "ping"])
            .render();
        wait_until_ready(spec.name(), &format!("{ping} > /dev/null 2>&1"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeTarget {
    pub job: String,
    pub endpoint: ServiceEndpoint,
}

/// Metrics collector scraping the configured targets.
#[derive(Debug, Clone)]
pub struct PrometheusService {
    targets: Vec<ScrapeTarget>,
    scrape_interval: String,
}

fn parse_scrape_targets(spec: &JobSpec) -> crate::Result<Vec<ScrapeTarget>> {
    let Some(value) = spec.parameter(SCRAPE_TARGETS) else {
        return Err(crate::Error::configuration(
            spec.name(),
            "at least one entry in `scrape_targets` is required",
        ));
    };
    let targets = value
        .items()
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let text = item.to_string();
            let (job, address) = match text.split_once('=') {
                Some((job, address)) => (job.to_string(), address.to_string()),
                None => (format!("target{index}"), text.clone()),
            };
            ServiceEndpoint::parse(&address)
                .map(|endpoint| ScrapeTarget { job, endpoint })
                .ok_or_else(|| {
                    crate::Error::configuration(
                        spec.name(),
                        format!("invalid scrape target `{text}`, expected `[job=]host:port`"),
                    )
                })
        })
        .collect::<crate::Result<Vec<_>>>()?;
    if targets.is_empty() {
        return Err(crate::Error::configuration(
            spec.name(),
            "at least one entry in `scrape_targets` is required",
        ));
    }
    Ok(targets)
}

pub fn create_prometheus(spec: JobSpec) -> crate::Result<JobModel> {
    let spec = prepare_service(spec, PROMETHEUS_PORT)?;
    let targets = parse_scrape_targets(&spec)?;
    let scrape_interval = spec
        .str_parameter("scrape_interval")
        .unwrap_or("15s")
        .to_string();
    Ok(JobModel::new(
        spec,
        JobVariant::Prometheus(PrometheusService {
            targets,
            scrape_interval,
        }),
    ))
}

impl PrometheusService {
    pub fn targets(&self) -> &[ScrapeTarget] {
        &self.targets
    }

    fn directory(spec: &JobSpec) -> String {
        format!("$HOME/prometheus/{}", spec.name())
    }
}

impl VariantCommands for PrometheusService {
    fn setup_commands(&self, spec: &JobSpec) -> Vec<String> {
        let directory = Self::directory(spec);
        let mut commands = vec![
            format!("mkdir -p {directory}/data {directory}/config"),
            format!("cat > {directory}/config/prometheus.yml << 'EOF'"),
            "global:".to_string(),
            format!("  scrape_interval: {}", self.scrape_interval),
            "scrape_configs:".to_string(),
        ];
        for target in &self.targets {
            commands.extend([
                format!("  - job_name: '{}'", target.job),
                "    static_configs:".to_string(),
                format!("      - targets: ['{}']", target.endpoint),
            ]);
        }
        commands.push("EOF".to_string());
        commands
    }

    fn container_command(&self, spec: &JobSpec) -> String {
        let directory = Self::directory(spec);
        let listen = format!("--web.listen-address=0.0.0.0:{}", port(spec));
        ContainerCommand::for_spec(spec)
            .bind(&format!("{directory}/data"), "/prometheus")
            .bind(&format!("{directory}/config"), "/etc/prometheus")
            .program_or(
                spec,
                &[
                    "prometheus",
                    "--config.file=/etc/prometheus/prometheus.yml",
                    "--storage.tsdb.path=/prometheus",
                    &listen,
                ],
            )
            .render()
    }

    fn health_check_commands(&self, spec: &JobSpec) -> Vec<String> {
        wait_until_ready(spec.name(), &http_check(port(spec), "/-/ready"))
    }
}

/// Dashboard with a provisioned Prometheus datasource.
#[derive(Debug, Clone)]
pub struct GrafanaService {
    datasource: String,
}

pub fn create_grafana(spec: JobSpec) -> crate::Result<JobModel> {
    let spec = prepare_service(spec, GRAFANA_PORT)?;
    let datasource = spec
        .str_parameter("datasource")
        .ok_or_else(|| crate::Error::configuration(spec.name(), "missing `datasource` parameter"))?;
    if ServiceEndpoint::parse(datasource).is_none() {
        return Err(crate::Error::configuration(
            spec.name(),
            format!("malformed datasource endpoint `{datasource}`"),
        ));
    }
    let datasource = if datasource.contains("://") {
        datasource.to_string()
    } else {
        format!("http://{datasource}")
    };
    Ok(JobModel::new(
        spec,
        JobVariant::Grafana(GrafanaService { datasource }),
    ))
}

impl GrafanaService {
    fn directory(spec: &JobSpec) -> String {
        format!("$HOME/grafana/{}", spec.name())
    }
}

impl VariantCommands for GrafanaService {
    fn setup_commands(&self, spec: &JobSpec) -> Vec<String> {
        let directory = Self::directory(spec);
        vec![
            format!("mkdir -p {directory}/data {directory}/provisioning/datasources"),
            format!("cat > {directory}/provisioning/datasources/prometheus.yml << 'EOF'"),
            "apiVersion: 1".to_string(),
            "datasources:".to_string(),
            "  - name: Prometheus".to_string(),
            "    type: prometheus".to_string(),
            "    uid: prometheus".to_string(),
            "    access: proxy".to_string(),
            format!("    url: {}", self.datasource),
            "    isDefault: true".to_string(),
            "EOF".to_string(),
        ]
    }

    fn container_command(&self, spec: &JobSpec) -> String {
        let directory = Self::directory(spec);
        ContainerCommand::for_spec(spec)
            .bind(&format!("{directory}/data"), "/var/lib/grafana")
            .bind(
                &format!("{directory}/provisioning"),
                "/etc/grafana/provisioning",
            )
            .env("GF_SERVER_HTTP_PORT", port(spec).to_string())
            .env("GF_PATHS_PROVISIONING", "/etc/grafana/provisioning")
            .program_or(spec, &["grafana-server", "--homepath=/usr/share/grafana"])
            .render()
    }

    fn health_check_commands(&self, spec: &JobSpec) -> Vec<String> {
        wait_until_ready(spec.name(), &http_check(port(spec), "/api/health"))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        create_chroma, create_grafana, create_mysql, create_ollama, create_prometheus,
        create_redis,
    };
    use crate::Error;
    use crate::job::spec::{JobSpec, ResourceRequest, SidecarSpec};
    use crate::job::{JobCommands, JobVariant, ServiceEndpoint};

    fn spec(tag: &str) -> JobSpec {
        JobSpec::new("svc", tag, format!("/c/{tag}.sif"))
    }

    #[test]
    fn test_ollama_binds_port() {
        let model = create_ollama(spec("ollama").with_resources(ResourceRequest {
            gpus: Some(1),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            model.container_command(),
            "apptainer exec --nv --env OLLAMA_HOST=0.0.0.0:11434 /c/ollama.sif ollama serve"
        );
    }

    #[test]
    fn test_ollama_pulls_model() {
        let model = create_ollama(spec("ollama").with_parameter("model", "llama3")).unwrap();
        let checks = model.health_check_commands();
        assert_eq!(
            checks.last().unwrap(),
            "apptainer exec --env OLLAMA_HOST=localhost:11434 /c/ollama.sif ollama pull llama3"
        );
    }

    #[test]
    fn test_custom_port_is_used() {
        let model = create_redis(spec("redis").with_ports(vec![7000])).unwrap();
        assert!(model.container_command().contains("--port 7000"));
        assert!(
            model
                .health_check_commands()
                .iter()
                .any(|c| c.contains("/dev/tcp/localhost/7000"))
        );
    }

    #[test]
    fn test_sidecar_port_collision() {
        let result = create_chroma(spec("chroma").with_ports(vec![8080]).with_sidecar(
            SidecarSpec {
                port: 8080,
                ..Default::default()
            },
        ));
        assert!(matches!(result, Err(Error::ConfigurationError { .. })));
    }

    #[test]
    fn test_disabled_sidecar_does_not_collide() {
        let result = create_chroma(spec("chroma").with_ports(vec![8080]).with_sidecar(
            SidecarSpec {
                enabled: false,
                port: 8080,
                ..Default::default()
            },
        ));
        assert!(result.is_ok());
    }

    #[test]
    fn test_zero_port_is_rejected() {
        assert!(create_redis(spec("redis").with_ports(vec![0])).is_err());
    }

    #[test]
    fn test_mysql_requires_data_dir() {
        let error = create_mysql(spec("mysql")).unwrap_err();
        assert!(error.to_string().contains("data_dir"));

        let model = create_mysql(spec("mysql").with_parameter("data_dir", "/scratch/db")).unwrap();
        assert_eq!(
            model.setup_commands()[0],
            "mkdir -p /scratch/db/data /scratch/db/run /scratch/db/tmp"
        );
        assert!(model.container_command().contains("--bind /scratch/db:/mysql"));
    }

    #[test]
    fn test_prometheus_requires_targets() {
        assert!(create_prometheus(spec("prometheus")).is_err());
        assert!(create_prometheus(spec("prometheus").with_parameter("scrape_targets", "nope")).is_err());
    }

    #[test]
    fn test_prometheus_config() {
        let model = create_prometheus(
            spec("prometheus")
                .with_scrape_target("llm", &ServiceEndpoint::new("mel2001", 8080)),
        )
        .unwrap();
        let JobVariant::Prometheus(prometheus) = model.variant() else {
            panic!("unexpected variant");
        };
        assert_eq!(prometheus.targets().len(), 1);
        let setup = model.setup_commands().join("\n");
        insta::assert_snapshot!(setup, @r"
        mkdir -p $HOME/prometheus/svc/data $HOME/prometheus/svc/config
        cat > $HOME/prometheus/svc/config/prometheus.yml << 'EOF'
        global:
          scrape_interval: 15s
        scrape_configs:
          - job_name: 'llm'
            static_configs:
              - targets: ['mel2001:8080']
        EOF
        ");
    }

    #[test]
    fn test_grafana_datasource() {
        assert!(create_grafana(spec("grafana")).is_err());
        assert!(create_grafana(spec("grafana").with_parameter("datasource", "nohost")).is_err());

        let model =
            create_grafana(spec("grafana").with_parameter("datasource", "mel2002:9090")).unwrap();
        assert!(
            model
                .setup_commands()
                .contains(&"    url: http://mel2002:9090".to_string())
        );
        assert!(model.container_command().contains("--env GF_SERVER_HTTP_PORT=3000"));
    }
}

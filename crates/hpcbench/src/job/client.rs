//! Finite benchmark drivers, each one exercises a single service endpoint.

use crate::job::container::ContainerCommand;
use crate::job::spec::{JobSpec, ParamValue, ServiceEndpoint};
use crate::job::{JobModel, JobVariant, VariantCommands, validate_common};

const DEFAULT_SCRIPTS_DIR: &str = "$HOME/benchmark_scripts";
const DEFAULT_RESULTS_DIR: &str = "$SLURM_SUBMIT_DIR/results";

/// Parameters consumed by the client itself, they are not forwarded to the benchmark script.
const RESERVED_PARAMETERS: [&str; 5] =
    ["endpoint", "script", "scripts_dir", "results_dir", "output_file"];

#[derive(Debug, Clone)]
pub struct BenchmarkClient {
    endpoint: ServiceEndpoint,
    /// Value passed to `--endpoint`, either `host:port` or a URL.
    endpoint_arg: String,
    script: String,
    scripts_dir: String,
    results_dir: String,
    output_file: String,
}

impl BenchmarkClient {
    fn from_spec(spec: &JobSpec, default_script: &str, as_url: bool) -> crate::Result<Self> {
        validate_common(spec)?;
        if spec.sidecar().is_some() {
            return Err(crate::Error::configuration(
                spec.name(),
                "sidecar monitoring is only available for services",
            ));
        }
        let raw = spec
            .str_parameter("endpoint")
            .ok_or_else(|| crate::Error::configuration(spec.name(), "missing `endpoint` parameter"))?;
        let endpoint = ServiceEndpoint::parse(raw).ok_or_else(|| {
            crate::Error::configuration(spec.name(), format!("malformed endpoint `{raw}`"))
        })?;
        let endpoint_arg = match (as_url, raw.contains("://")) {
            (true, true) => raw.to_string(),
            (true, false) => endpoint.url(),
            (false, _) => endpoint.to_string(),
        };
        let param = |key: &str, default: String| {
            spec.str_parameter(key)
                .map(|value| value.to_string())
                .unwrap_or(default)
        };
        Ok(Self {
            script: param("script", default_script.to_string()),
            scripts_dir: param("scripts_dir", DEFAULT_SCRIPTS_DIR.to_string()),
            results_dir: param("results_dir", DEFAULT_RESULTS_DIR.to_string()),
            output_file: param(
                "output_file",
                format!("/tmp/{}_${{SLURM_JOB_ID}}_results.json", spec.name()),
            ),
            endpoint,
            endpoint_arg,
        })
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    fn script_path(&self) -> String {
        format!("{}/{}", self.scripts_dir, self.script)
    }

    fn script_args(&self, spec: &JobSpec) -> Vec<String> {
        let mut args = vec![
            "python".to_string(),
            format!("/app/{}", self.script),
            format!("--endpoint={}", self.endpoint_arg),
            format!("--output-file={}", self.output_file),
        ];
        for (key, value) in spec.parameters() {
            if RESERVED_PARAMETERS.contains(&key.as_str()) {
                continue;
            }
            let flag = key.replace('_', "-");
            match value {
                ParamValue::Bool(true) => args.push(format!("--{flag}")),
                ParamValue::Bool(false) => {}
                value => args.push(format!("--{flag}={value}")),
            }
        }
        args
    }
}

impl VariantCommands for BenchmarkClient {
    fn setup_commands(&self, spec: &JobSpec) -> Vec<String> {
        let mut commands = vec![
            format!("export TARGET_SERVICE_HOST={}", self.endpoint.host),
            format!("export TARGET_SERVICE_PORT={}", self.endpoint.port),
        ];
        if spec.command().is_none() {
            let script = self.script_path();
            commands.extend([
                format!("if [ ! -f \"{script}\" ]; then"),
                format!("    echo \"Benchmark script {script} not found\""),
                "    exit 1".to_string(),
                "fi".to_string(),
            ]);
        }
        commands.push(format!("mkdir -p {}", self.results_dir));
        commands
    }

    fn container_command(&self, spec: &JobSpec) -> String {
        let command = ContainerCommand::for_spec(spec).bind(&self.scripts_dir, "/app");
        let command = match spec.command() {
            Some(_) => command.program_or(spec, &[]),
            None => command.args(self.script_args(spec)),
        };
        command.render()
    }

    /// The workload runs in the background, wait for it and collect its result file.
    fn health_check_commands(&self, _spec: &JobSpec) -> Vec<String> {
        vec![
            "wait $MAIN_PID".to_string(),
            "STATUS=$?".to_string(),
            format!(
                "cp {} {}/ 2>/dev/null || echo \"Warning: could not copy {}\"",
                self.output_file, self.results_dir, self.output_file
            ),
            "exit $STATUS".to_string(),
        ]
    }
}

/// Inference benchmark, needs the model to query.
#[derive(Debug, Clone)]
pub struct OllamaBenchmark {
    client: BenchmarkClient,
    model: String,
}

impl OllamaBenchmark {
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl VariantCommands for OllamaBenchmark {
    fn setup_commands(&self, spec: &JobSpec) -> Vec<String> {
        self.client.setup_commands(spec)
    }

    fn container_command(&self, spec: &JobSpec) -> String {
        self.client.container_command(spec)
    }

    fn health_check_commands(&self, spec: &JobSpec) -> Vec<String> {
        self.client.health_check_commands(spec)
    }
}

pub fn create_ollama_benchmark(spec: JobSpec) -> crate::Result<JobModel> {
    let client = BenchmarkClient::from_spec(&spec, "ollama_benchmark.py", true)?;
    let model = spec
        .str_parameter("model")
        .ok_or_else(|| crate::Error::configuration(spec.name(), "missing `model` parameter"))?
        .to_string();
    Ok(JobModel::new(
        spec,
        JobVariant::OllamaBenchmark(OllamaBenchmark { client, model }),
    ))
}

pub fn create_redis_benchmark(spec: JobSpec) -> crate::Result<JobModel> {
    let client = BenchmarkClient::from_spec(&spec, "redis_benchmark.py", false)?;
    Ok(JobModel::new(spec, JobVariant::RedisBenchmark(client)))
}

pub fn create_chroma_benchmark(spec: JobSpec) -> crate::Result<JobModel> {
    let client = BenchmarkClient::from_spec(&spec, "chroma_benchmark.py", true)?;
    Ok(JobModel::new(spec, JobVariant::ChromaBenchmark(client)))
}

pub fn create_mysql_benchmark(spec: JobSpec) -> crate::Result<JobModel> {
    let client = BenchmarkClient::from_spec(&spec, "mysql_benchmark.py", false)?;
    Ok(JobModel::new(spec, JobVariant::MysqlBenchmark(client)))
}

#[cfg(test)]
mod tests {
    use super::{
        create_chroma_benchmark, create_mysql_benchmark, create_ollama_benchmark,
        create_redis_benchmark,
    };
    use crate::Error;
    use crate::job::JobCommands;
    use crate::job::spec::{JobSpec, SidecarSpec};

    fn spec(tag: &str) -> JobSpec {
        JobSpec::new("bench", tag, "client.sif")
    }

    #[test]
    fn test_endpoint_is_required() {
        let result = create_redis_benchmark(spec("redis-benchmark"));
        assert!(matches!(result, Err(Error::ConfigurationError { .. })));
    }

    #[test]
    fn test_malformed_endpoint() {
        let result =
            create_mysql_benchmark(spec("mysql-benchmark").with_parameter("endpoint", "mel2001"));
        assert!(matches!(result, Err(Error::ConfigurationError { .. })));
    }

    #[test]
    fn test_ollama_benchmark_requires_model() {
        let spec = spec("ollama-benchmark").with_parameter("endpoint", "mel2001:11434");
        assert!(create_ollama_benchmark(spec.clone()).is_err());
        assert!(create_ollama_benchmark(spec.with_parameter("model", "llama3")).is_ok());
    }

    #[test]
    fn test_client_rejects_sidecar() {
        let spec = spec("redis-benchmark")
            .with_parameter("endpoint", "mel2001:6379")
            .with_sidecar(SidecarSpec::default());
        assert!(create_redis_benchmark(spec).is_err());
    }

    #[test]
    fn test_redis_benchmark_command() {
        let model = create_redis_benchmark(
            spec("redis-benchmark")
                .with_parameter("endpoint", "mel2001:6379")
                .with_parameter("num_operations", 5000)
                .with_parameter("test_persistence", true)
                .with_parameter("verbose", false),
        )
        .unwrap();
        assert_eq!(
            model.container_command(),
            "apptainer exec --bind $HOME/benchmark_scripts:/app client.sif python /app/redis_benchmark.py --endpoint=mel2001:6379 --output-file=/tmp/bench_${SLURM_JOB_ID}_results.json --num-operations=5000 --test-persistence"
        );
    }

    #[test]
    fn test_url_endpoint_for_http_clients() {
        let model = create_chroma_benchmark(
            spec("chroma-benchmark").with_parameter("endpoint", "mel2003:8000"),
        )
        .unwrap();
        assert!(
            model
                .container_command()
                .contains("--endpoint=http://mel2003:8000")
        );
    }

    #[test]
    fn test_client_exports_target() {
        let model = create_redis_benchmark(
            spec("redis-benchmark")
                .with_parameter("endpoint", "mel2001:6379")
                .with_parameter("results_dir", "/scratch/results"),
        )
        .unwrap();
        let setup = model.setup_commands();
        assert_eq!(setup[0], "export TARGET_SERVICE_HOST=mel2001");
        assert_eq!(setup[1], "export TARGET_SERVICE_PORT=6379");
        assert_eq!(setup.last().unwrap(), "mkdir -p /scratch/results");

        let checks = model.health_check_commands();
        assert_eq!(checks[0], "wait $MAIN_PID");
        assert_eq!(checks.last().unwrap(), "exit $STATUS");
    }
}

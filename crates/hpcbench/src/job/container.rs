use std::collections::BTreeMap;

use crate::common::utils::str::shell_quote;
use crate::job::spec::{JobSpec, SidecarSpec};

/// Builder of an `apptainer exec` command line.
#[derive(Debug, Clone, Default)]
pub struct ContainerCommand {
    image: String,
    gpu: bool,
    binds: Vec<String>,
    environment: Vec<(String, String)>,
    program: Vec<String>,
}

impl ContainerCommand {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Container of a job: image, GPU passthrough and environment taken from the spec.
    pub fn for_spec(spec: &JobSpec) -> Self {
        Self::new(spec.image())
            .gpu(spec.resources().uses_gpu())
            .envs(spec.environment())
    }

    pub fn gpu(mut self, enabled: bool) -> Self {
        self.gpu = enabled;
        self
    }

    pub fn bind(mut self, source: &str, target: &str) -> Self {
        self.binds.push(format!("{source}:{target}"));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, environment: &BTreeMap<String, String>) -> Self {
        self.environment.extend(
            environment
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.program.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program.extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    /// Uses the command override of the spec, or the given default program.
    pub fn program_or(self, spec: &JobSpec, default: &[&str]) -> Self {
        match spec.command() {
            Some(command) => self.arg(command).args(spec.args().iter().cloned()),
            None => self.args(default.iter().copied()),
        }
    }

    /// Environment values and bind paths are inserted verbatim so that shell variables
    /// (`$HOME`) expand. Program arguments are quoted when needed.
    pub fn render(&self) -> String {
        let mut parts = vec!["apptainer".to_string(), "exec".to_string()];
        if self.gpu {
            parts.push("--nv".to_string());
        }
        for bind in &self.binds {
            parts.push(format!("--bind {bind}"));
        }
        for (key, value) in &self.environment {
            parts.push(format!("--env {key}={}", quote_expandable(value)));
        }
        parts.push(self.image.clone());
        parts.extend(self.program.iter().map(|arg| quote_expandable(arg)));
        parts.join(" ")
    }
}

/// Double quotes values with whitespace while keeping `$VAR` expansion working.
fn quote_expandable(value: &str) -> String {
    if value.contains('$') {
        if value.chars().any(char::is_whitespace) || value.contains('"') {
            format!("\"{}\"", value.replace('"', "\\\""))
        } else {
            value.to_string()
        }
    } else {
        shell_quote(value).into_owned()
    }
}

/// Commands that build the image of the job from `build_source` when it is missing.
/// With `force_rebuild`, the image is always rebuilt.
pub fn build_commands(spec: &JobSpec) -> Vec<String> {
    let Some(source) = spec.build_source() else {
        return vec![];
    };
    let image = spec.image();
    let mut commands = vec![
        "# Container management".to_string(),
        format!("mkdir -p \"$(dirname {image})\""),
    ];
    if spec.force_rebuild() {
        commands.extend([
            format!("echo \"Rebuilding {image} from {source}\""),
            format!("if ! apptainer build --force {image} {source}; then"),
            "    echo \"Container build failed at $(date)\"".to_string(),
            "    exit 1".to_string(),
            "fi".to_string(),
        ]);
    } else {
        commands.extend([
            format!("if [ ! -f \"{image}\" ]; then"),
            format!("    echo \"Container {image} not found, building from {source}\""),
            format!("    if ! apptainer build {image} {source}; then"),
            "        echo \"Container build failed at $(date)\"".to_string(),
            "        exit 1".to_string(),
            "    fi".to_string(),
            "fi".to_string(),
        ]);
    }
    commands
}

/// cAdvisor container that exposes resource metrics of the node.
pub fn sidecar_command(sidecar: &SidecarSpec) -> String {
    ContainerCommand::new(&sidecar.image)
        .bind("/", "/rootfs:ro")
        .bind("/sys", "/sys:ro")
        .bind("/var/run", "/var/run:ro")
        .arg("cadvisor")
        .arg(format!("--port={}", sidecar.port))
        .render()
}

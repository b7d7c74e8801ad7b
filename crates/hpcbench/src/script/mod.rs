//! Rendering of jobs into Slurm batch scripts.

use crate::JobId;
use crate::common::manager::slurm::format_slurm_duration;
use crate::job::container::sidecar_command;
use crate::job::{JobCategory, JobCommands, JobModel};

const SHEBANG: &str = "#!/bin/bash -l";
const MODULE_LINES: [&str; 1] = ["module add Apptainer"];

/// Batch script as an ordered list of lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchScript {
    lines: Vec<String>,
}

impl BatchScript {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Values of all `#SBATCH` directives, e.g. `--nodes=1`.
    pub fn directives(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter_map(|line| line.strip_prefix("#SBATCH "))
    }

    pub fn render(&self) -> String {
        let mut script = String::new();
        for line in &self.lines {
            script.push_str(line);
            script.push('\n');
        }
        script
    }
}

/// Scheduler job name of a job, `<name>_<job_id>`.
pub fn job_name(name: &str, job_id: &JobId) -> String {
    format!("{name}_{job_id}")
}

/// Splits a scheduler job name created by [`job_name`] into the job name and its id.
///
/// Returns `None` for jobs that were not submitted by hpcbench.
pub fn parse_job_name(scheduler_name: &str) -> Option<(&str, JobId)> {
    let (name, id) = scheduler_name.rsplit_once('_')?;
    if name.is_empty() {
        return None;
    }
    Some((name, JobId::parse_generated(id)?))
}

fn directives(model: &JobModel, job_id: &JobId) -> Vec<String> {
    let spec = model.spec();
    let resources = spec.resources();
    let mut directives = vec![format!("--job-name={}", job_name(spec.name(), job_id))];

    let mut push = |name: &str, value: Option<String>| {
        if let Some(value) = value {
            directives.push(format!("--{name}={value}"));
        }
    };
    push("account", resources.account.clone());
    push("partition", resources.partition.clone());
    push("qos", resources.qos.clone());
    push("nodes", resources.nodes.map(|v| v.to_string()));
    push("ntasks", resources.ntasks.map(|v| v.to_string()));
    push(
        "ntasks-per-node",
        resources.ntasks_per_node.map(|v| v.to_string()),
    );
    push(
        "cpus-per-task",
        resources.cpus_per_task.map(|v| v.to_string()),
    );
    push("mem", resources.memory.clone());
    push(
        "time",
        resources.time_limit.as_ref().map(format_slurm_duration),
    );
    push("gres", resources.gres());
    if let Some(log_dir) = &resources.log_dir {
        let log_dir = log_dir.trim_end_matches('/');
        push("output", Some(format!("{log_dir}/{}_%j.out", spec.name())));
        push("error", Some(format!("{log_dir}/{}_%j.err", spec.name())));
    }
    directives
}

/// Generates the batch script of a job.
///
/// The output depends only on the model and the id, the same inputs always produce
/// the same script.
pub fn generate(model: &JobModel, job_id: &JobId) -> BatchScript {
    let mut lines = vec![SHEBANG.to_string()];
    lines.extend(
        directives(model, job_id)
            .into_iter()
            .map(|directive| format!("#SBATCH {directive}")),
    );

    lines.push(String::new());
    lines.extend(MODULE_LINES.iter().map(|line| line.to_string()));

    let setup = model.setup_commands();
    if !setup.is_empty() {
        lines.push(String::new());
        lines.extend(setup);
    }

    lines.push(String::new());
    lines.push(format!("{} &", model.container_command()));
    lines.push("MAIN_PID=$!".to_string());

    let checks = model.health_check_commands();
    if !checks.is_empty() {
        lines.push(String::new());
        lines.extend(checks);
    }

    if model.category() == JobCategory::Service {
        if let Some(sidecar) = model.spec().sidecar() {
            lines.push(String::new());
            lines.push(format!("{} &", sidecar_command(sidecar)));
            lines.push("SIDECAR_PID=$!".to_string());
        }
        lines.push(String::new());
        lines.push("wait $MAIN_PID".to_string());
    }

    BatchScript { lines }
}

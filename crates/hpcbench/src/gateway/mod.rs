//! Remote execution: running commands on the cluster login node and talking to the scheduler.

pub mod retry;
pub mod slurm;
pub mod ssh;

use std::cell::Cell;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

use crate::JobId;
use crate::common::error::HpcError;
use crate::common::idcounter::IdCounter;
use crate::common::utils::str::shell_quote;
use crate::script::{self, BatchScript};

pub use slurm::SlurmAdapter;

pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = crate::Result<T>> + 'a>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Shell session on a remote host.
pub trait RemoteShell {
    fn connect(&self) -> GatewayFuture<'_, ()>;

    fn disconnect(&self) -> GatewayFuture<'_, ()>;

    /// Runs a shell command. A non-zero exit code is not an error.
    fn execute<'a>(&'a self, command: &'a str) -> GatewayFuture<'a, CommandOutput>;

    fn upload<'a>(&'a self, content: &'a [u8], remote_path: &'a str) -> GatewayFuture<'a, ()>;

    fn download<'a>(&'a self, remote_path: &'a str) -> GatewayFuture<'a, Vec<u8>>;
}

/// Connects the shell, runs `f` and disconnects again, also when `f` fails.
pub async fn with_connection<'a, S, F, Fut, T>(shell: &'a S, f: F) -> crate::Result<T>
where
    S: RemoteShell + ?Sized,
    F: FnOnce(&'a S) -> Fut,
    Fut: Future<Output = crate::Result<T>> + 'a,
{
    shell.connect().await?;
    let result = f(shell).await;
    if let Err(error) = shell.disconnect().await {
        log::warn!("Cannot close remote connection: {error}");
    }
    result
}

/// State of a job as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Pending,
    Configuring,
    Requeued,
    Suspended,
    Running,
    Completing,
    Completed,
    Failed,
    Timeout,
    NodeFail,
    OutOfMemory,
    BootFail,
    Deadline,
    Preempted,
    Cancelled,
    /// A state without a lifecycle counterpart (e.g. `RESIZING`).
    Other(String),
    /// The scheduler did not report anything usable.
    Unknown,
}

impl Display for SchedulerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Other(state) => f.write_str(state),
            state => write!(f, "{state:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub state: SchedulerState,
    pub node: Option<String>,
    pub elapsed: Option<Duration>,
}

impl PollResult {
    pub fn unknown() -> Self {
        Self {
            state: SchedulerState::Unknown,
            node: None,
            elapsed: None,
        }
    }
}

/// Queued or running job of the current user.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedJob {
    pub scheduler_id: String,
    pub name: String,
    pub result: PollResult,
}

impl ListedJob {
    /// Id of a job submitted by hpcbench, taken from its scheduler job name.
    pub fn job_id(&self) -> Option<JobId> {
        script::parse_job_name(&self.name).map(|(_, job_id)| job_id)
    }
}

/// Submission, cancellation and status queries of batch jobs.
pub trait JobGateway {
    /// Submits the script and returns the scheduler job id.
    fn submit<'a>(&'a self, script: &'a BatchScript) -> GatewayFuture<'a, String>;

    /// Returns `false` when the scheduler reports that the job has already finished.
    fn cancel<'a>(&'a self, remote_id: &'a str) -> GatewayFuture<'a, bool>;

    fn poll<'a>(&'a self, remote_id: &'a str) -> GatewayFuture<'a, PollResult>;
}

/// Command lines and output formats of a particular batch scheduler.
pub trait SchedulerAdapter {
    fn submit_command(&self, script_path: &str) -> String;

    fn parse_submit_output(&self, stdout: &str) -> anyhow::Result<String>;

    fn cancel_command(&self, remote_id: &str) -> String;

    /// Cancellation failed because the job does not run anymore.
    fn is_already_finished(&self, stderr: &str) -> bool;

    fn status_command(&self, remote_id: &str) -> String;

    /// Query for jobs that have left the queue, if the scheduler keeps such records.
    fn history_command(&self, remote_id: &str) -> Option<String>;

    /// `Ok(None)` when the output does not mention the job.
    fn parse_status(&self, output: &str, remote_id: &str) -> anyhow::Result<Option<PollResult>>;

    /// Query for all queued and running jobs of the current user.
    fn list_command(&self) -> String;

    fn parse_list(&self, output: &str) -> anyhow::Result<Vec<ListedJob>>;
}

/// [`JobGateway`] that drives a scheduler through shell commands.
pub struct SchedulerGateway<S, A = SlurmAdapter> {
    shell: S,
    adapter: A,
    remote_tmp: String,
    use_history: bool,
    script_counter: Cell<IdCounter>,
}

impl<S: RemoteShell, A: SchedulerAdapter> SchedulerGateway<S, A> {
    pub fn new(shell: S, adapter: A, remote_tmp: impl Into<String>) -> Self {
        Self {
            shell,
            adapter,
            remote_tmp: remote_tmp.into(),
            use_history: true,
            script_counter: Cell::new(IdCounter::new(1)),
        }
    }

    pub fn with_history(mut self, enabled: bool) -> Self {
        self.use_history = enabled;
        self
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    fn next_script_path(&self) -> String {
        let mut counter = self.script_counter.get();
        let value = counter.increment();
        self.script_counter.set(counter);
        format!(
            "{}/hpcbench_{}_{value}.sh",
            self.remote_tmp.trim_end_matches('/'),
            std::process::id()
        )
    }

    async fn submit_script(&self, script: &BatchScript) -> crate::Result<String> {
        let path = self.next_script_path();
        if let Err(error) = self.shell.upload(script.render().as_bytes(), &path).await {
            let stderr = match error {
                HpcError::ConnectionError { message, .. } => message,
                error => error.to_string(),
            };
            return Err(HpcError::SubmissionError {
                message: format!("cannot upload batch script to {path}"),
                stderr,
            });
        }

        let command = self.adapter.submit_command(&path);
        log::debug!("Running remote command `{command}`");
        let output = self.shell.execute(&command).await;

        let cleanup = format!("rm -f {}", shell_quote(&path));
        match self.shell.execute(&cleanup).await {
            Ok(result) if !result.success() => {
                log::debug!("Cannot remove {path}: {}", result.stderr.trim())
            }
            Err(error) => log::debug!("Cannot remove {path}: {error}"),
            Ok(_) => {}
        }

        let output = output?;
        if !output.success() {
            return Err(HpcError::SubmissionError {
                message: format!("submission exited with code {}", output.exit_code),
                stderr: output.stderr,
            });
        }
        self.adapter
            .parse_submit_output(&output.stdout)
            .map_err(|error| HpcError::SubmissionError {
                message: error.to_string(),
                stderr: output.stderr,
            })
    }

    async fn cancel_job(&self, remote_id: &str) -> crate::Result<bool> {
        let command = self.adapter.cancel_command(remote_id);
        log::debug!("Running remote command `{command}`");
        let output = self.shell.execute(&command).await?;
        if self.adapter.is_already_finished(&output.stderr) {
            log::debug!("Job {remote_id} has already finished: {}", output.stderr.trim());
            return Ok(false);
        }
        if !output.success() {
            return Err(HpcError::CancellationError {
                remote_id: remote_id.to_string(),
                stderr: output.stderr,
            });
        }
        Ok(true)
    }

    /// Runs a status query, unusable output is logged and yields `None`.
    async fn query(&self, command: &str, remote_id: &str) -> crate::Result<Option<PollResult>> {
        log::debug!("Running remote command `{command}`");
        let output = self.shell.execute(command).await?;
        if !output.success() {
            log::debug!(
                "Status query of job {remote_id} exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
            return Ok(None);
        }
        match self.adapter.parse_status(&output.stdout, remote_id) {
            Ok(result) => Ok(result),
            Err(error) => {
                log::warn!("Cannot parse status of job {remote_id}: {error:?}");
                Ok(None)
            }
        }
    }

    async fn poll_job(&self, remote_id: &str) -> crate::Result<PollResult> {
        if let Some(result) = self
            .query(&self.adapter.status_command(remote_id), remote_id)
            .await?
        {
            return Ok(result);
        }
        if self.use_history {
            if let Some(command) = self.adapter.history_command(remote_id) {
                if let Some(result) = self.query(&command, remote_id).await? {
                    return Ok(result);
                }
            }
        }
        Ok(PollResult::unknown())
    }

    /// Queued and running jobs of the current user, including jobs of other tools.
    pub async fn list_jobs(&self) -> crate::Result<Vec<ListedJob>> {
        let command = self.adapter.list_command();
        log::debug!("Running remote command `{command}`");
        let output = self.shell.execute(&command).await?;
        if !output.success() {
            return Err(HpcError::GenericError(format!(
                "Listing of jobs exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        self.adapter
            .parse_list(&output.stdout)
            .map_err(|error| HpcError::ParseError(format!("{error:?}")))
    }
}

impl<S: RemoteShell, A: SchedulerAdapter> JobGateway for SchedulerGateway<S, A> {
    fn submit<'a>(&'a self, script: &'a BatchScript) -> GatewayFuture<'a, String> {
        Box::pin(self.submit_script(script))
    }

    fn cancel<'a>(&'a self, remote_id: &'a str) -> GatewayFuture<'a, bool> {
        Box::pin(self.cancel_job(remote_id))
    }

    fn poll<'a>(&'a self, remote_id: &'a str) -> GatewayFuture<'a, PollResult> {
        Box::pin(self.poll_job(remote_id))
    }
}

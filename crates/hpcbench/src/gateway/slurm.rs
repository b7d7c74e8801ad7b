use crate::common::manager::slurm::{
    SlurmJobRow, parse_job_list, parse_job_table, parse_sbatch_output,
};
use crate::common::utils::str::shell_quote;
use crate::gateway::{ListedJob, PollResult, SchedulerAdapter, SchedulerState};

/// Columns of `squeue` that match the `sacct` listing.
const SQUEUE_FORMAT: &str = "'%i|%j|%T|%M|%N'";

/// Maps a Slurm job state (`%T` of squeue, `State` of sacct) to [`SchedulerState`].
pub fn parse_slurm_state(state: &str) -> SchedulerState {
    let state = state.trim();
    // sacct reports e.g. `CANCELLED by 1000`
    let name = state.split_whitespace().next().unwrap_or_default();
    match name.trim_end_matches('+') {
        "PENDING" => SchedulerState::Pending,
        "CONFIGURING" => SchedulerState::Configuring,
        "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => SchedulerState::Requeued,
        "SUSPENDED" => SchedulerState::Suspended,
        "RUNNING" => SchedulerState::Running,
        "COMPLETING" => SchedulerState::Completing,
        "COMPLETED" => SchedulerState::Completed,
        "FAILED" => SchedulerState::Failed,
        "TIMEOUT" => SchedulerState::Timeout,
        "NODE_FAIL" => SchedulerState::NodeFail,
        "OUT_OF_MEMORY" => SchedulerState::OutOfMemory,
        "BOOT_FAIL" => SchedulerState::BootFail,
        "DEADLINE" => SchedulerState::Deadline,
        "PREEMPTED" => SchedulerState::Preempted,
        "CANCELLED" => SchedulerState::Cancelled,
        "" => SchedulerState::Unknown,
        _ => SchedulerState::Other(state.to_string()),
    }
}

fn row_to_poll_result(row: SlurmJobRow) -> PollResult {
    PollResult {
        state: parse_slurm_state(&row.state),
        node: row.node,
        elapsed: row.elapsed,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmAdapter;

impl SchedulerAdapter for SlurmAdapter {
    fn submit_command(&self, script_path: &str) -> String {
        format!("sbatch {}", shell_quote(script_path))
    }

    fn parse_submit_output(&self, stdout: &str) -> anyhow::Result<String> {
        parse_sbatch_output(stdout)
    }

    fn cancel_command(&self, remote_id: &str) -> String {
        format!("scancel {}", shell_quote(remote_id))
    }

    fn is_already_finished(&self, stderr: &str) -> bool {
        let stderr = stderr.to_lowercase();
        stderr.contains("already completing or completed")
            || stderr.contains("already completed")
            || stderr.contains("invalid job id")
    }

    fn status_command(&self, remote_id: &str) -> String {
        format!(
            "squeue -h -j {} -o {SQUEUE_FORMAT}",
            shell_quote(remote_id)
        )
    }

    fn history_command(&self, remote_id: &str) -> Option<String> {
        Some(format!(
            "sacct -n -P -X -j {} -o JobID,JobName,State,Elapsed,NodeList",
            shell_quote(remote_id)
        ))
    }

    fn parse_status(&self, output: &str, remote_id: &str) -> anyhow::Result<Option<PollResult>> {
        Ok(parse_job_table(output, remote_id)?.map(row_to_poll_result))
    }

    fn list_command(&self) -> String {
        format!("squeue -u $USER -h -o {SQUEUE_FORMAT}")
    }

    fn parse_list(&self, output: &str) -> anyhow::Result<Vec<ListedJob>> {
        Ok(parse_job_list(output)?
            .into_iter()
            .map(|row| ListedJob {
                scheduler_id: row.job_id.clone(),
                name: row.name.clone(),
                result: row_to_poll_result(row),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SlurmAdapter, parse_slurm_state};
    use crate::gateway::{SchedulerAdapter, SchedulerState};

    #[test]
    fn test_parse_states() {
        assert_eq!(parse_slurm_state("PENDING"), SchedulerState::Pending);
        assert_eq!(parse_slurm_state("RUNNING"), SchedulerState::Running);
        assert_eq!(parse_slurm_state("COMPLETING"), SchedulerState::Completing);
        assert_eq!(parse_slurm_state("OUT_OF_MEMORY"), SchedulerState::OutOfMemory);
        assert_eq!(parse_slurm_state("NODE_FAIL"), SchedulerState::NodeFail);
        assert_eq!(
            parse_slurm_state("CANCELLED by 12345"),
            SchedulerState::Cancelled
        );
        assert_eq!(parse_slurm_state("CANCELLED+"), SchedulerState::Cancelled);
        assert_eq!(
            parse_slurm_state("RESIZING"),
            SchedulerState::Other("RESIZING".to_string())
        );
        assert_eq!(parse_slurm_state(" "), SchedulerState::Unknown);
    }

    #[test]
    fn test_commands() {
        let adapter = SlurmAdapter;
        assert_eq!(adapter.submit_command("/tmp/a.sh"), "sbatch /tmp/a.sh");
        assert_eq!(adapter.cancel_command("12"), "scancel 12");
        assert_eq!(
            adapter.status_command("12"),
            "squeue -h -j 12 -o '%i|%j|%T|%M|%N'"
        );
        assert_eq!(
            adapter.history_command("12").unwrap(),
            "sacct -n -P -X -j 12 -o JobID,JobName,State,Elapsed,NodeList"
        );
    }

    #[test]
    fn test_parse_status() {
        let result = SlurmAdapter
            .parse_status("12|llm|PENDING|0:00|\n", "12")
            .unwrap()
            .unwrap();
        assert_eq!(result.state, SchedulerState::Pending);
        assert_eq!(result.node, None);
        assert_eq!(result.elapsed, Some(Duration::ZERO));

        assert_eq!(SlurmAdapter.parse_status("", "12").unwrap(), None);
        assert_eq!(
            SlurmAdapter
                .parse_status("11|other|RUNNING|1:00|n1\n", "12")
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_list() {
        let adapter = SlurmAdapter;
        assert_eq!(
            adapter.list_command(),
            "squeue -u $USER -h -o '%i|%j|%T|%M|%N'"
        );
        let jobs = adapter
            .parse_list("7|kv_a1b2c30002|CONFIGURING|0:03|n[1-2]\n8|bench_a1b2c30003|PENDING|0:00|\n")
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].scheduler_id, "7");
        assert_eq!(jobs[0].name, "kv_a1b2c30002");
        assert_eq!(jobs[0].result.state, SchedulerState::Configuring);
        assert_eq!(jobs[0].result.node.as_deref(), Some("n1"));
        assert_eq!(jobs[1].result.elapsed, Some(Duration::ZERO));
        assert!(adapter.parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_already_finished() {
        let adapter = SlurmAdapter;
        assert!(adapter.is_already_finished("scancel: error: Invalid job id specified"));
        assert!(!adapter.is_already_finished("scancel: error: Access/permission denied"));
        assert!(!adapter.is_already_finished(""));
    }
}

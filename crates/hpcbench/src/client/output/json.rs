use serde_json::{Value, json};

use crate::client::output::outputs::{Output, SchedulerJobStatus};
use crate::job::JobCategory;
use crate::script::BatchScript;
use crate::session::SessionRecord;
use crate::tracker::JobRecord;

#[derive(Default)]
pub struct JsonOutput;

impl JsonOutput {
    fn print(&self, data: Value) {
        println!(
            "{}",
            serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string())
        );
    }
}

impl Output for JsonOutput {
    fn print_session(&self, session: &SessionRecord, jobs: &[JobRecord]) {
        self.print(format_session(session, jobs, false));
    }

    fn print_session_aborted(&self, session: &SessionRecord, jobs: &[JobRecord]) {
        self.print(format_session(session, jobs, true));
    }

    fn print_scheduler_status(&self, jobs: &[SchedulerJobStatus]) {
        self.print(
            jobs.iter()
                .map(|job| {
                    json!({
                        "scheduler_id": job.scheduler_id,
                        "name": job.name,
                        "id": job.job_id,
                        "state": job.result.state.to_string(),
                        "node": job.result.node,
                        "elapsed": job.result.elapsed.map(|d| d.as_secs_f64()),
                    })
                })
                .collect(),
        );
    }

    fn print_cancel_result(&self, results: &[(String, bool)]) {
        self.print(
            results
                .iter()
                .map(|(scheduler_id, cancelled)| {
                    json!({"scheduler_id": scheduler_id, "cancelled": cancelled})
                })
                .collect(),
        );
    }

    fn print_scripts(&self, scripts: &[(String, BatchScript)]) {
        self.print(
            scripts
                .iter()
                .map(|(stage, script)| json!({"stage": stage, "script": script.render()}))
                .collect(),
        );
    }

    fn print_job_types(&self, types: &[(&str, JobCategory)]) {
        self.print(
            types
                .iter()
                .map(|(tag, category)| json!({"type": tag, "category": category}))
                .collect(),
        );
    }

    fn print_error(&self, error: anyhow::Error) {
        self.print(json!({ "error": format!("{error:?}") }));
    }
}

fn format_job(job: &JobRecord) -> Value {
    let JobRecord {
        job_id,
        name,
        category,
        scheduler_id,
        status,
        node,
        elapsed,
        primary_port: _,
        sidecar_port: _,
        submitted_at,
        started_at,
        completed_at,
    } = job;
    json!({
        "id": job_id,
        "name": name,
        "category": category,
        "scheduler_id": scheduler_id,
        "status": status.to_string(),
        "node": node,
        "elapsed": elapsed.map(|d| d.as_secs_f64()),
        "submitted_at": submitted_at,
        "started_at": started_at,
        "completed_at": completed_at,
    })
}

fn format_session(session: &SessionRecord, jobs: &[JobRecord], aborted: bool) -> Value {
    json!({
        "aborted": aborted,
        "stages": session.stages,
        "edges": session.edges,
        "injected": session.injected,
        "jobs": jobs.iter().map(format_job).collect::<Vec<_>>(),
    })
}

use std::time::Duration;

use chrono::{DateTime, Local, SubsecRound, Utc};
use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};
use colored::Colorize;

use crate::client::output::outputs::{Output, SchedulerJobStatus};
use crate::common::utils::str::pluralize;
use crate::gateway::SchedulerState;
use crate::job::JobCategory;
use crate::script::BatchScript;
use crate::session::SessionRecord;
use crate::tracker::{JobRecord, JobStatus};

pub struct CliOutput {
    color_policy: ColorChoice,
}

impl CliOutput {
    pub fn new(color_policy: ColorChoice) -> CliOutput {
        CliOutput { color_policy }
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {e:?}");
        }
    }

    fn print_job_table(&self, session: &SessionRecord, jobs: &[JobRecord]) {
        let rows: Vec<_> = session
            .stages
            .iter()
            .zip(jobs)
            .map(|(stage, job)| {
                vec![
                    stage.stage.as_str().cell(),
                    job.job_id.as_str().cell(),
                    job.name.as_str().cell(),
                    job.category.cell(),
                    job.scheduler_id
                        .as_deref()
                        .unwrap_or_default()
                        .cell()
                        .justify(Justify::Right),
                    status_to_cell(job.status),
                    job.node.as_deref().unwrap_or_default().cell(),
                    job.elapsed.map(format_elapsed).unwrap_or_default().cell(),
                    job.submitted_at.map(format_datetime).unwrap_or_default().cell(),
                ]
            })
            .collect();
        let header = vec![
            "Stage".cell().bold(true),
            "ID".cell().bold(true),
            "Name".cell().bold(true),
            "Category".cell().bold(true),
            "Slurm ID".cell().bold(true),
            "State".cell().bold(true),
            "Node".cell().bold(true),
            "Elapsed".cell().bold(true),
            "Submitted".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);

        for injected in &session.injected {
            println!(
                "{} {} -> {} ({:?})",
                "Endpoint".bold(),
                injected.dependency,
                injected.stage,
                injected.inject
            );
            println!("  {}", injected.endpoint.to_string().cyan());
        }
    }
}

impl Output for CliOutput {
    fn print_session(&self, session: &SessionRecord, jobs: &[JobRecord]) {
        self.print_job_table(session, jobs);
        println!(
            "Session started {} {}",
            session.stages.len(),
            pluralize("job", session.stages.len())
        );
    }

    fn print_session_aborted(&self, session: &SessionRecord, jobs: &[JobRecord]) {
        if session.stages.is_empty() {
            eprintln!("{}", "No job was submitted".yellow());
            return;
        }
        self.print_job_table(session, jobs);
        eprintln!(
            "{}",
            format!(
                "The session was aborted, {} already submitted {} {} left running",
                session.stages.len(),
                pluralize("job", session.stages.len()),
                if session.stages.len() == 1 { "is" } else { "are" }
            )
            .yellow()
        );
    }

    fn print_scheduler_status(&self, jobs: &[SchedulerJobStatus]) {
        let rows: Vec<_> = jobs
            .iter()
            .map(|job| {
                vec![
                    job.scheduler_id.as_str().cell().justify(Justify::Right),
                    job.name.as_deref().unwrap_or_default().cell(),
                    job.job_id
                        .as_ref()
                        .map(|id| id.to_string())
                        .unwrap_or_default()
                        .cell(),
                    scheduler_state_to_cell(&job.result.state),
                    job.result.node.as_deref().unwrap_or_default().cell(),
                    job.result
                        .elapsed
                        .map(format_elapsed)
                        .unwrap_or_default()
                        .cell(),
                ]
            })
            .collect();
        let header = vec![
            "Slurm ID".cell().bold(true),
            "Name".cell().bold(true),
            "ID".cell().bold(true),
            "State".cell().bold(true),
            "Node".cell().bold(true),
            "Elapsed".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }

    fn print_cancel_result(&self, results: &[(String, bool)]) {
        for (scheduler_id, cancelled) in results {
            if *cancelled {
                println!("Job {scheduler_id} {}", "cancelled".green());
            } else {
                println!("Job {scheduler_id} {}", "has already finished".yellow());
            }
        }
    }

    fn print_scripts(&self, scripts: &[(String, BatchScript)]) {
        for (index, (stage, script)) in scripts.iter().enumerate() {
            if index > 0 {
                println!();
            }
            println!("{}", format!("# Stage `{stage}`").bold());
            print!("{}", script.render());
        }
    }

    fn print_job_types(&self, types: &[(&str, JobCategory)]) {
        let rows: Vec<_> = types
            .iter()
            .map(|(tag, category)| vec![tag.cell(), category.cell()])
            .collect();
        let header = vec!["Type".cell().bold(true), "Category".cell().bold(true)];
        self.print_horizontal_table(rows, header);
    }

    fn print_error(&self, error: anyhow::Error) {
        eprintln!("{}", format!("{error:?}").red());
    }
}

fn status_to_cell(status: JobStatus) -> CellStruct {
    let color = match status {
        JobStatus::Created | JobStatus::Submitted => Color::White,
        JobStatus::Pending => Color::Cyan,
        JobStatus::Running => Color::Yellow,
        JobStatus::Completed => Color::Green,
        JobStatus::Failed => Color::Red,
        JobStatus::Cancelled => Color::Magenta,
    };
    status.cell().foreground_color(Some(color))
}

fn scheduler_state_to_cell(state: &SchedulerState) -> CellStruct {
    let color = match state {
        SchedulerState::Running | SchedulerState::Completing => Some(Color::Yellow),
        SchedulerState::Completed => Some(Color::Green),
        SchedulerState::Cancelled => Some(Color::Magenta),
        SchedulerState::Pending | SchedulerState::Configuring | SchedulerState::Requeued => {
            Some(Color::Cyan)
        }
        SchedulerState::Suspended | SchedulerState::Other(_) | SchedulerState::Unknown => None,
        _ => Some(Color::Red),
    };
    state.to_string().cell().foreground_color(color)
}

fn format_elapsed(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}

fn format_datetime(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .round_subsecs(0)
        .format("%d.%m.%Y %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::format_elapsed;

    #[test]
    fn test_format_elapsed_drops_subseconds() {
        assert_eq!(format_elapsed(Duration::from_millis(61_500)), "1m 1s");
        assert_eq!(format_elapsed(Duration::ZERO), "0s");
    }
}

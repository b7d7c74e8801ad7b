use anyhow::{Context, anyhow};

use crate::client::globalsettings::GlobalSettings;
use crate::client::output::outputs::SchedulerJobStatus;
use crate::client::recipe::Recipe;
use crate::common::cli::{CancelOpts, DownloadOpts, RunOpts, ScriptOpts, StatusOpts};
use crate::common::config::OrchestratorConfig;
use crate::gateway::ssh::SshShell;
use crate::gateway::{JobGateway, RemoteShell, SchedulerGateway, SlurmAdapter, with_connection};
use crate::registry;
use crate::session::{SessionCoordinator, SessionRecord};
use crate::tracker::JobRecord;

fn create_gateway(config: &OrchestratorConfig) -> anyhow::Result<SchedulerGateway<SshShell>> {
    let shell = SshShell::new(config.ssh.clone())?;
    Ok(
        SchedulerGateway::new(shell, SlurmAdapter, config.gateway.remote_tmp.clone())
            .with_history(config.gateway.sacct_fallback),
    )
}

pub async fn command_run(gsettings: &GlobalSettings, opts: RunOpts) -> anyhow::Result<()> {
    let config = gsettings.config();
    let registry = registry::global();
    let pipeline = Recipe::load(&opts.recipe)?.into_pipeline(config, registry)?;
    let gateway = create_gateway(config)?;
    let gateway_ref = &gateway;
    let pipeline = &pipeline;

    with_connection(gateway.shell(), |_| async move {
        let mut coordinator = SessionCoordinator::new(
            registry,
            gateway_ref,
            config.tracker.retention,
            config.session.clone(),
        )
        .with_poll_retry(config.ssh.retry.clone());
        match coordinator.run(&pipeline).await {
            Ok(session) => {
                let jobs = coordinator.refresh(&session).await?;
                gsettings.printer().print_session(&session, &jobs);
                Ok(())
            }
            Err(aborted) => {
                let jobs = snapshot(&coordinator, &aborted.record);
                gsettings
                    .printer()
                    .print_session_aborted(&aborted.record, &jobs);
                if opts.cancel_on_error {
                    for outcome in coordinator.stop(&aborted.record).await {
                        if let Ok(cancelled) = outcome.result {
                            log::info!(
                                "Job {} of stage `{}`: {}",
                                outcome.job_id,
                                outcome.stage,
                                if cancelled { "cancelled" } else { "already finished" }
                            );
                        }
                    }
                }
                Err(aborted.error)
            }
        }
    })
    .await?;
    Ok(())
}

/// Local records of the session jobs, without asking the scheduler.
fn snapshot(coordinator: &SessionCoordinator<'_>, session: &SessionRecord) -> Vec<JobRecord> {
    session
        .stages
        .iter()
        .filter_map(|started| {
            coordinator
                .tracker(started.category)
                .record(&started.job_id)
                .ok()
                .cloned()
        })
        .collect()
}

pub fn command_script(gsettings: &GlobalSettings, opts: ScriptOpts) -> anyhow::Result<()> {
    let registry = registry::global();
    let pipeline = Recipe::load(&opts.recipe)?.into_pipeline(gsettings.config(), registry)?;
    let mut scripts = pipeline.render_scripts(registry)?;
    if let Some(stage) = &opts.stage {
        scripts.retain(|(name, _)| name == stage);
        if scripts.is_empty() {
            return Err(anyhow!("Recipe has no stage `{stage}`"));
        }
    }
    gsettings.printer().print_scripts(&scripts);
    Ok(())
}

pub async fn command_status(gsettings: &GlobalSettings, opts: StatusOpts) -> anyhow::Result<()> {
    let gateway = create_gateway(gsettings.config())?;
    let gateway_ref = &gateway;
    let jobs = with_connection(gateway.shell(), |_| async move {
        if opts.scheduler_ids.is_empty() {
            let jobs: Vec<SchedulerJobStatus> = gateway_ref
                .list_jobs()
                .await?
                .into_iter()
                .map(SchedulerJobStatus::from)
                .collect();
            return Ok(jobs);
        }
        let mut jobs = Vec::with_capacity(opts.scheduler_ids.len());
        for scheduler_id in &opts.scheduler_ids {
            let result = gateway_ref.poll(scheduler_id).await?;
            jobs.push(SchedulerJobStatus::polled(scheduler_id.clone(), result));
        }
        Ok(jobs)
    })
    .await?;
    gsettings.printer().print_scheduler_status(&jobs);
    Ok(())
}

pub async fn command_cancel(gsettings: &GlobalSettings, opts: CancelOpts) -> anyhow::Result<()> {
    let gateway = create_gateway(gsettings.config())?;
    let gateway_ref = &gateway;
    let results = with_connection(gateway.shell(), |_| async move {
        let scheduler_ids: Vec<String> = if opts.all {
            gateway_ref
                .list_jobs()
                .await?
                .into_iter()
                .filter(|job| job.job_id().is_some())
                .map(|job| job.scheduler_id)
                .collect()
        } else {
            opts.scheduler_ids
        };
        if scheduler_ids.is_empty() {
            log::info!("No hpcbench jobs to cancel");
        }
        let mut results = Vec::with_capacity(scheduler_ids.len());
        for scheduler_id in scheduler_ids {
            let cancelled = gateway_ref.cancel(&scheduler_id).await?;
            results.push((scheduler_id, cancelled));
        }
        Ok(results)
    })
    .await?;
    gsettings.printer().print_cancel_result(&results);
    Ok(())
}

pub async fn command_download(
    gsettings: &GlobalSettings,
    opts: DownloadOpts,
) -> anyhow::Result<()> {
    let gateway = create_gateway(gsettings.config())?;
    let content = with_connection(gateway.shell(), |shell| shell.download(&opts.remote_path))
        .await
        .with_context(|| format!("Cannot download {}", opts.remote_path))?;
    std::fs::write(&opts.output, &content)
        .with_context(|| format!("Cannot write {}", opts.output.display()))?;
    log::info!(
        "Downloaded {} ({} bytes) to {}",
        opts.remote_path,
        content.len(),
        opts.output.display()
    );
    Ok(())
}

pub fn command_types(gsettings: &GlobalSettings) -> anyhow::Result<()> {
    let registry = registry::global();
    let types: Vec<_> = registry
        .tags(None)
        .into_iter()
        .filter_map(|tag| registry.category(tag).map(|category| (tag, category)))
        .collect();
    gsettings.printer().print_job_types(&types);
    Ok(())
}

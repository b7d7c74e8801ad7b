//! Recipe documents: TOML descriptions of benchmark pipelines.
//!
//! ```toml
//! [[stage]]
//! name = "service"
//! tag = "ollama"
//! image = "ollama.sif"
//! [stage.resources]
//! gpus = 1
//! time_limit = "2h"
//! [stage.sidecar]
//! port = 8080
//!
//! [[stage]]
//! name = "client"
//! tag = "ollama-benchmark"
//! image = "benchmark.sif"
//! parameters = { model = "llama3", num_requests = 100 }
//! [[stage.needs]]
//! stage = "service"
//! inject = { parameter = "endpoint" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, anyhow};
use serde::Deserialize;

use crate::common::config::OrchestratorConfig;
use crate::job::{JobCategory, JobSpec, ParamValue, ResourceRequest, SidecarSpec};
use crate::registry::JobRegistry;
use crate::session::{Need, Pipeline, Stage, WaitPolicy};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub name: String,
    /// Name of the job, the stage name is used when missing.
    pub job_name: Option<String>,
    /// Derived from the registered tag when missing.
    pub category: Option<JobCategory>,
    pub tag: String,
    pub image: String,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    pub sidecar: Option<SidecarDef>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    pub build_source: Option<String>,
    #[serde(default)]
    pub force_rebuild: bool,
    pub wait: Option<WaitPolicy>,
    #[serde(default)]
    pub needs: Vec<Need>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SidecarDef {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub image: Option<String>,
}

impl Recipe {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let recipe: Recipe = toml::from_str(text)?;
        if recipe.stages.is_empty() {
            return Err(anyhow!("Recipe does not contain any `[[stage]]`"));
        }
        Ok(recipe)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read recipe {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid recipe {}", path.display()))
    }

    /// Builds the pipeline, filling in defaults from the configuration.
    pub fn into_pipeline(
        self,
        config: &OrchestratorConfig,
        registry: &JobRegistry,
    ) -> anyhow::Result<Pipeline> {
        let mut pipeline = Pipeline::default();
        for stage in self.stages {
            let name = stage.name.clone();
            pipeline.push(
                stage
                    .into_stage(config, registry)
                    .with_context(|| format!("Invalid stage `{name}`"))?,
            );
        }
        pipeline.validate()?;
        Ok(pipeline)
    }
}

impl StageDef {
    fn into_stage(
        self,
        config: &OrchestratorConfig,
        registry: &JobRegistry,
    ) -> anyhow::Result<Stage> {
        let registered = registry.category(&self.tag).ok_or_else(|| {
            anyhow!(
                "Unknown job type `{}`, available types: {}",
                self.tag,
                registry.tags(None).join(", ")
            )
        })?;
        let category = self.category.unwrap_or(registered);
        if category != registered {
            return Err(anyhow!(
                "`{}` is a {registered} job, but the stage is declared as {category}",
                self.tag
            ));
        }

        let containers = &config.containers;
        let job_name = self.job_name.unwrap_or_else(|| self.name.clone());
        let mut spec = JobSpec::new(
            job_name,
            self.tag,
            resolve_image(&containers.image_dir, &self.image),
        )
        .with_resources(apply_slurm_defaults(self.resources, config))
        .with_ports(self.ports);

        if let Some(command) = self.command {
            spec = spec.with_command(command, self.args);
        }
        if let Some(source) = self.build_source {
            spec = spec.with_build_source(source, self.force_rebuild);
        }
        if let Some(sidecar) = self.sidecar {
            let defaults = SidecarSpec::default();
            let image = sidecar
                .image
                .unwrap_or_else(|| containers.sidecar_image.clone());
            spec = spec.with_sidecar(SidecarSpec {
                enabled: sidecar.enabled.unwrap_or(defaults.enabled),
                port: sidecar.port.unwrap_or(defaults.port),
                image: resolve_image(&containers.image_dir, &image),
            });
        }
        for (key, value) in self.environment {
            spec = spec.with_environment(key, value);
        }
        for (key, value) in self.parameters {
            spec = spec.with_parameter(key, value);
        }
        if category == JobCategory::Client {
            spec = spec
                .with_default_parameter("scripts_dir", containers.scripts_dir.as_str())
                .with_default_parameter("results_dir", containers.results_dir.as_str());
        }

        Ok(Stage {
            name: self.name,
            category,
            spec,
            needs: self.needs,
            wait: self.wait,
        })
    }
}

/// Bare image names are looked up in the image directory, paths and URIs are kept.
fn resolve_image(image_dir: &str, image: &str) -> String {
    let is_reference = image.starts_with('$') || image.contains('/');
    if is_reference || image_dir.is_empty() {
        image.to_string()
    } else {
        format!("{}/{image}", image_dir.trim_end_matches('/'))
    }
}

fn apply_slurm_defaults(
    mut resources: ResourceRequest,
    config: &OrchestratorConfig,
) -> ResourceRequest {
    let defaults = &config.slurm;
    if resources.account.is_none() {
        resources.account.clone_from(&defaults.account);
    }
    if resources.partition.is_none() {
        resources.partition.clone_from(&defaults.partition);
    }
    if resources.qos.is_none() {
        resources.qos.clone_from(&defaults.qos);
    }
    if resources.time_limit.is_none() {
        resources.time_limit = defaults.time_limit;
    }
    if resources.log_dir.is_none() {
        resources.log_dir.clone_from(&defaults.log_dir);
    }
    resources
}

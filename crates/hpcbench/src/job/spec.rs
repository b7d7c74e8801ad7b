use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::config::deserialize_human_duration_opt;

pub const DEFAULT_SIDECAR_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCategory {
    /// Long-running job that exposes ports.
    Service,
    /// Finite workload, usually driving a service.
    Client,
}

impl Display for JobCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobCategory::Service => "service",
            JobCategory::Client => "client",
        })
    }
}

/// Value of a technology-specific parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Scalars are treated as a single-item list.
    pub fn items(&self) -> Vec<&ParamValue> {
        match self {
            ParamValue::List(values) => values.iter().collect(),
            value => vec![value],
        }
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{value}"),
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Float(value) => write!(f, "{value}"),
            ParamValue::String(value) => f.write_str(value),
            ParamValue::List(values) => {
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Resources requested from the scheduler. Only fields that are set are rendered.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceRequest {
    pub nodes: Option<u32>,
    pub ntasks: Option<u32>,
    pub ntasks_per_node: Option<u32>,
    pub cpus_per_task: Option<u32>,
    pub memory: Option<String>,
    #[serde(deserialize_with = "deserialize_human_duration_opt")]
    pub time_limit: Option<Duration>,
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub account: Option<String>,
    pub gpus: Option<u32>,
    /// Explicit generic resource string, takes precedence over `gpus`.
    pub gres: Option<String>,
    pub log_dir: Option<String>,
}

impl ResourceRequest {
    /// The `--gres` value, if any.
    pub fn gres(&self) -> Option<String> {
        match (&self.gres, self.gpus) {
            (Some(gres), _) if !gres.is_empty() => Some(gres.clone()),
            (_, Some(gpus)) if gpus > 0 => Some(format!("gpu:{gpus}")),
            _ => None,
        }
    }

    pub fn uses_gpu(&self) -> bool {
        self.gres().is_some_and(|gres| gres.starts_with("gpu"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SidecarSpec {
    pub enabled: bool,
    pub port: u16,
    pub image: String,
}

impl Default for SidecarSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_SIDECAR_PORT,
            image: "cadvisor.sif".to_string(),
        }
    }
}

/// Reachable address of a running job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{self}")
    }

    /// Parses `host:port` with an optional `scheme://` prefix and trailing path.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.split_once("://").map(|(_, rest)| rest).unwrap_or(value);
        let value = value.split('/').next().unwrap_or_default();
        let (host, port) = value.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }
}

impl Display for ServiceEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Abstract description of a job, independent of the scheduler.
///
/// Specs are never modified in place, the `with_*` methods consume the spec and return
/// the derived one.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    name: String,
    tag: String,
    image: String,
    resources: ResourceRequest,
    environment: BTreeMap<String, String>,
    ports: Vec<u16>,
    sidecar: Option<SidecarSpec>,
    command: Option<String>,
    args: Vec<String>,
    parameters: BTreeMap<String, ParamValue>,
    build_source: Option<String>,
    force_rebuild: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, tag: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            image: image.into(),
            resources: Default::default(),
            environment: Default::default(),
            ports: Default::default(),
            sidecar: None,
            command: None,
            args: Default::default(),
            parameters: Default::default(),
            build_source: None,
            force_rebuild: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn resources(&self) -> &ResourceRequest {
        &self.resources
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Sidecar monitoring, `None` when it is not configured or disabled.
    pub fn sidecar(&self) -> Option<&SidecarSpec> {
        self.sidecar.as_ref().filter(|sidecar| sidecar.enabled)
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    /// String value of a parameter, empty strings are treated as missing.
    pub fn str_parameter(&self, key: &str) -> Option<&str> {
        self.parameter(key)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn build_source(&self) -> Option<&str> {
        self.build_source.as_deref()
    }

    pub fn force_rebuild(&self) -> bool {
        self.force_rebuild
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_sidecar(mut self, sidecar: SidecarSpec) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(command.into());
        self.args = args;
        self
    }

    pub fn with_build_source(mut self, source: impl Into<String>, force_rebuild: bool) -> Self {
        self.build_source = Some(source.into());
        self.force_rebuild = force_rebuild;
        self
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Sets the parameter only if it is not present yet.
    pub fn with_default_parameter(self, key: &str, value: impl Into<ParamValue>) -> Self {
        if self.parameters.contains_key(key) {
            self
        } else {
            self.with_parameter(key, value)
        }
    }

    /// Appends a `job=host:port` entry to the `scrape_targets` parameter.
    pub fn with_scrape_target(mut self, job: &str, endpoint: &ServiceEndpoint) -> Self {
        let target = ParamValue::String(format!("{job}={endpoint}"));
        let targets = match self.parameters.remove(SCRAPE_TARGETS) {
            Some(ParamValue::List(mut items)) => {
                items.push(target);
                items
            }
            Some(value) => vec![value, target],
            None => vec![target],
        };
        self.parameters
            .insert(SCRAPE_TARGETS.to_string(), ParamValue::List(targets));
        self
    }
}

pub const SCRAPE_TARGETS: &str = "scrape_targets";

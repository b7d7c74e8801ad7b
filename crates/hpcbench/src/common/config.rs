use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::common::utils::time::parse_hms_or_human_time;
use crate::gateway::retry::RetryPolicy;
use crate::session::wait::WaitPolicy;

pub const DEFAULT_SSH_PORT: u16 = 8822;

/// Orchestrator configuration, loaded from a TOML file.
///
/// Every section is optional, missing values fall back to defaults.
/// Some timing values can be overridden by `HPCBENCH_*_MS` environment variables,
/// see [`OrchestratorConfig::apply_env_overrides`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub ssh: SshConfig,
    pub slurm: SlurmDefaults,
    pub containers: ContainerConfig,
    pub session: WaitPolicy,
    pub tracker: TrackerConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// Directory of the control master socket. A temporary directory is used when unset.
    pub control_dir: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: None,
            port: DEFAULT_SSH_PORT,
            identity_file: None,
            control_dir: None,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl SshConfig {
    /// `user@host`, or just `host` when no user is configured.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Resource defaults applied to every stage that does not set them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlurmDefaults {
    pub account: Option<String>,
    pub partition: Option<String>,
    pub qos: Option<String>,
    #[serde(deserialize_with = "deserialize_human_duration_opt")]
    pub time_limit: Option<Duration>,
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Directory with `.sif` images, relative image paths are resolved against it.
    pub image_dir: String,
    /// Directory with benchmark scripts, mounted into client containers.
    pub scripts_dir: String,
    /// Directory where clients copy their result files.
    pub results_dir: String,
    pub sidecar_image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image_dir: "$HOME/containers".to_string(),
            scripts_dir: "$HOME/benchmark_scripts".to_string(),
            results_dir: "$SLURM_SUBMIT_DIR/results".to_string(),
            sidecar_image: "cadvisor.sif".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// How long are terminal records kept before they are evicted.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub retention: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Remote directory for uploaded batch scripts.
    pub remote_tmp: String,
    /// Ask `sacct` about jobs that already left the `squeue` listing.
    pub sacct_fallback: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            remote_tmp: "/tmp".to_string(),
            sacct_fallback: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn parse(text: &str) -> crate::Result<Self> {
        let mut config: OrchestratorConfig = toml::from_str(text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads the configuration from `path`, or returns the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => {
                log::debug!("Loading configuration from {}", path.display());
                let text = std::fs::read_to_string(path)?;
                Self::parse(&text)
            }
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(interval) = get_duration_from_env("HPCBENCH_POLL_INTERVAL_MS") {
            self.session.interval = interval;
        }
        if let Some(retention) = get_duration_from_env("HPCBENCH_RETENTION_MS") {
            self.tracker.retention = retention;
        }
        if let Some(delay) = get_duration_from_env("HPCBENCH_RETRY_DELAY_MS") {
            self.ssh.retry.initial_delay = delay;
        }
    }
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

pub(crate) fn deserialize_human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    parse_hms_or_human_time(&buf).map_err(serde::de::Error::custom)
}

pub(crate) fn deserialize_human_duration_opt<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = Option::<String>::deserialize(deserializer)?;

    if let Some(b) = buf {
        parse_hms_or_human_time(&b)
            .map(Some)
            .map_err(serde::de::Error::custom)
    } else {
        Ok(None)
    }
}

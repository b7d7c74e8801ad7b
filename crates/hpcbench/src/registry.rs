//! Mapping of technology tags to job constructors.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::common::error::HpcError;
use crate::job::{JobCategory, JobModel, JobSpec, client, service};

pub type JobConstructor = fn(JobSpec) -> crate::Result<JobModel>;

struct RegistryEntry {
    category: JobCategory,
    constructor: JobConstructor,
}

/// Registry of known job variants.
///
/// Populated with [`JobRegistry::register`] and only read afterwards.
#[derive(Default)]
pub struct JobRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_variants() -> Self {
        let mut registry = Self::new();
        registry.register("ollama", JobCategory::Service, service::create_ollama);
        registry.register("redis", JobCategory::Service, service::create_redis);
        registry.register("chroma", JobCategory::Service, service::create_chroma);
        registry.register("mysql", JobCategory::Service, service::create_mysql);
        registry.register("prometheus", JobCategory::Service, service::create_prometheus);
        registry.register("grafana", JobCategory::Service, service::create_grafana);
        registry.register(
            "ollama-benchmark",
            JobCategory::Client,
            client::create_ollama_benchmark,
        );
        registry.register(
            "redis-benchmark",
            JobCategory::Client,
            client::create_redis_benchmark,
        );
        registry.register(
            "chroma-benchmark",
            JobCategory::Client,
            client::create_chroma_benchmark,
        );
        registry.register(
            "mysql-benchmark",
            JobCategory::Client,
            client::create_mysql_benchmark,
        );
        registry
    }

    /// Registers a constructor, a later registration of the same tag replaces the earlier one.
    pub fn register(&mut self, tag: &str, category: JobCategory, constructor: JobConstructor) {
        if self
            .entries
            .insert(
                tag.to_string(),
                RegistryEntry {
                    category,
                    constructor,
                },
            )
            .is_some()
        {
            log::debug!("Job type `{tag}` was registered again");
        }
    }

    /// Builds the job model of `tag`. No remote call is made here.
    pub fn create(&self, tag: &str, spec: JobSpec) -> crate::Result<JobModel> {
        let entry = self
            .entries
            .get(tag)
            .ok_or_else(|| HpcError::UnknownTypeError(tag.to_string()))?;
        let model = (entry.constructor)(spec)?;
        debug_assert_eq!(model.category(), entry.category);
        Ok(model)
    }

    pub fn category(&self, tag: &str) -> Option<JobCategory> {
        self.entries.get(tag).map(|entry| entry.category)
    }

    /// Registered tags in alphabetical order.
    pub fn tags(&self, category: Option<JobCategory>) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, entry)| category.is_none_or(|category| entry.category == category))
            .map(|(tag, _)| tag.as_str())
            .collect()
    }
}

static GLOBAL_REGISTRY: OnceLock<JobRegistry> = OnceLock::new();

/// Process-wide registry with the builtin variants, initialized on first use.
pub fn global() -> &'static JobRegistry {
    GLOBAL_REGISTRY.get_or_init(JobRegistry::with_builtin_variants)
}

#[cfg(test)]
mod tests {
    use super::{JobRegistry, global};
    use crate::Error;
    use crate::job::{JobCategory, JobSpec};

    #[test]
    fn test_unknown_tag() {
        let registry = JobRegistry::with_builtin_variants();
        let result = registry.create("unknown_tag", JobSpec::new("x", "unknown_tag", "x.sif"));
        assert!(matches!(result, Err(Error::UnknownTypeError(tag)) if tag == "unknown_tag"));
    }

    #[test]
    fn test_configuration_error_propagates() {
        let registry = JobRegistry::with_builtin_variants();
        let result = registry.create("mysql", JobSpec::new("db", "mysql", "mysql.sif"));
        assert!(matches!(result, Err(Error::ConfigurationError { .. })));
    }

    #[test]
    fn test_fresh_registry_is_empty() {
        let registry = JobRegistry::new();
        assert!(registry.tags(None).is_empty());
        assert!(registry.create("redis", JobSpec::new("kv", "redis", "r.sif")).is_err());
    }

    #[test]
    fn test_tags_by_category() {
        let registry = global();
        assert_eq!(
            registry.tags(Some(JobCategory::Service)),
            vec!["chroma", "grafana", "mysql", "ollama", "prometheus", "redis"]
        );
        assert_eq!(
            registry.tags(Some(JobCategory::Client)),
            vec![
                "chroma-benchmark",
                "mysql-benchmark",
                "ollama-benchmark",
                "redis-benchmark"
            ]
        );
        assert_eq!(registry.tags(None).len(), 10);
        assert_eq!(registry.category("redis"), Some(JobCategory::Service));
        assert_eq!(registry.category("nope"), None);
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = JobRegistry::new();
        registry.register("kv", JobCategory::Service, crate::job::service::create_redis);
        let model = registry.create("kv", JobSpec::new("kv", "kv", "r.sif")).unwrap();
        assert_eq!(model.primary_port(), Some(6379));
    }
}

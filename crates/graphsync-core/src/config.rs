//! Configuration module for GraphSync.
//!
//! One YAML file drives the daemon: engine batching, scheduler pacing,
//! provider throttling, the store location, logging and the list of
//! containers. Every section falls back to defaults when omitted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainError;
use crate::domain::newtypes::ContainerRef;
use crate::domain::permission::Principal;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for GraphSync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub rate_limiting: RateLimitingConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub containers: Vec<ContainerConfig>,
}

/// Reconciliation engine and scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Records buffered before a transactional flush.
    pub batch_size: usize,
    /// Containers synced concurrently within one group.
    pub pool_size: usize,
    /// Pause between scheduler groups, in milliseconds.
    pub group_pause_ms: u64,
    /// Seconds between incremental rounds.
    pub incremental_interval_secs: u64,
    /// Seconds between full rounds.
    pub full_interval_secs: u64,
}

/// Outbound provider API throttling and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Sustained requests per second per provider connection.
    pub requests_per_second: u32,
    /// Bucket capacity (burst size).
    pub burst: u32,
    /// Retries for transient failures before giving up.
    pub max_retries: u32,
    /// First backoff delay, doubled on each retry, in milliseconds.
    pub base_delay_ms: u64,
}

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
}

/// `tracing` subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// One container to keep synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub org_id: String,
    pub connector: String,
    pub container_id: String,
    /// Local directory backing the container (`local` connector only).
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Identity to grant implicit READ; defaults to the lister's `whoami`.
    #[serde(default)]
    pub actor: Option<String>,
}

impl ContainerConfig {
    /// Validated container reference
    ///
    /// # Errors
    /// Returns the first invalid component
    pub fn container_ref(&self) -> Result<ContainerRef, DomainError> {
        ContainerRef::parse(&self.org_id, &self.connector, &self.container_id)
    }

    /// Configured actor override, if any
    pub fn actor(&self) -> Option<Principal> {
        self.actor
            .as_ref()
            .filter(|a| !a.is_empty())
            .map(|a| Principal::new(a.clone(), a.contains('@').then(|| a.clone())))
    }
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Parses the YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing or broken file yields defaults.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Where the daemon looks when no `--config` is given.
    ///
    /// Typically `$XDG_CONFIG_HOME/graphsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("graphsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pool_size: 5,
            group_pause_ms: 500,
            incremental_interval_secs: 300,
            full_interval_secs: 86_400,
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            burst: 50,
            max_retries: 5,
            base_delay_ms: 1000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("graphsync")
                .join("graphsync.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A configuration problem, reported with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.batch_size"`.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if self.sync.batch_size == 0 {
            errors.push(ValidationError {
                field: "sync.batch_size".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.pool_size == 0 {
            errors.push(ValidationError {
                field: "sync.pool_size".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.incremental_interval_secs == 0 {
            errors.push(ValidationError {
                field: "sync.incremental_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.full_interval_secs < self.sync.incremental_interval_secs {
            errors.push(ValidationError {
                field: "sync.full_interval_secs".into(),
                message: format!(
                    "full_interval_secs ({}) must not be shorter than incremental_interval_secs ({})",
                    self.sync.full_interval_secs, self.sync.incremental_interval_secs
                ),
            });
        }

        // --- rate_limiting ---
        if self.rate_limiting.requests_per_second == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.requests_per_second".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.rate_limiting.burst == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.burst".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        // --- containers ---
        let mut seen = std::collections::HashSet::new();
        for (i, container) in self.containers.iter().enumerate() {
            match container.container_ref() {
                Ok(c) => {
                    if !seen.insert(c.to_string()) {
                        errors.push(ValidationError {
                            field: format!("containers[{i}]"),
                            message: format!("duplicate container {c}"),
                        });
                    }
                }
                Err(e) => errors.push(ValidationError {
                    field: format!("containers[{i}]"),
                    message: e.to_string(),
                }),
            }
            if container.connector == "local" && container.root.is_none() {
                errors.push(ValidationError {
                    field: format!("containers[{i}].root"),
                    message: "required for the local connector".into(),
                });
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Programmatic construction, used by tests and embedders.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Starts from the defaults.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.sync.batch_size = n;
        self
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.config.sync.pool_size = n;
        self
    }

    pub fn group_pause_ms(mut self, ms: u64) -> Self {
        self.config.sync.group_pause_ms = ms;
        self
    }

    pub fn requests_per_second(mut self, n: u32) -> Self {
        self.config.rate_limiting.requests_per_second = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.rate_limiting.max_retries = n;
        self
    }

    pub fn database_path(mut self, path: PathBuf) -> Self {
        self.config.store.database_path = path;
        self
    }

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn container(mut self, container: ContainerConfig) -> Self {
        self.config.containers.push(container);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }

    /// # Errors
    /// Every validation problem, if any
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn local(container_id: &str) -> ContainerConfig {
        ContainerConfig {
            org_id: "acme".into(),
            connector: "local".into(),
            container_id: container_id.into(),
            root: Some(PathBuf::from("/srv/share")),
            actor: None,
        }
    }

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.batch_size, 100);
        assert_eq!(cfg.sync.pool_size, 5);
        assert_eq!(cfg.rate_limiting.requests_per_second, 50);
        assert_eq!(cfg.rate_limiting.max_retries, 5);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.containers.is_empty());
        assert!(cfg
            .store
            .database_path
            .to_string_lossy()
            .ends_with("graphsync.db"));
    }

    #[test]
    fn default_config_passes_validation() {
        assert!(Config::default().validate().is_empty());
    }

    // -- Loading --

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let yaml = r#"
sync:
  batch_size: 25
logging:
  level: debug
containers:
  - org_id: acme
    connector: local
    container_id: share
    root: /srv/share
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.batch_size, 25);
        assert_eq!(cfg.sync.pool_size, 5);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.containers.len(), 1);
        assert_eq!(
            cfg.containers[0].container_ref().unwrap().to_string(),
            "acme/local/share"
        );
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_or_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/graphsync.yaml"));
        assert_eq!(cfg.sync.batch_size, 100);
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_values() {
        let cfg = ConfigBuilder::new().batch_size(0).pool_size(0).build();
        let fields: Vec<_> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"sync.batch_size".to_string()));
        assert!(fields.contains(&"sync.pool_size".to_string()));
    }

    #[test]
    fn validate_catches_bad_log_level() {
        let errors = ConfigBuilder::new()
            .logging_level("verbose")
            .build_validated()
            .unwrap_err();
        assert_eq!(errors[0].field, "logging.level");
    }

    #[test]
    fn validate_catches_duplicate_and_invalid_containers() {
        let mut bad = local("share");
        bad.connector = "local drive".into();
        let cfg = ConfigBuilder::new()
            .container(local("share"))
            .container(local("share"))
            .container(bad)
            .build();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
        assert!(errors.iter().any(|e| e.field == "containers[2]"));
    }

    #[test]
    fn validate_requires_root_for_local() {
        let mut c = local("share");
        c.root = None;
        let errors = ConfigBuilder::new().container(c).build().validate();
        assert_eq!(errors[0].field, "containers[0].root");
    }

    #[test]
    fn actor_override() {
        let mut c = local("share");
        assert!(c.actor().is_none());
        c.actor = Some("svc@acme.test".into());
        let actor = c.actor().unwrap();
        assert_eq!(actor.id, "svc@acme.test");
        assert_eq!(actor.email.as_deref(), Some("svc@acme.test"));
    }
}

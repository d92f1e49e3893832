//! Store configuration.
//!
//! [`StoreConfig`] is a plain value handed to
//! [`EventStore::with_config`](crate::store::EventStore::with_config). It can be
//! built in code or loaded from YAML and environment variables:
//!
//! ```yaml
//! batch_size: 250
//! max_archived_snapshots: 2
//! operation_timeout_ms: 5000
//! snapshot_policy:
//!   every: 100
//! ```
//!
//! Environment variables use the `ANNALS__` prefix, e.g.
//! `ANNALS__BATCH_SIZE=50` or `ANNALS__SNAPSHOT_POLICY=always`.

use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::snapshot::{Policy, SnapshotManager};

/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ANNALS";

/// Replay page size when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Snapshots kept per entity when none is configured.
pub const DEFAULT_MAX_ARCHIVED_SNAPSHOTS: usize = 1;

/// Configuration could not be loaded or failed validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Snapshot policy as written in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyConfig {
    /// See [`Policy::Never`].
    #[default]
    Never,
    /// See [`Policy::Always`].
    Always,
    /// Snapshot once this many records accumulated since the last snapshot.
    Every(u64),
}

impl From<PolicyConfig> for Policy {
    fn from(config: PolicyConfig) -> Self {
        match config {
            PolicyConfig::Never => Self::Never,
            PolicyConfig::Always => Self::Always,
            PolicyConfig::Every(n) => Self::EveryNEvents(n),
        }
    }
}

/// Tuning knobs for an [`EventStore`](crate::store::EventStore).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Records fetched per backend read during replay.
    pub batch_size: usize,
    /// Snapshots kept per entity after archiving a new one.
    pub max_archived_snapshots: usize,
    /// Upper bound for every backend call. `None` leaves calls unbounded.
    pub operation_timeout_ms: Option<u64>,
    /// When the store asks for snapshots.
    pub snapshot_policy: PolicyConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_archived_snapshots: DEFAULT_MAX_ARCHIVED_SNAPSHOTS,
            operation_timeout_ms: None,
            snapshot_policy: PolicyConfig::Never,
        }
    }
}

impl StoreConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. built-in defaults
    /// 2. the YAML file at `path`, if given (must exist)
    /// 3. environment variables prefixed with `ANNALS__`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder();
        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        tracing::debug!(?config, "store configuration loaded");
        Ok(config)
    }

    /// Reject values the store cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.max_archived_snapshots == 0 {
            return Err(ConfigError::Invalid(
                "max_archived_snapshots must be at least 1".into(),
            ));
        }
        if self.snapshot_policy == PolicyConfig::Every(0) {
            return Err(ConfigError::Invalid(
                "snapshot_policy.every must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The operation timeout as a [`Duration`].
    #[must_use]
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// The page size, treating 0 as 1.
    #[must_use]
    pub fn batch_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.batch_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Snapshot manager built from the policy and retention settings.
    #[must_use]
    pub fn snapshot_manager(&self) -> SnapshotManager<Policy> {
        let max_archived =
            NonZeroUsize::new(self.max_archived_snapshots).unwrap_or(NonZeroUsize::MIN);
        SnapshotManager::new(self.snapshot_policy.into()).with_max_archived(max_archived)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::*;

    fn write_yaml(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("annals-{}.yaml", uuid::Uuid::new_v4()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_archived_snapshots, 1);
        assert_eq!(config.operation_timeout(), None);
        assert_eq!(config.snapshot_policy, PolicyConfig::Never);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_yaml_file() {
        let path = write_yaml(
            "batch_size: 25\nmax_archived_snapshots: 3\noperation_timeout_ms: 1500\nsnapshot_policy:\n  every: 10\n",
        );
        let config = StoreConfig::load(path.to_str()).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_archived_snapshots, 3);
        assert_eq!(config.operation_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(Policy::from(config.snapshot_policy), Policy::EveryNEvents(10));
        assert_eq!(config.snapshot_manager().max_archived().get(), 3);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let path = write_yaml("snapshot_policy: always\n");
        let config = StoreConfig::load(path.to_str()).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.snapshot_policy, PolicyConfig::Always);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let path = write_yaml("batch_size: 0\n");
        let result = StoreConfig::load(path.to_str());
        fs::remove_file(&path).ok();

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_retention_is_invalid() {
        let config = StoreConfig {
            max_archived_snapshots: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_fails_to_load() {
        let result = StoreConfig::load(Some("/nonexistent/annals.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}

//! Repository configuration.
//!
//! Values are layered: defaults, then an optional JSON file, then
//! `AGGREPO_*` environment variables. Configuration is fixed once the
//! repository starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::validate_repository_name;
use crate::{RepositoryError, RepositoryResult};

/// Default interval between recovery scans.
pub const DEFAULT_RECOVERY_INTERVAL_MS: i64 = 5000;

/// Default redelivery budget before dead-letter escalation.
pub const DEFAULT_MAXIMUM_REDELIVERIES: i32 = 3;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "AGGREPO_";

/// Operating parameters for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Root namespace for key encoding. Required.
    pub repository_name: String,
    /// Durable store location, when no pre-built store is supplied.
    pub persistent_file_name: Option<PathBuf>,
    /// Fsync every durable write.
    pub sync: bool,
    /// Have `add` read and return the snapshot it replaces.
    pub return_old_exchange: bool,
    /// Run the recovery scanner and answer `recover` queries.
    pub use_recovery: bool,
    /// Recovery scan period in milliseconds.
    pub recovery_interval_ms: i64,
    /// Redeliveries before escalation; 0 escalates on the first scan.
    pub maximum_redeliveries: i32,
    /// Destination handed exhausted exchanges.
    pub dead_letter_uri: Option<String>,
    /// Persist non-primitive headers.
    pub allow_serialized_headers: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            repository_name: String::new(),
            persistent_file_name: None,
            sync: false,
            return_old_exchange: false,
            use_recovery: true,
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
            maximum_redeliveries: DEFAULT_MAXIMUM_REDELIVERIES,
            dead_letter_uri: None,
            allow_serialized_headers: false,
        }
    }
}

impl RepositoryConfig {
    /// Default configuration for the named repository.
    pub fn new(repository_name: impl Into<String>) -> Self {
        Self {
            repository_name: repository_name.into(),
            ..Self::default()
        }
    }

    /// Loads defaults, then `path` if it exists, then environment overrides.
    pub fn load(path: Option<&Path>) -> RepositoryResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            _ => Self::default(),
        };
        config.load_from_env()?;
        Ok(config)
    }

    /// Load configuration from a specific JSON file.
    pub fn load_from_file(path: &Path) -> RepositoryResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RepositoryConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override configuration from `AGGREPO_*` environment variables.
    pub fn load_from_env(&mut self) -> RepositoryResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a full variable name
    /// (e.g. `AGGREPO_SYNC`) to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> RepositoryResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, suffix))
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(value) = get("REPOSITORY_NAME") {
            self.repository_name = value;
        }
        if let Some(value) = get("PERSISTENT_FILE_NAME") {
            self.persistent_file_name = Some(PathBuf::from(value));
        }
        if let Some(value) = get("SYNC") {
            self.sync = parse_bool("SYNC", &value)?;
        }
        if let Some(value) = get("RETURN_OLD_EXCHANGE") {
            self.return_old_exchange = parse_bool("RETURN_OLD_EXCHANGE", &value)?;
        }
        if let Some(value) = get("USE_RECOVERY") {
            self.use_recovery = parse_bool("USE_RECOVERY", &value)?;
        }
        if let Some(value) = get("RECOVERY_INTERVAL_MS") {
            self.recovery_interval_ms = parse_number("RECOVERY_INTERVAL_MS", &value)?;
        }
        if let Some(value) = get("MAXIMUM_REDELIVERIES") {
            self.maximum_redeliveries = parse_number("MAXIMUM_REDELIVERIES", &value)?;
        }
        if let Some(value) = get("DEAD_LETTER_URI") {
            self.dead_letter_uri = Some(value);
        }
        if let Some(value) = get("ALLOW_SERIALIZED_HEADERS") {
            self.allow_serialized_headers = parse_bool("ALLOW_SERIALIZED_HEADERS", &value)?;
        }
        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> RepositoryResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Checks the settings every repository needs.
    pub fn validate(&self) -> RepositoryResult<()> {
        validate_repository_name(&self.repository_name).map_err(RepositoryError::Config)?;
        if self.maximum_redeliveries < 0 {
            return Err(RepositoryError::Config(format!(
                "maximum_redeliveries must be zero or positive, got {}",
                self.maximum_redeliveries
            )));
        }
        if self.recovery_interval_ms < 0 {
            return Err(RepositoryError::Config(format!(
                "recovery_interval_ms must be zero or positive, got {}",
                self.recovery_interval_ms
            )));
        }
        Ok(())
    }

    /// Checks the settings the recovery scanner needs. A no-op when
    /// recovery is disabled.
    pub fn validate_recovery(&self) -> RepositoryResult<()> {
        self.validate()?;
        if !self.use_recovery {
            return Ok(());
        }
        if self.recovery_interval_ms == 0 {
            return Err(RepositoryError::Config(
                "recovery_interval_ms must be positive when recovery is enabled".to_string(),
            ));
        }
        if self.dead_letter_uri.as_deref().map_or(true, str::is_empty) {
            return Err(RepositoryError::Config(
                "dead_letter_uri is required when recovery is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// The scan period. Negative values (rejected by `validate`) map to zero.
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.recovery_interval_ms).unwrap_or(0))
    }
}

fn parse_bool(name: &str, raw: &str) -> RepositoryResult<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RepositoryError::Config(format!(
            "{}{} must be a boolean, got {:?}",
            ENV_PREFIX, name, raw
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> RepositoryResult<T> {
    raw.parse::<T>().map_err(|_| {
        RepositoryError::Config(format!(
            "{}{} must be an integer, got {:?}",
            ENV_PREFIX, name, raw
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RepositoryConfig::default();
        assert!(config.use_recovery);
        assert_eq!(config.recovery_interval_ms, DEFAULT_RECOVERY_INTERVAL_MS);
        assert_eq!(config.maximum_redeliveries, DEFAULT_MAXIMUM_REDELIVERIES);
        assert!(!config.sync);
        assert!(!config.return_old_exchange);
        assert!(config.dead_letter_uri.is_none());
    }

    #[test]
    fn test_config_load_from_file_with_partial_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "repository_name": "orders",
                "recovery_interval_ms": 100,
                "maximum_redeliveries": 1
            }"#,
        )
        .unwrap();

        let config = RepositoryConfig::load_from_file(&path).unwrap();
        assert_eq!(config.repository_name, "orders");
        assert_eq!(config.recovery_interval(), Duration::from_millis(100));
        assert_eq!(config.maximum_redeliveries, 1);
        assert!(config.use_recovery);
    }

    #[test]
    fn test_config_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = RepositoryConfig {
            dead_letter_uri: Some("file:/tmp/dlq.jsonl".into()),
            sync: true,
            ..RepositoryConfig::new("orders")
        };

        config.save(&path).unwrap();
        let reloaded = RepositoryConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(reloaded.dead_letter_uri, config.dead_letter_uri);
    }

    #[test]
    fn test_missing_file_is_an_error_and_empty_env_changes_nothing() {
        let dir = tempdir().unwrap();
        let config = RepositoryConfig::load_from_file(&dir.path().join("absent.json"));
        assert!(config.is_err());

        let mut config = RepositoryConfig::default();
        config.apply_overrides(lookup(&[])).unwrap();
        assert_eq!(config, RepositoryConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RepositoryConfig::new("orders");
        config
            .apply_overrides(lookup(&[
                ("AGGREPO_SYNC", "true"),
                ("AGGREPO_USE_RECOVERY", "no"),
                ("AGGREPO_RECOVERY_INTERVAL_MS", "250"),
                ("AGGREPO_MAXIMUM_REDELIVERIES", "7"),
                ("AGGREPO_DEAD_LETTER_URI", "file:dead.jsonl"),
                ("AGGREPO_REPOSITORY_NAME", "  "),
            ]))
            .unwrap();

        assert!(config.sync);
        assert!(!config.use_recovery);
        assert_eq!(config.recovery_interval_ms, 250);
        assert_eq!(config.maximum_redeliveries, 7);
        assert_eq!(config.dead_letter_uri.as_deref(), Some("file:dead.jsonl"));
        // blank values are ignored
        assert_eq!(config.repository_name, "orders");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = RepositoryConfig::new("orders");
        let err = config
            .apply_overrides(lookup(&[("AGGREPO_SYNC", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Config(_)));

        let err = config
            .apply_overrides(lookup(&[("AGGREPO_MAXIMUM_REDELIVERIES", "lots")]))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Config(_)));
    }

    #[test]
    fn test_validate() {
        assert!(RepositoryConfig::new("orders").validate().is_ok());
        assert!(RepositoryConfig::default().validate().is_err());
        assert!(RepositoryConfig::new("orders-completed").validate().is_err());

        let negative_redeliveries = RepositoryConfig {
            maximum_redeliveries: -1,
            ..RepositoryConfig::new("orders")
        };
        assert!(negative_redeliveries.validate().is_err());

        let negative_interval = RepositoryConfig {
            recovery_interval_ms: -5,
            ..RepositoryConfig::new("orders")
        };
        assert!(negative_interval.validate().is_err());
        assert_eq!(negative_interval.recovery_interval(), Duration::ZERO);
    }

    #[test]
    fn test_validate_recovery() {
        let base = RepositoryConfig::new("orders");
        assert!(base.validate_recovery().is_err(), "dead letter uri missing");

        let ready = RepositoryConfig {
            dead_letter_uri: Some("mock:dead".into()),
            ..base.clone()
        };
        assert!(ready.validate_recovery().is_ok());

        let zero_interval = RepositoryConfig {
            recovery_interval_ms: 0,
            ..ready.clone()
        };
        assert!(zero_interval.validate_recovery().is_err());

        let disabled = RepositoryConfig {
            use_recovery: false,
            recovery_interval_ms: 0,
            ..base
        };
        assert!(disabled.validate_recovery().is_ok());
    }
}

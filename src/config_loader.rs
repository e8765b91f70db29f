//! Configuration loader.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

use taskq_queue::EngineConfig;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Configuration loader with environment variable substitution.
pub(crate) struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<EngineConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<EngineConfig, ConfigError> {
        if !path.exists() {
            let mut config = EngineConfig::default();
            config.store.db_path = Self::expand_db_path(&config.store.db_path);
            return Ok(config);
        }
        Self::load(path)
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<EngineConfig, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: EngineConfig = toml::from_str(&expanded)?;
        config.store.db_path = Self::expand_db_path(&config.store.db_path);
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();
        let re = Regex::new(r"\$\{([^}]+)\}")?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.taskq`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }

    fn expand_db_path(path: &Path) -> PathBuf {
        PathBuf::from(Self::expand_path(&path.to_string_lossy()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.sweeper.stale_interval_secs, 30);
        assert_eq!(config.purge.retention_hours, 72);
        assert_eq!(config.task_classes.len(), 3);
    }

    #[test]
    fn test_load_full_config() {
        let content = r#"
            [store]
            db_path = "/var/lib/taskq/queue.db"
            busy_timeout_ms = 2000

            [sweeper]
            stale_interval_secs = 45

            [purge]
            interval_secs = 600
            retention_hours = 24

            [lease]
            ttl_secs = 90

            [task_classes]
            FAST_SCRIPT = 15
            NIGHTLY = 7200
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/var/lib/taskq/queue.db"));
        assert_eq!(config.store.busy_timeout_ms, 2000);
        assert_eq!(config.sweeper.stale_interval_secs, 45);
        assert_eq!(config.purge.retention_hours, 24);
        assert_eq!(config.lease.ttl_secs, 90);
        assert_eq!(config.task_classes.get("NIGHTLY"), Some(&7200));
        // An explicit table replaces the defaults.
        assert!(!config.task_classes.contains_key("STANDARD"));
    }

    #[test]
    fn test_db_path_tilde_is_expanded() {
        let config = ConfigLoader::load_str("[store]\ndb_path = \"~/q/taskq.db\"").unwrap();
        let path = config.store.db_path.to_string_lossy().to_string();
        assert!(!path.starts_with('~'));
        assert!(path.ends_with("/q/taskq.db"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[sweeper]").unwrap();
        writeln!(file, "stale_interval_secs = 5").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.sweeper.stale_interval_secs, 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = Path::new("/nonexistent/path/taskq.toml");
        assert!(ConfigLoader::load(path).is_err());

        let config = ConfigLoader::load_or_default(path).unwrap();
        assert_eq!(config.purge.retention_hours, 72);
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: This test runs in isolation and sets a unique test-only env var
        unsafe {
            std::env::set_var("TASKQ_TEST_DB_DIR", "/srv/taskq");
        }
        let config =
            ConfigLoader::load_str("[store]\ndb_path = \"${TASKQ_TEST_DB_DIR}/taskq.db\"").unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/srv/taskq/taskq.db"));
        unsafe {
            std::env::remove_var("TASKQ_TEST_DB_DIR");
        }
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${NONEXISTENT_TASKQ_VAR_12345}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_expand_path_no_tilde() {
        let path = "/usr/local/share/taskq";
        assert_eq!(ConfigLoader::expand_path(path), path);
    }
}

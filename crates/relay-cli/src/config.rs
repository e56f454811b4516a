use anyhow::{Context, Result, bail};
use relay_core::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when neither RUST_LOG nor --debug is set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_max_records() -> usize {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relay")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl RelayConfig {
    /// Load from an explicit path (must exist) or the default location (optional)
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        match custom_path {
            Some(path) => Self::from_file(path),
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    debug!("No config at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `relay init` first.",
                path.display()
            )
        })?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config at {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.orchestrator.dispatch_timeout_secs == 0 {
            bail!("orchestrator.dispatch_timeout_secs must be greater than 0");
        }
        if self.orchestrator.shutdown_grace_secs == 0 {
            bail!("orchestrator.shutdown_grace_secs must be greater than 0");
        }
        if self.orchestrator.name.trim().is_empty() {
            bail!("orchestrator.name must not be empty");
        }
        if self.storage.max_records == 0 {
            bail!("storage.max_records must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.orchestrator.dispatch_timeout_secs, 30);
        assert_eq!(cfg.orchestrator.shutdown_grace_secs, 10);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert_eq!(cfg.storage.max_records, 10_000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let file = write_config(
            r#"
[orchestrator]
dispatch_timeout_secs = 5

[logging]
json = true
"#,
        );
        let cfg = RelayConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.orchestrator.dispatch_timeout_secs, 5);
        assert_eq!(cfg.orchestrator.shutdown_grace_secs, 10);
        assert_eq!(cfg.orchestrator.name, "orchestrator");
        assert!(cfg.logging.json);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.storage.max_records, 10_000);
    }

    #[test]
    fn test_default_file_parses() {
        let cfg: RelayConfig = toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.orchestrator.dispatch_timeout_secs, 30);
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = RelayConfig::load(&Some(missing)).unwrap_err();
        assert!(err.to_string().contains("relay init"));
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let file = write_config("[orchestrator\nname = ");
        let err = RelayConfig::load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let file = write_config("[orchestrator]\ndispatch_timeout_secs = 0\n");
        assert!(RelayConfig::load(&Some(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let cfg = RelayConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: RelayConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.storage.max_records, cfg.storage.max_records);
        assert_eq!(back.orchestrator.name, cfg.orchestrator.name);
    }
}

//! Daemon configuration, loaded from a YAML file.
//!
//! Every key has a sensible default so a partial (or absent) config file
//! still yields a usable configuration. A config path the operator passed
//! explicitly must exist; the implicit default path is allowed to be
//! missing.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Path tried when the operator doesn't pass `--config`.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chip family passed to esptool's `--chip`.
    pub chip: String,

    /// Serial baud rate for esptool invocations.
    pub baud_rate: u32,

    /// Flash offset address for firmware writes.
    pub flash_offset: u32,

    /// Firmware image flashed when no override is given.
    pub firmware_path: PathBuf,

    /// Pass `--verify` to esptool after writing.
    pub verify: bool,

    /// Maximum number of concurrent flash operations.
    pub max_workers: usize,

    /// Per-device timeout for batch flashing, in seconds.
    pub flash_timeout_secs: u64,

    /// Directory holding per-attempt session logs.
    pub log_dir: PathBuf,

    /// SQLite database tracking attempt history.
    pub db_path: PathBuf,

    /// The esptool executable to invoke.
    pub esptool_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chip: "esp32".to_string(),
            baud_rate: 921_600,
            flash_offset: 0x1000,
            firmware_path: PathBuf::from("static/firmware/firmware.bin"),
            verify: true,
            max_workers: 10,
            flash_timeout_secs: 300,
            log_dir: PathBuf::from("static/logs"),
            db_path: PathBuf::from("static/flash_history.db"),
            esptool_path: PathBuf::from("esptool.py"),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. The file must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Load the default config path, falling back to built-in defaults
    /// when the file doesn't exist.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_daemon_expectations() {
        let config = Config::default();
        assert_eq!(config.chip, "esp32");
        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.flash_offset, 0x1000);
        assert!(config.verify);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.flash_timeout_secs, 300);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_keys() {
        let config: Config = serde_yaml::from_str("baud_rate: 115200\nverify: false\n").unwrap();
        assert_eq!(config.baud_rate, 115_200);
        assert!(!config.verify);
        // Untouched keys fall back to defaults.
        assert_eq!(config.chip, "esp32");
        assert_eq!(config.max_workers, 10);
    }

    #[test]
    fn load_missing_explicit_path_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/zflash.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn load_parses_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "chip: esp32s3\nmax_workers: 4\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.chip, "esp32s3");
        assert_eq!(config.max_workers, 4);
    }
}

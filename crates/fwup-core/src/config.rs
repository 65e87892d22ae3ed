//! Update configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::protocol::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_RESPONSE_TIMEOUT_MS, MAX_WRITE_LEN,
    STORE_HEADER_LEN,
};

/// Configuration for an update controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Code block size in bytes (device page granularity).
    pub block_size: usize,
    /// Failed attempts tolerated per block before giving up.
    pub max_retries: u8,
    /// Response timeout in milliseconds.
    pub response_timeout_ms: u64,
    /// Largest control point write the link accepts.
    pub max_write_len: usize,
    /// Where the resumable session position is kept.
    pub snapshot_path: Option<PathBuf>,
    /// Local directory holding `manifest.toml` and images.
    pub source_dir: Option<PathBuf>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            max_write_len: MAX_WRITE_LEN,
            snapshot_path: None,
            source_dir: None,
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpdateConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            bail!("block_size must be non-zero");
        }
        if self.max_write_len == 0 || self.max_write_len > MAX_WRITE_LEN {
            bail!(
                "max_write_len must be between 1 and {}, got {}",
                MAX_WRITE_LEN,
                self.max_write_len
            );
        }
        if self.block_size + STORE_HEADER_LEN > self.max_write_len {
            bail!(
                "block_size {} needs a {}-byte store write, max_write_len is {}",
                self.block_size,
                self.block_size + STORE_HEADER_LEN,
                self.max_write_len
            );
        }
        if self.response_timeout_ms == 0 {
            bail!("response_timeout_ms must be non-zero");
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwup.toml");
        std::fs::write(&path, "max_retries = 5\n").unwrap();

        let config = UpdateConfig::load_from_file(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.response_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwup.toml");
        let config = UpdateConfig {
            block_size: 256,
            snapshot_path: Some(dir.path().join("session.toml")),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(UpdateConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_oversized_write() {
        let config = UpdateConfig {
            max_write_len: MAX_WRITE_LEN + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_block_larger_than_write() {
        let config = UpdateConfig {
            block_size: 128,
            max_write_len: 64,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_write_len is 64"));

        let fits = UpdateConfig {
            block_size: 59,
            max_write_len: 64,
            ..Default::default()
        };
        assert!(fits.validate().is_ok());
    }
}

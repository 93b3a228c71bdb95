use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::AppConfig;
use crate::error::Result;

/// Configuration store backed by a JSON file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, falling back to defaults when the file is missing
    pub fn load(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            info!("Config file {:?} not found, using defaults", self.path);
            return Ok(AppConfig::default());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let config: AppConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        debug!("Loaded config from {:?}", self.path);
        Ok(config)
    }

    /// Persist the configuration, creating parent directories as needed
    pub fn save(&self, config: &AppConfig) -> Result<()> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConsumerConfig;
    use crate::error::CaptureError;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("absent.json"));
        let config = store.load().unwrap();
        assert_eq!(config.capture.fps, 30);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("nested/config.json"));

        let mut config = AppConfig::default();
        config.capture.device = Some("/dev/video11".to_string());
        config.encoders.push(EncoderConsumerConfig {
            width: 1280,
            height: 720,
            ..Default::default()
        });
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.capture.device.as_deref(), Some("/dev/video11"));
        assert_eq!(loaded.encoders.len(), 1);
        assert_eq!(loaded.encoders[0].width, 1280);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = ConfigStore::new(&path);
        assert!(matches!(store.load(), Err(CaptureError::Serialization(_))));
    }

    #[test]
    fn test_invalid_values_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zero.json");
        std::fs::write(&path, r#"{"capture": {"fps": 0}}"#).unwrap();
        let store = ConfigStore::new(&path);
        assert!(matches!(store.load(), Err(CaptureError::Config(_))));
    }
}

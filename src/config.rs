use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::upload::metadata::{MetadataPolicy, Visibility};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "autoupload.toml";

/// Resumable uploads must send chunks in multiples of this many bytes.
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

/// Configuration loaded from `autoupload.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory whose new files are uploaded.
    pub watch_directory: PathBuf,
    /// Lowercase extensions to react to. Empty accepts every file.
    pub extensions: Vec<String>,
    pub visibility: Visibility,
    /// Title with `{timestamp}` and `{file_name}` placeholders.
    pub title_template: String,
    pub description: String,
    /// Delay between stability probe attempts.
    pub probe_interval_ms: u64,
    /// Give up on a locked file after this many probe attempts.
    pub probe_max_attempts: u32,
    /// Extra upload attempts after a retryable failure.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Bytes per resumable-upload request.
    pub chunk_size: usize,
    /// OAuth client secret / token cache file.
    pub credentials_path: PathBuf,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            watch_directory: PathBuf::from("."),
            extensions: ["mp4", "mkv", "mov", "flv", "ts"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            visibility: Visibility::Unlisted,
            title_template: "Dota Replay {timestamp}".to_string(),
            description: "Automatically uploaded".to_string(),
            probe_interval_ms: 2_000,
            probe_max_attempts: 900,
            max_retries: 0,
            retry_backoff_ms: 5_000,
            chunk_size: 32 * CHUNK_GRANULARITY,
            credentials_path: PathBuf::from("client_secrets.json"),
            api_base_url: "https://www.googleapis.com".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl AppConfig {
    /// Load configuration from the given file.
    ///
    /// Returns the default configuration if the file does not exist or cannot be parsed.
    pub fn load(config_path: &Path) -> Self {
        if !config_path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(config_path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(
                        path = %config_path.display(),
                        error = %err,
                        "failed to parse config, using defaults"
                    );
                    Self::default()
                }
            },
            Err(err) => {
                tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "failed to read config, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_max_attempts == 0 {
            return Err(ConfigError::ZeroProbeAttempts);
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::ZeroProbeInterval);
        }
        if self.chunk_size == 0 || self.chunk_size % CHUNK_GRANULARITY != 0 {
            return Err(ConfigError::ChunkSize {
                chunk_size: self.chunk_size,
                granularity: CHUNK_GRANULARITY,
            });
        }
        if self.title_template.trim().is_empty() {
            return Err(ConfigError::EmptyTitleTemplate);
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn metadata_policy(&self) -> MetadataPolicy {
        MetadataPolicy {
            title_template: self.title_template.clone(),
            description: self.description.clone(),
            visibility: self.visibility,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig::load(&dir.path().join(CONFIG_FILE));
        assert_eq!(config.visibility, Visibility::Unlisted);
        assert_eq!(config.max_retries, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "watch_directory = \"/rec\"\nvisibility = \"private\"\nprobe_max_attempts = 3\nextensions = []\n",
        )
        .unwrap();

        let config = AppConfig::load(&path);
        assert_eq!(config.watch_directory, PathBuf::from("/rec"));
        assert_eq!(config.visibility, Visibility::Private);
        assert_eq!(config.probe_max_attempts, 3);
        assert!(config.extensions.is_empty());
        assert_eq!(config.description, "Automatically uploaded");
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "visibility = \"everyone\"").unwrap();

        let config = AppConfig::load(&path);
        assert_eq!(config.visibility, Visibility::Unlisted);
    }

    #[test]
    fn test_validate_rejects_unaligned_chunk_size() {
        let config = AppConfig {
            chunk_size: CHUNK_GRANULARITY + 1,
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ChunkSize { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_probe_ceiling() {
        let config = AppConfig {
            probe_max_attempts: 0,
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroProbeAttempts)
        ));
    }
}

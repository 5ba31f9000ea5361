//! Sink configuration and loading

use crate::{
    compression::{self, CompressionJobError, CompressionOption},
    path::PathTemplate,
    rotation::RotationPolicy,
    Error, Result,
};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Callback notified when a compression job fails
pub type CompressionErrorCallback = Arc<dyn Fn(&CompressionJobError) + Send + Sync>;

/// Immutable configuration captured when a sink starts
#[derive(Clone)]
pub struct SinkConfig {
    /// Path template, optionally carrying `{n}` and `{time}` placeholders
    pub path_template: String,

    /// When to rotate the active file
    pub rotation: RotationPolicy,

    /// How finalized files are post-processed
    pub compression: Option<CompressionOption>,

    /// Cleanup of old artifacts after each compression
    pub retention: RetentionPolicy,

    /// Where compression jobs run
    pub compression_mode: CompressionMode,

    /// Notified on every failed compression job
    pub on_compression_error: Option<CompressionErrorCallback>,
}

impl SinkConfig {
    pub fn new(path_template: impl Into<String>) -> Self {
        Self {
            path_template: path_template.into(),
            rotation: RotationPolicy::Never,
            compression: None,
            retention: RetentionPolicy::default(),
            compression_mode: CompressionMode::Inline,
            on_compression_error: None,
        }
    }

    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_compression(mut self, compression: impl Into<CompressionOption>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_compression_mode(mut self, mode: CompressionMode) -> Self {
        self.compression_mode = mode;
        self
    }

    pub fn on_compression_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CompressionJobError) + Send + Sync + 'static,
    {
        self.on_compression_error = Some(Arc::new(callback));
        self
    }

    /// Check the template and the compression specifier without touching
    /// the filesystem
    pub fn validate(&self) -> Result<()> {
        if let Some(option) = &self.compression {
            compression::resolve(option)?;
        }
        PathTemplate::parse(&self.path_template)?;
        self.retention.validate()
    }
}

impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfig")
            .field("path_template", &self.path_template)
            .field("rotation", &self.rotation)
            .field("compression", &self.compression)
            .field("retention", &self.retention)
            .field("compression_mode", &self.compression_mode)
            .field(
                "on_compression_error",
                &self.on_compression_error.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// Where compression jobs are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// On the writing path, right after the new file is opened
    #[default]
    Inline,
    /// On a worker thread; `stop()` waits for every outstanding job
    Background,
}

/// Limits on the artifacts a sink leaves behind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Maximum number of finalized files and artifacts to keep
    pub max_files: Option<u32>,

    /// Maximum age of finalized files and artifacts (in days)
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_files.is_some() || self.max_age_days.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_files == Some(0) {
            return Err(Error::config("max_files must be greater than 0"));
        }

        if self.max_age_days == Some(0) {
            return Err(Error::config("max_age_days must be greater than 0"));
        }

        Ok(())
    }
}

/// User-facing sink options, as stored in a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkOptions {
    /// Path template of the log file
    pub path: String,

    /// Compression specifier, validated when the sink starts
    pub compression: Option<toml::Value>,

    /// Inline or background compression
    pub compression_mode: CompressionMode,

    /// Rotation policy
    pub rotation: RotationPolicy,

    /// Retention limits
    pub retention: RetentionPolicy,
}

impl Default for SinkOptions {
    fn default() -> Self {
        let log_dir = Self::default_log_dir().unwrap_or_else(|_| PathBuf::from("./logs"));

        Self {
            path: log_dir.join("fennec.log").to_string_lossy().into_owned(),
            rotation: RotationPolicy::Never,
            compression: None,
            retention: RetentionPolicy::default(),
            compression_mode: CompressionMode::Inline,
        }
    }
}

impl SinkOptions {
    /// Load options from file or create default
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut options = if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            toml::from_str(&content).map_err(|e| Error::Config {
                message: format!("Failed to parse log sink config: {}", e),
            })?
        } else {
            Self::default()
        };

        options.load_env_overrides();
        Ok(options)
    }

    /// Save options to file
    pub async fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: format!("Failed to serialize log sink config: {}", e),
        })?;

        tokio::fs::write(&config_file, content).await?;
        Ok(())
    }

    /// Load environment variable overrides
    pub fn load_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key/value source
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("FENNEC_LOGSINK_PATH") {
            self.path = path;
        }

        if let Some(compression) = lookup("FENNEC_LOGSINK_COMPRESSION") {
            self.compression = match compression.trim() {
                "" | "none" => None,
                tag => Some(toml::Value::String(tag.to_string())),
            };
        }

        if let Some(bytes) = lookup("FENNEC_LOGSINK_ROTATION_BYTES") {
            if let Ok(bytes) = bytes.trim().parse() {
                self.rotation = RotationPolicy::Size { bytes };
            }
        }
    }

    /// Build the sink configuration these options describe
    pub fn into_config(self) -> SinkConfig {
        let mut config = SinkConfig::new(self.path)
            .with_rotation(self.rotation)
            .with_retention(self.retention)
            .with_compression_mode(self.compression_mode);
        config.compression = self.compression.map(CompressionOption::Value);
        config
    }

    fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "fennec", "fennec").ok_or_else(|| Error::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("logsink.toml"))
    }

    fn default_log_dir() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "fennec", "fennec").ok_or_else(|| Error::Config {
                message: "Could not determine log directory".to_string(),
            })?;

        Ok(project_dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_options_from_toml() {
        let options: SinkOptions = toml::from_str(
            r#"
            path = "/var/log/fennec/app.{n}.log"
            compression = "tar.gz"
            compression_mode = "background"

            [rotation]
            kind = "size"
            bytes = 1024

            [retention]
            max_files = 3
            "#,
        )
        .unwrap();

        assert_eq!(options.rotation, RotationPolicy::Size { bytes: 1024 });
        assert_eq!(options.retention.max_files, Some(3));
        assert_eq!(options.retention.max_age_days, None);
        assert_eq!(options.compression_mode, CompressionMode::Background);

        let config = options.into_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wrong_compression_type_fails_validation() {
        for raw in ["compression = 0", "compression = true", "compression = [\"zip\"]"] {
            let options: SinkOptions =
                toml::from_str(&format!("path = \"/tmp/test.log\"\n{}", raw)).unwrap();
            let result = options.into_config().validate();
            assert!(
                matches!(result, Err(Error::Config { .. })),
                "{} should be rejected",
                raw
            );
        }
    }

    #[tokio::test]
    async fn test_options_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("logsink.toml");

        let original = SinkOptions {
            path: "/tmp/fennec/app.{n}.log".to_string(),
            rotation: RotationPolicy::Daily,
            compression: Some(toml::Value::String("xz".to_string())),
            retention: RetentionPolicy {
                max_files: Some(10),
                max_age_days: Some(7),
            },
            compression_mode: CompressionMode::Inline,
        };
        original.save(Some(&config_path)).await.unwrap();

        let loaded = SinkOptions::load(Some(&config_path)).await.unwrap();
        assert_eq!(loaded.path, original.path);
        assert_eq!(loaded.retention, original.retention);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("FENNEC_LOGSINK_PATH", "/srv/logs/app.{n}.log"),
            ("FENNEC_LOGSINK_COMPRESSION", "bz2"),
            ("FENNEC_LOGSINK_ROTATION_BYTES", "4096"),
        ]
        .into_iter()
        .collect();

        let mut options = SinkOptions::default();
        options.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(options.path, "/srv/logs/app.{n}.log");
        assert_eq!(
            options.compression,
            Some(toml::Value::String("bz2".to_string()))
        );
        assert_eq!(options.rotation, RotationPolicy::Size { bytes: 4096 });

        options.apply_overrides(|key| {
            (key == "FENNEC_LOGSINK_COMPRESSION").then(|| "none".to_string())
        });
        assert_eq!(options.compression, None);
    }

    #[test]
    fn test_retention_validation() {
        let mut config = SinkConfig::new("/tmp/test.log");
        config.retention.max_files = Some(0);
        assert!(config.validate().is_err());

        config.retention.max_files = Some(5);
        config.retention.max_age_days = Some(0);
        assert!(config.validate().is_err());

        config.retention.max_age_days = Some(30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_template_fails_validation() {
        let config = SinkConfig::new("/tmp/{index}.log");
        assert!(matches!(config.validate(), Err(Error::Path { .. })));
    }
}

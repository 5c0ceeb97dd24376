use crate::models::WorkstationConfig;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use std::fs;

/// File name of the workstation configuration inside the config directory
pub const WORKSTATION_CONFIG_FILE: &str = "workstation.yaml";

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "BAGSTREAM";

/// Configuration manager for the workstation YAML file.
///
/// Settings are layered: built-in defaults, then `workstation.yaml`, then
/// environment variables such as `BAGSTREAM__WORKER_COUNT=8` or
/// `BAGSTREAM__POOL_SIZES__OSR=4`.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    workstation_config_path: Utf8PathBuf,
    env_prefix: String,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing `workstation.yaml` (e.g., "config")
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        // Create config directory if it doesn't exist
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            workstation_config_path: config_dir.join(WORKSTATION_CONFIG_FILE),
            config_dir,
            env_prefix: ENV_PREFIX.to_string(),
        })
    }

    /// Read environment overrides from `<prefix>__*` instead of `BAGSTREAM__*`
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load and validate the workstation configuration.
    ///
    /// # Returns
    /// The merged configuration; defaults plus environment overrides when the
    /// file doesn't exist
    pub fn load_workstation_config(&self) -> Result<WorkstationConfig> {
        let path = &self.workstation_config_path;
        if !path.exists() {
            tracing::warn!("Workstation config file not found at {}, using defaults", path);
        }

        let settings = Config::builder()
            .add_source(File::new(path.as_str(), FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read workstation config: {}", path))?;

        let config: WorkstationConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse workstation config: {}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid workstation config: {}", path))?;

        tracing::info!(
            "Loaded workstation config: role={}, pool={}, workers={}",
            config.role,
            config.pool_size(),
            config.worker_count
        );
        Ok(config)
    }

    /// Save the workstation configuration file.
    pub fn save_workstation_config(&self, config: &WorkstationConfig) -> Result<()> {
        let yaml_string = serde_yaml_ng::to_string(config)
            .context("Failed to serialize workstation config to YAML")?;

        fs::write(&self.workstation_config_path, yaml_string).with_context(|| {
            format!(
                "Failed to write workstation config: {}",
                self.workstation_config_path
            )
        })?;

        tracing::info!("Saved workstation config to {}", self.workstation_config_path);
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn workstation_config_path(&self) -> &Utf8Path {
        &self.workstation_config_path
    }
}

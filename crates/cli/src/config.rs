//! Configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use transport::{DeviceIdentity, TransferTiming};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfer: TransferTiming,
    #[serde(default)]
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Only consider instruments of this model
    #[serde(default)]
    pub model: Option<String>,
    /// Device to connect when none is given on the command line (hex)
    #[serde(default)]
    pub identifier: Option<String>,
}

impl DeviceSettings {
    pub fn identity(&self) -> Result<Option<DeviceIdentity>> {
        self.identifier
            .as_deref()
            .map(|id| {
                id.parse::<DeviceIdentity>()
                    .map_err(|e| anyhow!("Invalid device identifier '{}': {}", id, e))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Read capture data in small chunks by default
    #[serde(default = "CaptureSettings::default_chunked")]
    pub chunked: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunked: Self::default_chunked(),
        }
    }
}

impl CaptureSettings {
    fn default_chunked() -> bool {
        true
    }
}

impl ProbeConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/scope-usb/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ProbeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("scope-usb").join("config.toml")
        } else {
            PathBuf::from(".config/scope-usb/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if let Some(model) = &self.device.model
            && transport::model::find_model_by_name(model).is_none()
        {
            return Err(anyhow!("Unknown instrument model '{}'", model));
        }

        self.device.identity()?;

        if self.transfer.control_timeout_ms == 0 {
            return Err(anyhow!("control_timeout_ms must be greater than zero"));
        }

        if self.transfer.timeout_multi_ms == 0 {
            return Err(anyhow!("timeout_multi_ms must be greater than zero"));
        }

        Ok(())
    }
}

/// Expand `~` in a user-supplied config path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

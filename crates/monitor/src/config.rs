//! Monitor configuration management

use crate::capture::CaptureConfig;
use crate::lifecycle::{CameraFilter, ControllerOptions, PromptPolicy, VidPidFilter};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub devices: DeviceSettings,
    #[serde(default)]
    pub permission: PermissionSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "MonitorSettings::default_log_level")]
    pub log_level: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl MonitorSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Which attached devices are managed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Extra devices to manage even without a video interface (VID:PID)
    #[serde(default)]
    pub filters: Vec<String>,
    /// Ignore devices that are neither cameras nor in `filters`
    #[serde(default = "DeviceSettings::default_camera_only")]
    pub camera_only: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            camera_only: Self::default_camera_only(),
        }
    }
}

impl DeviceSettings {
    fn default_camera_only() -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionSettings {
    #[serde(default)]
    pub prompt_policy: PromptPolicy,
}

/// Capture defaults used when a device is opened
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Open every device as soon as permission is granted
    #[serde(default)]
    pub auto_open: bool,
    #[serde(flatten)]
    pub config: CaptureConfig,
}

impl MonitorConfig {
    /// Load configuration from file, or from the standard locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/uvc-monitor/monitor.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the standard locations, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("uvc-monitor").join("monitor.toml")
        } else {
            PathBuf::from(".config/uvc-monitor/monitor.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.devices.filters {
            filter
                .parse::<VidPidFilter>()
                .with_context(|| format!("Invalid device filter '{}'", filter))?;
        }

        let capture = &self.capture.config;
        if capture.preview_width == 0 || capture.preview_height == 0 {
            return Err(anyhow!(
                "Invalid preview size {}x{}, both dimensions must be non-zero",
                capture.preview_width,
                capture.preview_height
            ));
        }

        Ok(())
    }

    /// Camera filter built from the `[devices]` section
    pub fn camera_filter(&self) -> Result<CameraFilter> {
        if !self.devices.camera_only {
            return Ok(CameraFilter::admit_all());
        }
        CameraFilter::from_patterns(&self.devices.filters).context("Invalid device filter")
    }

    pub fn controller_options(&self) -> Result<ControllerOptions> {
        Ok(ControllerOptions {
            filter: self.camera_filter()?,
            prompt_policy: self.permission.prompt_policy,
        })
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<MonitorConfig> {
    MonitorConfig::load(Some(expand_path(path)))
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

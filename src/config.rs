//! Configuration for the device manager and the None device
//!
//! Stored as TOML in the platform configuration directory. Every field has a
//! default, so a partial file (or no file) is always valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::info::DeviceFilter;

const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub manager: ManagerConfig,
    pub none_device: NoneDeviceConfig,
}

impl AppConfig {
    /// Platform config path, e.g. `~/.config/audio-device-layer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "audio-device-layer", "audio-device-layer")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from the default path, falling back to defaults if the file
    /// does not exist
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.manager.timeouts;
        if t.rate_change_ms == 0 || t.rate_poll_ms == 0 || t.command_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if t.rate_poll_ms > t.rate_change_ms {
            return Err(Error::Config(
                "rate_poll_ms must not exceed rate_change_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Which native HAL family the manager drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Synchronous callback HAL (system audio through cpal)
    #[default]
    Callback,
    /// Thread-affine driver HAL (ASIO through cpal when built with `asio`)
    Driver,
}

/// What happens when a buffer size outside the supported set is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferSizePolicy {
    /// Reject with `NotSupported`
    Strict,
    /// Settle on the closest size the device accepts, larger sizes first
    #[default]
    Nearest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub backend: BackendKind,
    /// cpal host name (e.g. "ALSA", "JACK", "WASAPI"); default host if unset
    pub host: Option<String>,
    pub filter: DeviceFilter,
    pub buffer_size_policy: BufferSizePolicy,
    /// Re-enumerate at this interval when the HAL cannot report hot-plug.
    /// Zero disables polling.
    pub hotplug_poll_ms: u64,
    pub timeouts: TimeoutConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            host: None,
            filter: DeviceFilter::default(),
            buffer_size_policy: BufferSizePolicy::default(),
            hotplug_poll_ms: 2000,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn hotplug_poll(&self) -> Option<Duration> {
        (self.hotplug_poll_ms > 0).then(|| Duration::from_millis(self.hotplug_poll_ms))
    }
}

/// Bounds on every blocking control-plane wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum wait for a nominal rate change to take effect
    pub rate_change_ms: u64,
    /// Poll interval while waiting for a rate change
    pub rate_poll_ms: u64,
    /// Maximum wait for a reply from a device-processing thread
    pub command_ms: u64,
    /// Attempts to bring a driver back after a reset
    pub reinit_retries: u32,
    pub reinit_retry_delay_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rate_change_ms: 3000,
            rate_poll_ms: 10,
            command_ms: 5000,
            reinit_retries: 3,
            reinit_retry_delay_ms: 250,
        }
    }
}

impl TimeoutConfig {
    pub fn rate_change(&self) -> Duration {
        Duration::from_millis(self.rate_change_ms)
    }

    pub fn rate_poll(&self) -> Duration {
        Duration::from_millis(self.rate_poll_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn reinit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reinit_retry_delay_ms)
    }
}

/// Initial parameters of the None device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoneDeviceConfig {
    pub sample_rate: u32,
    pub buffer_size: u32,
}

impl Default for NoneDeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            buffer_size: crate::constants::DEFAULT_BUFFER_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.manager.timeouts.rate_change(), Duration::from_secs(3));
        assert_eq!(config.manager.timeouts.rate_poll(), Duration::from_millis(10));
    }

    #[test]
    fn test_partial_file() {
        let config = AppConfig::from_toml(
            r#"
            [manager]
            backend = "driver"
            filter = "input-only"
            buffer_size_policy = "strict"
            hotplug_poll_ms = 0

            [manager.timeouts]
            reinit_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.manager.backend, BackendKind::Driver);
        assert_eq!(config.manager.filter, DeviceFilter::InputOnly);
        assert_eq!(config.manager.buffer_size_policy, BufferSizePolicy::Strict);
        assert_eq!(config.manager.hotplug_poll(), None);
        assert_eq!(config.manager.timeouts.reinit_retries, 5);
        assert_eq!(config.manager.timeouts.command_ms, 5000);
        assert_eq!(config.none_device, NoneDeviceConfig::default());
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [manager.timeouts]
            rate_change_ms = 5
            rate_poll_ms = 50
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("adl-config-{}", std::process::id()));
        let path = dir.join(CONFIG_FILE);
        let mut config = AppConfig::default();
        config.manager.host = Some("ALSA".into());
        config.none_device.buffer_size = 256;

        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

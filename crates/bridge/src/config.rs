//! Bridge configuration management

use crate::enumerator::DeviceFilter;
use crate::identity::DEFAULT_BUS_PATH_PREFIX;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    pub usb: UsbSettings,
    /// Transfer pump tuning
    #[serde(default)]
    pub pump: PumpSettings,
    /// Control transfer settings
    #[serde(default)]
    pub control: ControlSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID filters, e.g. "0x16d0:0x063d" or "0x16d0:*" (empty = all devices)
    #[serde(default)]
    pub filters: Vec<String>,
    /// Prefix of OS device paths that encode bus and address
    #[serde(default = "UsbSettings::default_bus_path_prefix")]
    pub bus_path_prefix: String,
    /// Interface whose endpoints accept transfers
    #[serde(default)]
    pub transfer_interface: u8,
}

impl UsbSettings {
    fn default_bus_path_prefix() -> String {
        DEFAULT_BUS_PATH_PREFIX.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpSettings {
    /// Longest a pump waits before checking its stop flag
    #[serde(default = "PumpSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl PumpSettings {
    fn default_poll_interval() -> u64 {
        100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Timeout for string descriptor reads
    #[serde(default = "ControlSettings::default_timeout")]
    pub timeout_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout(),
        }
    }
}

impl ControlSettings {
    fn default_timeout() -> u64 {
        1000
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings {
                log_level: "info".to_string(),
            },
            usb: UsbSettings {
                filters: Vec::new(),
                bus_path_prefix: UsbSettings::default_bus_path_prefix(),
                transfer_interface: 0,
            },
            pump: PumpSettings::default(),
            control: ControlSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
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
            config_dir.join("usb-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usb-bridge/bridge.toml")
        }
    }

    /// Expand `~` in a user-supplied path
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).as_ref())
    }

    /// Parsed device filters
    ///
    /// Filters are checked by `validate`, so anything malformed here came
    /// from a config built in code and is skipped.
    pub fn device_filters(&self) -> Vec<DeviceFilter> {
        self.usb
            .filters
            .iter()
            .filter_map(|filter| {
                let parsed = DeviceFilter::parse(filter);
                if parsed.is_none() {
                    tracing::warn!("Ignoring malformed device filter '{}'", filter);
                }
                parsed
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pump.poll_interval_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control.timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.usb.bus_path_prefix.is_empty() || !self.usb.bus_path_prefix.ends_with('/') {
            return Err(anyhow!(
                "Invalid bus_path_prefix '{}', must be a non-empty path ending in '/'",
                self.usb.bus_path_prefix
            ));
        }

        if self.pump.poll_interval_ms == 0 {
            return Err(anyhow!("pump.poll_interval_ms must be greater than 0"));
        }

        if self.control.timeout_ms == 0 {
            return Err(anyhow!("control.timeout_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        filter
            .parse::<DeviceFilter>()
            .map(|_| ())
            .map_err(|reason| anyhow!(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.bridge.log_level, "info");
        assert!(config.usb.filters.is_empty());
        assert_eq!(config.usb.bus_path_prefix, "/dev/bus/usb/");
        assert_eq!(config.usb.transfer_interface, 0);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(BridgeConfig::validate_filter("0x16d0:0x063d").is_ok());
        assert!(BridgeConfig::validate_filter("0x16d0:*").is_ok());
        assert!(BridgeConfig::validate_filter("*:0x09e5").is_ok());
        assert!(BridgeConfig::validate_filter("*:*").is_ok());
        assert!(BridgeConfig::validate_filter("0XABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(BridgeConfig::validate_filter("16d0:063d").is_err());
        assert!(BridgeConfig::validate_filter("0x16d0").is_err());
        assert!(BridgeConfig::validate_filter("0x1:0x2:0x3").is_err());
        assert!(BridgeConfig::validate_filter("0xGHIJ:0x0001").is_err());
        assert!(BridgeConfig::validate_filter("0x12345:0x0001").is_err());
    }

    #[test]
    fn test_validated_filters_parse() {
        let mut config = BridgeConfig::default();
        config.usb.filters = vec!["0x16d0:0x063d".to_string(), "0x16d0:*".to_string()];
        assert!(config.validate().is_ok());

        let filters = config.device_filters();
        assert_eq!(filters.len(), 2);
        assert!(filters[0].matches(0x16d0, 0x063d));
        assert!(!filters[0].matches(0x16d0, 0x09e5));
        assert!(filters[1].matches(0x16d0, 0x09e5));
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.bridge.log_level, parsed.bridge.log_level);
        assert_eq!(config.pump.poll_interval_ms, parsed.pump.poll_interval_ms);
    }

    #[test]
    fn test_optional_sections_default() {
        let parsed: BridgeConfig = toml::from_str(
            r#"
            [bridge]
            log_level = "debug"

            [usb]
            filters = ["0x16d0:*"]
            "#,
        )
        .unwrap();

        assert_eq!(parsed.usb.bus_path_prefix, "/dev/bus/usb/");
        assert_eq!(parsed.control.timeout_ms, 1000);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.bridge.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.pump.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.usb.bus_path_prefix = "/dev/bus/usb".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path() {
        let expanded = BridgeConfig::expand_path("/etc/usb-bridge/bridge.toml");
        assert_eq!(expanded, PathBuf::from("/etc/usb-bridge/bridge.toml"));
    }
}

//! Client configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{BUS_ID_SIZE, BusId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::network::DeviceLocation;

/// Default USB/IP TCP port
pub const DEFAULT_TCP_PORT: &str = "3240";

/// Default number of ports on the virtual root hub
pub const DEFAULT_VHCI_PORTS: usize = 16;

/// Most ports a USB hub can declare
pub const MAX_VHCI_PORTS: usize = 127;

/// A previously used device location, persisted for reconnect-on-boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDevice {
    /// Remote host name or address
    pub host: String,
    /// Port or service; falls back to `network.tcp_port` when missing
    #[serde(default)]
    pub service: Option<String>,
    /// Bus-id on the remote host
    pub busid: String,
    /// Import this device when the client starts in `auto` mode
    #[serde(default)]
    pub auto_import: bool,
}

impl PersistedDevice {
    /// Resolve into a full location using `default_service` if needed
    pub fn location(&self, default_service: &str) -> Result<DeviceLocation> {
        let busid = BusId::new(self.busid.as_str())
            .with_context(|| format!("Invalid busid for host {}", self.host))?;
        Ok(DeviceLocation {
            host: self.host.clone(),
            service: self
                .service
                .clone()
                .unwrap_or_else(|| default_service.to_string()),
            busid,
        })
    }

    fn matches(&self, location: &DeviceLocation, default_service: &str) -> bool {
        self.host == location.host
            && self.busid == location.busid.as_str()
            && self.service.as_deref().unwrap_or(default_service) == location.service
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub vhci: VhciSettings,
    #[serde(default)]
    pub devices: Vec<PersistedDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Service used when a location does not name one
    #[serde(default = "default_tcp_port")]
    pub tcp_port: String,
    /// Per-candidate connect timeout in seconds, 0 disables it
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub keepalive: KeepaliveSettings,
}

/// TCP keepalive tuning applied to every session connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveSettings {
    /// Idle time before the first probe
    pub idle_secs: u32,
    /// Unanswered probes before the connection is dropped
    pub count: u32,
    /// Time between probes
    pub interval_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhciSettings {
    /// Capacity of the virtual root hub
    #[serde(default = "default_vhci_ports")]
    pub ports: usize,
}

fn default_tcp_port() -> String {
    DEFAULT_TCP_PORT.to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_vhci_ports() -> usize {
    DEFAULT_VHCI_PORTS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                log_level: "info".to_string(),
            },
            network: NetworkSettings::default(),
            vhci: VhciSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive: KeepaliveSettings::default(),
        }
    }
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            count: 9,
            interval_secs: 10,
        }
    }
}

impl Default for VhciSettings {
    fn default() -> Self {
        Self {
            ports: default_vhci_ports(),
        }
    }
}

impl KeepaliveSettings {
    /// Time until a dead peer is detected: `idle + count * interval`
    pub fn horizon_secs(&self) -> u64 {
        u64::from(self.idle_secs) + u64::from(self.count) * u64::from(self.interval_secs)
    }
}

impl NetworkSettings {
    /// Connect timeout per candidate address, `None` when disabled
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }
}

impl ClientConfig {
    /// Whether a location is persisted with auto-import enabled
    pub fn should_auto_import(&self, location: &DeviceLocation) -> bool {
        self.devices
            .iter()
            .any(|d| d.auto_import && d.matches(location, &self.network.tcp_port))
    }

    /// Locations to import on startup
    ///
    /// Entries that fail to resolve are skipped with a warning.
    pub fn auto_import_locations(&self) -> Vec<DeviceLocation> {
        self.devices
            .iter()
            .filter(|d| d.auto_import)
            .filter_map(|d| match d.location(&self.network.tcp_port) {
                Ok(location) => Some(location),
                Err(e) => {
                    tracing::warn!("Skipping persisted device: {:#}", e);
                    None
                }
            })
            .collect()
    }

    /// Remember a location, updating its auto-import flag if already known
    pub fn remember(&mut self, location: &DeviceLocation, auto_import: bool) {
        let default_service = self.network.tcp_port.clone();
        if let Some(existing) = self
            .devices
            .iter_mut()
            .find(|d| d.matches(location, &default_service))
        {
            existing.auto_import = auto_import;
            return;
        }

        self.devices.push(PersistedDevice {
            host: location.host.clone(),
            service: (location.service != default_service).then(|| location.service.clone()),
            busid: location.busid.to_string(),
            auto_import,
        });
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-client/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: {} persisted devices, {} vhci ports",
            config.devices.len(),
            config.vhci.ports
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
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
            config_dir.join("usbip-client").join("client.toml")
        } else {
            PathBuf::from(".config/usbip-client/client.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if !(1..=MAX_VHCI_PORTS).contains(&self.vhci.ports) {
            return Err(anyhow!(
                "Invalid vhci port count {}, must be between 1 and {}",
                self.vhci.ports,
                MAX_VHCI_PORTS
            ));
        }

        if self.network.tcp_port.is_empty() {
            return Err(anyhow!("Empty tcp_port"));
        }

        let ka = &self.network.keepalive;
        if ka.idle_secs == 0 || ka.count == 0 || ka.interval_secs == 0 {
            return Err(anyhow!(
                "Keepalive values must be positive (idle={}, count={}, interval={})",
                ka.idle_secs,
                ka.count,
                ka.interval_secs
            ));
        }

        for device in &self.devices {
            if device.host.is_empty() {
                return Err(anyhow!("Empty host in persisted device list"));
            }
            if device.busid.is_empty() || device.busid.len() >= BUS_ID_SIZE {
                return Err(anyhow!(
                    "Invalid busid '{}' for host {}",
                    device.busid,
                    device.host
                ));
            }
        }

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<ClientConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ClientConfig::load(Some(path_buf))
}

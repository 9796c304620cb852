//! Configuration management for vpnctl

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::diagnostics::{default_local_address_markers, LogMarkers};
use crate::error::{VpnError, VpnResult};
use crate::settings::{CredentialRef, SelectedProtocol, Server, Settings};
use crate::trust::{ConfiguredTrustPolicy, NetworkTrust, ProtectionSettings};
use crate::tunnel::command::{default_backend_commands, BackendCommands};
use crate::tunnel::{PerKind, TunnelKind};

/// Main vpnctl configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnctlConfig {
    #[serde(default)]
    pub paths: ConfigPaths,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub account: AccountSettings,
    #[serde(default)]
    pub protocol: SelectedProtocol,
    /// Servers available for selection
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Id of the selected server
    #[serde(default)]
    pub selected_server: Option<String>,
    /// Re-select the lowest latency server on every connect
    #[serde(default)]
    pub fastest_server: bool,
    /// Per-kind command overrides; kinds left out use the built-in commands
    #[serde(default)]
    pub backends: PerKind<Option<BackendCommands>>,
    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Runtime state directory (status, tunnel configurations, rules)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Log snapshot directory
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Grace period a Connected signal must survive (milliseconds)
    #[serde(default = "default_connect_grace_ms")]
    pub connect_grace_ms: u64,
    /// Delay before re-arming on-demand rules after disconnect (milliseconds)
    #[serde(default = "default_rule_reinstall_ms")]
    pub rule_reinstall_ms: u64,
    /// Delay before suspending after a shortcut (milliseconds)
    #[serde(default = "default_close_app_ms")]
    pub close_app_ms: u64,
    /// Network observer poll interval (seconds)
    #[serde(default = "default_network_poll_secs")]
    pub network_poll_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_connect_on_untrusted: bool,
    #[serde(default)]
    pub auto_disconnect_on_trusted: bool,
    /// Trust for networks without a stored value
    #[serde(default)]
    pub default_trust: NetworkTrust,
    /// Stored trust by network name (SSID or interface)
    #[serde(default)]
    pub networks: HashMap<String, NetworkTrust>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    #[serde(default)]
    pub username: String,
    /// Reference to the stored credential, never the password
    #[serde(default)]
    pub credential_ref: CredentialRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSettings {
    /// Markers around the tunnel-assigned address in each backend's log
    #[serde(default = "default_local_address_markers")]
    pub markers: PerKind<LogMarkers>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/vpnctl")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/vpnctl")
}

fn default_connect_grace_ms() -> u64 {
    250
}

fn default_rule_reinstall_ms() -> u64 {
    2000
}

fn default_close_app_ms() -> u64 {
    1500
}

fn default_network_poll_secs() -> u64 {
    2
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            connect_grace_ms: default_connect_grace_ms(),
            rule_reinstall_ms: default_rule_reinstall_ms(),
            close_app_ms: default_close_app_ms(),
            network_poll_secs: default_network_poll_secs(),
        }
    }
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            markers: default_local_address_markers(),
        }
    }
}

impl Default for VpnctlConfig {
    fn default() -> Self {
        Self {
            paths: ConfigPaths::default(),
            timing: TimingSettings::default(),
            protection: ProtectionConfig::default(),
            account: AccountSettings::default(),
            protocol: SelectedProtocol::default(),
            servers: Vec::new(),
            selected_server: None,
            fastest_server: false,
            backends: PerKind::default(),
            diagnostics: DiagnosticsSettings::default(),
        }
    }
}

impl VpnctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::Config(format!("Failed to read config {:?}: {}", path.as_ref(), e)))?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnResult<()> {
        let content = self.to_toml()?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnError::Config(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    pub fn to_toml(&self) -> VpnResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> VpnResult<()> {
        if let Some(id) = &self.selected_server {
            if !self.servers.iter().any(|s| &s.id == id) {
                return Err(VpnError::Config(format!("Selected server '{}' is not in the server list", id)));
            }
        }
        if self.timing.network_poll_secs == 0 {
            return Err(VpnError::Config("timing.network_poll_secs must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> VpnResult<()> {
        for dir in [&self.paths.state_dir, &self.paths.log_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| VpnError::Config(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    /// Initial contents of the shared settings store
    pub fn settings(&self) -> Settings {
        let selected_server = self
            .selected_server
            .as_ref()
            .and_then(|id| self.servers.iter().find(|s| &s.id == id))
            .cloned();

        Settings {
            servers: self.servers.clone(),
            selected_server,
            fastest_server: self.fastest_server,
            protocol: self.protocol.clone(),
            username: self.account.username.clone(),
            credential_ref: self.account.credential_ref.clone(),
        }
    }

    pub fn protection_settings(&self) -> ProtectionSettings {
        ProtectionSettings {
            enabled: self.protection.enabled,
            auto_connect_on_untrusted: self.protection.auto_connect_on_untrusted,
            auto_disconnect_on_trusted: self.protection.auto_disconnect_on_trusted,
        }
    }

    pub fn trust_policy(&self) -> ConfiguredTrustPolicy {
        ConfiguredTrustPolicy::new(
            self.protection.networks.clone(),
            self.protection.default_trust,
            self.protection_settings(),
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            connect_grace: Duration::from_millis(self.timing.connect_grace_ms),
            rule_reinstall_delay: Duration::from_millis(self.timing.rule_reinstall_ms),
            close_app_delay: Duration::from_millis(self.timing.close_app_ms),
            local_address_markers: self.diagnostics.markers.clone(),
        }
    }

    /// Command lines for every kind, overrides applied
    pub fn backend_commands(&self) -> PerKind<BackendCommands> {
        let mut commands = default_backend_commands();
        for kind in TunnelKind::ALL {
            if let Some(custom) = self.backends.get(kind) {
                *commands.get_mut(kind) = custom.clone();
            }
        }
        commands
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_secs(self.timing.network_poll_secs)
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{VpnError, VpnResult};
use crate::settings::{AccessDetails, CredentialRef, ProtocolParams};
use super::backend::{TunnelBackend, TunnelBackendFactory, TunnelEventBus};
use super::{common, ConnectionState, PerKind, TunnelKind};

/// Bytes of the backend log file included in a snapshot
const LOG_TAIL_BYTES: u64 = 64 * 1024;

/// Command lines driving one tunnel kind
///
/// Arguments may contain `{server}`, `{username}`, `{credential}`,
/// `{interface}` and `{<param>}` placeholders, filled from the configured
/// access details and protocol parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCommands {
    /// Interface whose presence means the tunnel is up
    pub interface: String,
    /// Brings the tunnel up
    pub up: Vec<String>,
    /// Tears the tunnel down
    pub down: Vec<String>,
    /// Optional probe; success means the tunnel is up. Overrides `interface`.
    pub status: Vec<String>,
    /// Log file written by the tunnel daemon
    pub log_file: Option<PathBuf>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Command lines for wg-quick, openvpn and strongSwan
pub fn default_backend_commands() -> PerKind<BackendCommands> {
    PerKind {
        ipsec: BackendCommands {
            interface: String::new(),
            up: argv(&["ipsec", "up", "vpnctl"]),
            down: argv(&["ipsec", "down", "vpnctl"]),
            status: argv(&["sh", "-c", "ipsec status vpnctl | grep -q ESTABLISHED"]),
            log_file: Some(PathBuf::from("/var/log/charon.log")),
        },
        openvpn: BackendCommands {
            interface: "tun-vpnctl".to_string(),
            up: argv(&[
                "openvpn", "--daemon", "--config", "/etc/openvpn/client/vpnctl.conf",
                "--remote", "{server}", "--dev", "{interface}", "--dev-type", "tun",
                "--auth-user-pass", "{credential}", "--log", "/var/log/vpnctl/openvpn.log",
            ]),
            down: argv(&["pkill", "-TERM", "-f", "/etc/openvpn/client/vpnctl.conf"]),
            status: Vec::new(),
            log_file: Some(PathBuf::from("/var/log/vpnctl/openvpn.log")),
        },
        wireguard: BackendCommands {
            interface: "wg-vpnctl".to_string(),
            up: argv(&["wg-quick", "up", "/etc/wireguard/wg-vpnctl.conf"]),
            down: argv(&["wg-quick", "down", "/etc/wireguard/wg-vpnctl.conf"]),
            status: Vec::new(),
            log_file: None,
        },
    }
}

/// Access details and parameters persisted by `configure`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredConfiguration {
    server_address: String,
    username: String,
    credential_ref: CredentialRef,
    #[serde(default)]
    params: ProtocolParams,
}

/// Persisted on-demand rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDemandRule {
    pub kind: TunnelKind,
    /// Status the rule was installed for
    pub armed_for: ConnectionState,
    pub enabled: bool,
    pub installed_at: String,
}

#[derive(Debug, Default)]
struct Inner {
    configuration: Option<StoredConfiguration>,
    /// Transition in flight, reported in place of the probed status
    transition: Option<ConnectionState>,
    /// Output captured from the last up/down commands
    output: String,
}

/// Tunnel backend driven by external command lines
///
/// The tunnel daemons themselves (wg-quick, openvpn, charon) do the work;
/// this backend starts and stops them, probes their status and publishes
/// every transition on the event bus.
pub struct CommandBackend {
    kind: TunnelKind,
    commands: BackendCommands,
    state_dir: PathBuf,
    bus: TunnelEventBus,
    inner: Arc<Mutex<Inner>>,
}

impl CommandBackend {
    pub fn new(kind: TunnelKind, commands: BackendCommands, state_dir: PathBuf, bus: TunnelEventBus) -> Self {
        Self {
            kind,
            commands,
            state_dir,
            bus,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Factory producing a command backend per kind
    pub fn factory(commands: PerKind<BackendCommands>, state_dir: PathBuf, bus: TunnelEventBus) -> TunnelBackendFactory {
        Arc::new(move |kind| {
            Arc::new(CommandBackend::new(kind, commands.get(kind).clone(), state_dir.clone(), bus.clone()))
                as Arc<dyn TunnelBackend>
        })
    }

    fn configuration_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.kind))
    }

    fn rule_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.ondemand.json", self.kind))
    }

    /// The installed on-demand rule, if any
    pub async fn on_demand_rule(&self) -> Option<OnDemandRule> {
        let content = tokio::fs::read_to_string(self.rule_path()).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Stored configuration, loading it from disk on first use
    async fn configuration(&self) -> Option<StoredConfiguration> {
        let mut inner = self.inner.lock().await;
        if inner.configuration.is_none() {
            let content = tokio::fs::read_to_string(self.configuration_path()).await.ok()?;
            match serde_json::from_str(&content) {
                Ok(stored) => inner.configuration = Some(stored),
                Err(e) => warn!("Ignoring unreadable {} configuration: {}", self.kind, e),
            }
        }
        inner.configuration.clone()
    }

    fn render(&self, template: &[String], stored: &StoredConfiguration) -> Vec<String> {
        let mut vars: Vec<(String, String)> = vec![
            ("server".to_string(), stored.server_address.clone()),
            ("username".to_string(), stored.username.clone()),
            ("credential".to_string(), stored.credential_ref.as_str().to_string()),
            ("interface".to_string(), self.commands.interface.clone()),
        ];
        for (key, value) in &stored.params {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.push((key.clone(), value));
        }

        let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        common::render_args(template, &vars)
    }

    /// Run a command in the background, recording its output and publishing
    /// the resulting transitions
    fn spawn_transition(&self, argv: Vec<String>, connecting: bool) {
        let kind = self.kind;
        let bus = self.bus.clone();
        let inner = self.inner.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let result = common::run_command(&argv).await;
            let mut guard = inner.lock().await;
            guard.transition = None;

            match result {
                Ok(output) => {
                    guard.output.push_str(&output);
                    drop(guard);
                    if connecting {
                        info!("{} tunnel up", kind);
                        bus.publish(kind, ConnectionState::Connected);
                    } else {
                        info!("{} tunnel down", kind);
                        bus.publish(kind, ConnectionState::Disconnected);
                    }
                }
                Err(e) => {
                    warn!("{} command failed: {}", kind, e);
                    guard.output.push_str(&format!("{}\n", e));
                    drop(guard);
                    if connecting {
                        bus.publish(kind, ConnectionState::Disconnecting);
                        bus.publish(kind, ConnectionState::Disconnected);
                    } else if probe(&commands).await {
                        warn!("{} tunnel still up after failed teardown", kind);
                        bus.publish(kind, ConnectionState::Connected);
                    } else {
                        bus.publish(kind, ConnectionState::Disconnected);
                    }
                }
            }
        });
    }

    async fn set_transition(&self, state: ConnectionState) {
        let mut inner = self.inner.lock().await;
        inner.transition = Some(state);
        if state == ConnectionState::Connecting {
            inner.output.clear();
        }
    }
}

#[async_trait]
impl TunnelBackend for CommandBackend {
    async fn status(&self) -> ConnectionState {
        if let Some(transition) = self.inner.lock().await.transition {
            return transition;
        }
        if self.configuration().await.is_none() {
            return ConnectionState::Invalid;
        }
        if probe(&self.commands).await {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn configure(&self, params: &ProtocolParams, access: &AccessDetails) -> VpnResult<()> {
        if self.commands.up.is_empty() || self.commands.down.is_empty() {
            return Err(VpnError::Configuration {
                kind: self.kind,
                reason: "no up/down commands configured".to_string(),
            });
        }
        if access.server_address.trim().is_empty() {
            return Err(VpnError::Configuration {
                kind: self.kind,
                reason: "missing server address".to_string(),
            });
        }

        let stored = StoredConfiguration {
            server_address: access.server_address.clone(),
            username: access.username.clone(),
            credential_ref: access.password_ref.clone(),
            params: params.clone(),
        };

        common::ensure_directory_exists(&self.state_dir).await?;
        tokio::fs::write(self.configuration_path(), serde_json::to_string_pretty(&stored)?).await?;
        self.inner.lock().await.configuration = Some(stored);

        debug!("Configured {} for {}", self.kind, access.server_address);
        Ok(())
    }

    async fn connect(&self) -> VpnResult<()> {
        let stored = self.configuration().await.ok_or_else(|| {
            VpnError::InvalidState(format!("{} tunnel is not configured", self.kind))
        })?;

        if let Some(binary) = self.commands.up.first() {
            if !common::check_binary_available(binary).await {
                warn!("{} not found in PATH, {} connect will likely fail", binary, self.kind);
            }
        }

        let argv = self.render(&self.commands.up, &stored);
        info!("Starting {} tunnel to {}", self.kind, stored.server_address);
        self.set_transition(ConnectionState::Connecting).await;
        self.bus.publish(self.kind, ConnectionState::Connecting);
        self.spawn_transition(argv, true);
        Ok(())
    }

    async fn disconnect(&self, reconnect: bool) -> VpnResult<()> {
        let Some(stored) = self.configuration().await else {
            debug!("{} tunnel not configured, nothing to disconnect", self.kind);
            return Ok(());
        };

        let argv = self.render(&self.commands.down, &stored);
        info!("Stopping {} tunnel (reconnect: {})", self.kind, reconnect);
        self.set_transition(ConnectionState::Disconnecting).await;
        self.bus.publish(self.kind, ConnectionState::Disconnecting);
        self.spawn_transition(argv, false);
        Ok(())
    }

    async fn install_on_demand_rule(&self, status: ConnectionState) -> VpnResult<()> {
        let rule = OnDemandRule {
            kind: self.kind,
            armed_for: status,
            enabled: true,
            installed_at: chrono::Utc::now().to_rfc3339(),
        };
        common::ensure_directory_exists(&self.state_dir).await?;
        tokio::fs::write(self.rule_path(), serde_json::to_string_pretty(&rule)?).await?;
        debug!("Installed {} on-demand rule for {}", self.kind, status);
        Ok(())
    }

    async fn remove_on_demand_rule(&self) -> VpnResult<()> {
        common::delete_file(&self.rule_path()).await
    }

    async fn remove_configuration(&self) -> VpnResult<()> {
        self.inner.lock().await.configuration = None;
        common::delete_file(&self.rule_path()).await?;
        common::delete_file(&self.configuration_path()).await?;
        info!("Removed {} configuration", self.kind);
        Ok(())
    }

    async fn last_log_snapshot(&self) -> Option<String> {
        let mut snapshot = match &self.commands.log_file {
            Some(path) => read_log(path).await,
            None => String::new(),
        };
        snapshot.push_str(&self.inner.lock().await.output);

        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    async fn server_address(&self) -> Option<String> {
        self.configuration().await.map(|stored| stored.server_address)
    }
}

/// Whether the tunnel is up; the status command wins over the interface check
async fn probe(commands: &BackendCommands) -> bool {
    if !commands.status.is_empty() {
        return common::run_command(&commands.status).await.is_ok();
    }
    !commands.interface.is_empty() && common::interface_exists(&commands.interface).await
}

async fn read_log(path: &Path) -> String {
    match common::read_log_tail(path, LOG_TAIL_BYTES).await {
        Ok(text) => text,
        Err(e) => {
            debug!("No log at {:?}: {}", path, e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelEvent;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn access() -> AccessDetails {
        AccessDetails {
            server_address: "nl1.vpn.example.net".to_string(),
            username: "alice".to_string(),
            password_ref: CredentialRef::new("/run/vpnctl/alice"),
        }
    }

    fn shell_commands(up: &str, status: &str) -> BackendCommands {
        BackendCommands {
            interface: String::new(),
            up: argv(&["sh", "-c", up]),
            down: argv(&["sh", "-c", "true"]),
            status: argv(&["sh", "-c", status]),
            log_file: None,
        }
    }

    async fn next_state(rx: &mut broadcast::Receiver<TunnelEvent>) -> ConnectionState {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(
            TunnelKind::WireGuard,
            default_backend_commands().wireguard,
            dir.path().to_path_buf(),
            TunnelEventBus::new(),
        );
        assert_eq!(backend.status().await, ConnectionState::Invalid);
        assert!(backend.connect().await.is_err());
        assert!(backend.server_address().await.is_none());
    }

    #[tokio::test]
    async fn test_configure_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let bus = TunnelEventBus::new();
        let commands = shell_commands("true", "false");

        let backend = CommandBackend::new(TunnelKind::OpenVpn, commands.clone(), dir.path().to_path_buf(), bus.clone());
        backend.configure(&HashMap::new(), &access()).await.unwrap();

        let reopened = CommandBackend::new(TunnelKind::OpenVpn, commands, dir.path().to_path_buf(), bus);
        assert_eq!(reopened.server_address().await.as_deref(), Some("nl1.vpn.example.net"));
        assert_eq!(reopened.status().await, ConnectionState::Disconnected);

        reopened.remove_configuration().await.unwrap();
        assert_eq!(reopened.status().await, ConnectionState::Invalid);
    }

    #[tokio::test]
    async fn test_configure_rejects_missing_server() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(
            TunnelKind::IPsec,
            shell_commands("true", "true"),
            dir.path().to_path_buf(),
            TunnelEventBus::new(),
        );
        let mut details = access();
        details.server_address = " ".to_string();

        let err = backend.configure(&HashMap::new(), &details).await.unwrap_err();
        assert!(matches!(err, VpnError::Configuration { kind: TunnelKind::IPsec, .. }));
    }

    #[tokio::test]
    async fn test_connect_publishes_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let bus = TunnelEventBus::new();
        let mut rx = bus.subscribe();
        let backend = CommandBackend::new(
            TunnelKind::WireGuard,
            shell_commands("echo Address = 10.2.0.2/32", "true"),
            dir.path().to_path_buf(),
            bus,
        );

        backend.configure(&HashMap::new(), &access()).await.unwrap();
        backend.connect().await.unwrap();

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connected);
        assert_eq!(backend.status().await, ConnectionState::Connected);

        let log = backend.last_log_snapshot().await.unwrap();
        assert!(log.contains("Address = 10.2.0.2/32"));
    }

    #[tokio::test]
    async fn test_failed_connect_drops_through_disconnecting() {
        let dir = tempfile::tempdir().unwrap();
        let bus = TunnelEventBus::new();
        let mut rx = bus.subscribe();
        let backend = CommandBackend::new(
            TunnelKind::OpenVpn,
            shell_commands("echo auth failed >&2; exit 1", "false"),
            dir.path().to_path_buf(),
            bus,
        );

        backend.configure(&HashMap::new(), &access()).await.unwrap();
        backend.connect().await.unwrap();

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnected);
        assert!(backend.last_log_snapshot().await.unwrap().contains("auth failed"));
    }

    #[tokio::test]
    async fn test_failed_teardown_reports_probed_status() {
        let dir = tempfile::tempdir().unwrap();
        let bus = TunnelEventBus::new();
        let mut rx = bus.subscribe();
        let mut commands = shell_commands("true", "true");
        commands.down = argv(&["sh", "-c", "echo device busy >&2; exit 1"]);
        let backend = CommandBackend::new(TunnelKind::WireGuard, commands, dir.path().to_path_buf(), bus);

        backend.configure(&HashMap::new(), &access()).await.unwrap();
        backend.disconnect(false).await.unwrap();

        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connected);
        assert_eq!(backend.status().await, ConnectionState::Connected);
        assert!(backend.last_log_snapshot().await.unwrap().contains("device busy"));
    }

    #[tokio::test]
    async fn test_failed_teardown_of_dead_tunnel_reports_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let bus = TunnelEventBus::new();
        let mut rx = bus.subscribe();
        let mut commands = shell_commands("true", "false");
        commands.down = argv(&["sh", "-c", "exit 1"]);
        let backend = CommandBackend::new(TunnelKind::OpenVpn, commands, dir.path().to_path_buf(), bus);

        backend.configure(&HashMap::new(), &access()).await.unwrap();
        backend.disconnect(false).await.unwrap();

        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_on_demand_rule_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(
            TunnelKind::WireGuard,
            shell_commands("true", "true"),
            dir.path().to_path_buf(),
            TunnelEventBus::new(),
        );

        backend.install_on_demand_rule(ConnectionState::Connected).await.unwrap();
        let rule = backend.on_demand_rule().await.unwrap();
        assert_eq!(rule.armed_for, ConnectionState::Connected);
        assert!(rule.enabled);

        backend.remove_on_demand_rule().await.unwrap();
        assert!(backend.on_demand_rule().await.is_none());
        backend.remove_on_demand_rule().await.unwrap();
    }

    #[test]
    fn test_render_with_params() {
        let backend = CommandBackend::new(
            TunnelKind::OpenVpn,
            default_backend_commands().openvpn,
            PathBuf::from("/tmp"),
            TunnelEventBus::new(),
        );
        let mut params = HashMap::new();
        params.insert("port".to_string(), serde_json::json!(1194));
        let stored = StoredConfiguration {
            server_address: "de2.vpn.example.net".to_string(),
            username: "bob".to_string(),
            credential_ref: CredentialRef::new("/run/creds/bob"),
            params,
        };

        let args = backend.render(&argv(&["openvpn", "--remote", "{server}", "{port}", "--dev", "{interface}"]), &stored);
        assert_eq!(args, vec!["openvpn", "--remote", "de2.vpn.example.net", "1194", "--dev", "tun-vpnctl"]);
    }
}

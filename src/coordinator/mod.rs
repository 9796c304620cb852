//! Connection coordinator
//!
//! Presents one connection status for the three tunnel backends, drives
//! connect / disconnect / reconnect requests, keeps on-demand rules in line
//! with the connection, and applies network protection policy.
//!
//! A single task owns the coordinator state. The `ConnectionCoordinator`
//! handle forwards requests to it over a channel, and the task also consumes
//! the backend event stream and its own timers, so every state change happens
//! in one place and in order.

mod actor;
pub mod state;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::diagnostics::{default_local_address_markers, Diagnostics, LogMarkers};
use crate::error::{VpnError, VpnResult};
use crate::lifecycle::AppLifecycle;
use crate::settings::{ServerSelector, SettingsStore};
use crate::status_store::StatusStore;
use crate::trust::TrustPolicy;
use crate::tunnel::{BackendRegistry, ConnectionState, PerKind, TunnelEventBus, TunnelKind};

pub use state::{CoordinatorState, PendingConfirmation};

/// Notifications for observers (UI, automation)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// The aggregated status changed
    StatusChanged { kind: TunnelKind, state: ConnectionState },
    /// A connect attempt fell over before it was confirmed
    ConnectError { kind: TunnelKind },
    /// Manual connect refused on a trusted network; the caller should offer
    /// its fallback action
    ConnectVetoed,
    /// Manual disconnect refused on an untrusted network
    DisconnectVetoed,
    /// Tunnel-assigned local address found in the backend log
    LocalAddress { kind: TunnelKind, address: String },
}

/// Connect/disconnect requests that also suspend the app when done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    Connect,
    Disconnect,
    ResetRulesAndConnect { close_app: bool },
    ResetRulesAndDisconnect { close_app: bool },
}

impl Shortcut {
    pub fn closes_app(self) -> bool {
        match self {
            Shortcut::Connect | Shortcut::Disconnect => true,
            Shortcut::ResetRulesAndConnect { close_app } => close_app,
            Shortcut::ResetRulesAndDisconnect { close_app } => close_app,
        }
    }

    pub fn is_connect(self) -> bool {
        matches!(self, Shortcut::Connect | Shortcut::ResetRulesAndConnect { .. })
    }

    /// Whether on-demand rules are always cleared first
    pub fn resets_rules(self) -> bool {
        matches!(
            self,
            Shortcut::ResetRulesAndConnect { .. } | Shortcut::ResetRulesAndDisconnect { .. }
        )
    }
}

/// Delays and log markers used by the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a Connected signal must hold before it is trusted
    pub connect_grace: Duration,
    /// Delay before re-arming on-demand rules after a manual disconnect
    pub rule_reinstall_delay: Duration,
    /// Delay before suspending the app after a shortcut completes
    pub close_app_delay: Duration,
    pub local_address_markers: PerKind<LogMarkers>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connect_grace: Duration::from_millis(250),
            rule_reinstall_delay: Duration::from_secs(2),
            close_app_delay: Duration::from_millis(1500),
            local_address_markers: default_local_address_markers(),
        }
    }
}

/// Collaborators the coordinator is built from
pub struct CoordinatorDeps {
    pub registry: Arc<BackendRegistry>,
    pub events: TunnelEventBus,
    pub settings: SettingsStore,
    pub trust: Arc<dyn TrustPolicy>,
    pub selector: Arc<dyn ServerSelector>,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub lifecycle: Arc<dyn AppLifecycle>,
    pub status_store: Arc<dyn StatusStore>,
    pub config: CoordinatorConfig,
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect { reconnect_automatically: bool },
    Reconnect,
    Shortcut(Shortcut),
    ResetOnDemandRules,
    RemoveOnDemandRules { done: oneshot::Sender<()> },
    EvaluateConnection,
    Settle { done: oneshot::Sender<()> },
}

#[derive(Debug)]
enum Timer {
    ReinstallRules(TunnelKind),
    Suspend,
}

#[derive(Debug)]
enum Message {
    Command(Command),
    Timer(Timer),
    Shutdown,
}

/// Handle to the running coordinator. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionCoordinator {
    tx: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<CoordinatorEvent>,
    status: watch::Receiver<ConnectionState>,
    local_address: watch::Receiver<Option<String>>,
    registry: Arc<BackendRegistry>,
    settings: SettingsStore,
}

impl ConnectionCoordinator {
    /// Start the coordinator task.
    ///
    /// The persisted status is restored first so observers have something to
    /// show until the first live query completes. The backend event stream is
    /// subscribed here, before anything can publish on it.
    pub async fn start(deps: CoordinatorDeps) -> Self {
        let restored = deps.status_store.load().await.unwrap_or_default();
        info!("Starting connection coordinator (restored status: {})", restored);

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (status_tx, status) = watch::channel(restored);
        let (address_tx, local_address) = watch::channel(None);

        let handle = Self {
            tx: tx.clone(),
            events: events.clone(),
            status,
            local_address,
            registry: deps.registry.clone(),
            settings: deps.settings.clone(),
        };

        let backend_events = deps.events.subscribe();
        let actor = actor::CoordinatorActor::new(deps, restored, tx, events, status_tx, address_tx).await;
        tokio::spawn(actor.run(rx, backend_events));

        handle
    }

    /// Subscribe to status changes and error notices
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Last known aggregated status
    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Watch the aggregated status
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Local tunnel address extracted from the last confirmed connection
    pub fn local_address(&self) -> Option<String> {
        self.local_address.borrow().clone()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    fn send(&self, command: Command) -> VpnResult<()> {
        self.tx
            .send(Message::Command(command))
            .map_err(|_| VpnError::CoordinatorStopped)
    }

    /// Connect the selected protocol to the selected (or fastest) server
    pub fn connect(&self) -> VpnResult<()> {
        self.send(Command::Connect)
    }

    /// Disconnect whichever tunnel is active
    pub fn disconnect(&self, reconnect_automatically: bool) -> VpnResult<()> {
        self.send(Command::Disconnect { reconnect_automatically })
    }

    /// Tear down and bring the tunnel back up. The connect happens once the
    /// backend reports Disconnected.
    pub fn reconnect(&self) -> VpnResult<()> {
        self.send(Command::Reconnect)
    }

    pub fn shortcut(&self, shortcut: Shortcut) -> VpnResult<()> {
        self.send(Command::Shortcut(shortcut))
    }

    pub fn connect_shortcut(&self) -> VpnResult<()> {
        self.shortcut(Shortcut::Connect)
    }

    pub fn disconnect_shortcut(&self) -> VpnResult<()> {
        self.shortcut(Shortcut::Disconnect)
    }

    pub fn reset_rules_and_connect_shortcut(&self, close_app: bool) -> VpnResult<()> {
        self.shortcut(Shortcut::ResetRulesAndConnect { close_app })
    }

    pub fn reset_rules_and_disconnect_shortcut(&self, close_app: bool) -> VpnResult<()> {
        self.shortcut(Shortcut::ResetRulesAndDisconnect { close_app })
    }

    /// Install or remove the active backend's on-demand rule to match its status
    pub fn reset_on_demand_rules(&self) -> VpnResult<()> {
        self.send(Command::ResetOnDemandRules)
    }

    /// Clear every on-demand rule and wait until that is done
    pub async fn remove_on_demand_rules(&self) -> VpnResult<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::RemoveOnDemandRules { done })?;
        wait.await.map_err(|_| VpnError::CoordinatorStopped)
    }

    /// Apply network protection for the current network. Call on every
    /// network change.
    pub fn evaluate_connection(&self) -> VpnResult<()> {
        self.send(Command::EvaluateConnection)
    }

    /// Wait until every request sent before this call has been handled
    pub async fn settle(&self) -> VpnResult<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Settle { done })?;
        wait.await.map_err(|_| VpnError::CoordinatorStopped)
    }

    /// Live aggregated status: the tunnel in use and its state
    pub async fn aggregated_status(&self) -> (TunnelKind, ConnectionState) {
        let selected = self.settings.selected_kind().await;
        self.registry.aggregated(selected).await
    }

    /// Server address of the tunnel in use
    pub async fn connection_server_address(&self) -> Option<String> {
        let (kind, _) = self.aggregated_status().await;
        self.registry.get(kind).await.server_address().await
    }

    /// Latest log output of the tunnel in use
    pub async fn log(&self) -> Option<String> {
        let (kind, _) = self.aggregated_status().await;
        self.registry.get(kind).await.last_log_snapshot().await
    }

    /// Remove every backend's configuration. Always completes.
    pub async fn remove_all_configurations(&self) {
        self.registry.remove_all().await;
    }

    /// Stop the coordinator task and drop its backend subscription
    pub fn shutdown(&self) {
        if self.tx.send(Message::Shutdown).is_err() {
            warn!("Connection coordinator already stopped");
        }
    }
}

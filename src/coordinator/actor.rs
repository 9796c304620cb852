use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::diagnostics::{extract_between, Diagnostics};
use crate::lifecycle::AppLifecycle;
use crate::settings::{Server, ServerSelector, SettingsStore};
use crate::status_store::StatusStore;
use crate::trust::{can_connect, can_disconnect, resolve_trust, NetworkTrust, TrustPolicy};
use crate::tunnel::{aggregate, BackendRegistry, ConnectionState, TunnelEvent, TunnelKind};

use super::state::{CoordinatorState, PendingConfirmation};
use super::{Command, CoordinatorConfig, CoordinatorDeps, CoordinatorEvent, Message, Shortcut, Timer};

pub(super) struct CoordinatorActor {
    registry: Arc<BackendRegistry>,
    settings: SettingsStore,
    trust: Arc<dyn TrustPolicy>,
    selector: Arc<dyn ServerSelector>,
    diagnostics: Arc<dyn Diagnostics>,
    lifecycle: Arc<dyn AppLifecycle>,
    status_store: Arc<dyn StatusStore>,
    config: CoordinatorConfig,
    state: CoordinatorState,
    confirmation: Option<PendingConfirmation>,
    self_tx: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<CoordinatorEvent>,
    status_tx: watch::Sender<ConnectionState>,
    address_tx: watch::Sender<Option<String>>,
}

impl CoordinatorActor {
    pub(super) async fn new(
        deps: CoordinatorDeps,
        restored: ConnectionState,
        self_tx: mpsc::UnboundedSender<Message>,
        events: broadcast::Sender<CoordinatorEvent>,
        status_tx: watch::Sender<ConnectionState>,
        address_tx: watch::Sender<Option<String>>,
    ) -> Self {
        let selected = deps.settings.selected_kind().await;
        Self {
            registry: deps.registry,
            settings: deps.settings,
            trust: deps.trust,
            selector: deps.selector,
            diagnostics: deps.diagnostics,
            lifecycle: deps.lifecycle,
            status_store: deps.status_store,
            config: deps.config,
            state: CoordinatorState::new(restored, selected),
            confirmation: None,
            self_tx,
            events,
            status_tx,
            address_tx,
        }
    }

    pub(super) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Message>,
        mut backend_events: broadcast::Receiver<TunnelEvent>,
    ) {
        self.refresh_from_backends().await;
        let mut events_open = true;

        loop {
            let deadline = self.confirmation.map(|c| c.deadline);

            tokio::select! {
                biased;

                event = backend_events.recv(), if events_open => match event {
                    Ok(event) => self.on_tunnel_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} tunnel events, resynchronising", missed);
                        self.refresh_from_backends().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Tunnel event stream closed");
                        events_open = false;
                    }
                },

                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    self.on_confirmation_deadline().await;
                }

                message = rx.recv() => match message {
                    Some(Message::Command(command)) => self.handle_command(command).await,
                    Some(Message::Timer(timer)) => self.handle_timer(timer).await,
                    Some(Message::Shutdown) | None => break,
                },
            }
        }

        info!("Connection coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("Coordinator command: {:?}", command);
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect { reconnect_automatically } => self.disconnect(reconnect_automatically).await,
            Command::Reconnect => self.reconnect().await,
            Command::Shortcut(shortcut) => self.shortcut(shortcut).await,
            Command::ResetOnDemandRules => self.reset_on_demand_rules().await,
            Command::RemoveOnDemandRules { done } => {
                self.remove_on_demand_rules().await;
                let _ = done.send(());
            }
            Command::EvaluateConnection => self.evaluate_connection().await,
            Command::Settle { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ReinstallRules(kind) => {
                if !self.trust.protection().await.enabled {
                    debug!("Network protection disabled, not re-arming {} rules", kind);
                    return;
                }
                info!("Re-arming on-demand rules for {}", kind);
                let backend = self.registry.get(kind).await;
                if let Err(e) = backend.install_on_demand_rule(ConnectionState::Disconnected).await {
                    warn!("Failed to install {} on-demand rule: {}", kind, e);
                }
            }
            Timer::Suspend => self.lifecycle.request_suspend().await,
        }
    }

    /// Post a message back to this task after a delay
    fn schedule(&self, delay: Duration, timer: Timer) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Message::Timer(timer));
        });
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    async fn aggregated(&self) -> (TunnelKind, ConnectionState) {
        let selected = self.settings.selected_kind().await;
        self.registry.aggregated(selected).await
    }

    /// Re-read every backend's status and adopt the aggregate without running
    /// transition side effects
    async fn refresh_from_backends(&mut self) {
        let selected = self.settings.selected_kind().await;
        self.state.per_kind = self.registry.statuses().await;
        let (kind, status) = aggregate(selected, &self.state.per_kind);

        self.state.active_kind = kind;
        if status != self.state.status {
            info!("Live status: {} {}", kind, status);
            self.store_status(status).await;
            self.emit(CoordinatorEvent::StatusChanged { kind, state: status });
        }
    }

    async fn store_status(&mut self, status: ConnectionState) {
        self.state.status = status;
        self.status_tx.send_replace(status);
        if let Err(e) = self.status_store.save(status).await {
            warn!("Failed to persist status: {}", e);
        }
    }

    async fn on_tunnel_event(&mut self, event: TunnelEvent) {
        *self.state.per_kind.get_mut(event.kind) = event.state;

        let selected = self.settings.selected_kind().await;
        let (current_kind, _) = aggregate(selected, &self.state.per_kind);
        if event.kind != current_kind && event.kind != self.state.active_kind {
            debug!("Ignoring {} {} from inactive backend", event.kind, event.state);
            return;
        }

        self.on_status_changed(event.kind, event.state).await;
    }

    async fn on_status_changed(&mut self, kind: TunnelKind, status: ConnectionState) {
        let previous = self.state.status;
        info!("Tunnel status: {} {} -> {}", kind, previous, status);

        if previous == ConnectionState::Connecting && status == ConnectionState::Disconnecting {
            warn!("{} dropped while connecting", kind);
            self.emit(CoordinatorEvent::ConnectError { kind });
        }

        self.state.active_kind = kind;
        self.store_status(status).await;
        self.settings.set_selected_server_status(status).await;

        if status == ConnectionState::Connected {
            self.state.connected = true;
            if self.confirmation.is_none() {
                self.confirmation = Some(PendingConfirmation {
                    kind,
                    deadline: Instant::now() + self.config.connect_grace,
                });
            }
        } else {
            self.state.connected = false;
            if let Some(pending) = self.confirmation.take() {
                warn!("{} connection did not hold, reporting connect error", pending.kind);
                self.emit(CoordinatorEvent::ConnectError { kind: pending.kind });
            }
        }

        if status == ConnectionState::Disconnecting {
            self.capture_log(kind).await;
        }

        if status == ConnectionState::Disconnected {
            if self.state.take_reconnect() {
                info!("Reconnecting {}", kind);
                let _ = self.self_tx.send(Message::Command(Command::Connect));
            }
            self.evaluate_close_app();
        }

        self.emit(CoordinatorEvent::StatusChanged { kind, state: status });
    }

    /// The grace period after a Connected signal ran out
    async fn on_confirmation_deadline(&mut self) {
        let Some(pending) = self.confirmation.take() else {
            return;
        };

        if !self.state.connected {
            warn!("{} connection did not hold, reporting connect error", pending.kind);
            self.emit(CoordinatorEvent::ConnectError { kind: pending.kind });
            return;
        }

        info!("{} connection confirmed", pending.kind);
        let backend = self.registry.get(pending.kind).await;
        if let Err(e) = backend.install_on_demand_rule(ConnectionState::Connected).await {
            warn!("Failed to install {} on-demand rule: {}", pending.kind, e);
        }

        if let Some(log) = self.capture_log(pending.kind).await {
            let markers = self.config.local_address_markers.get(pending.kind);
            if let Some(address) = extract_between(&log, &markers.start, &markers.end) {
                info!("Local tunnel address: {}", address);
                self.address_tx.send_replace(Some(address.to_string()));
                self.emit(CoordinatorEvent::LocalAddress {
                    kind: pending.kind,
                    address: address.to_string(),
                });
            }
        }

        self.evaluate_close_app();
    }

    /// Save the backend's latest log output as a snapshot
    async fn capture_log(&self, kind: TunnelKind) -> Option<String> {
        let log = self.registry.get(kind).await.last_log_snapshot().await?;
        if let Err(e) = self.diagnostics.save_log_snapshot(kind.as_str(), &log).await {
            warn!("Failed to save {} log snapshot: {}", kind, e);
        }
        Some(log)
    }

    fn evaluate_close_app(&mut self) {
        if self.state.take_close_app() {
            debug!("Suspending app in {:?}", self.config.close_app_delay);
            self.schedule(self.config.close_app_delay, Timer::Suspend);
        }
    }

    async fn resolve_server(&self) -> Option<Server> {
        let settings = self.settings.snapshot().await;
        if settings.fastest_server {
            if let Some(server) = self.selector.fastest(&settings.servers).await {
                self.settings.set_selected_server(server.clone()).await;
                return Some(server);
            }
            warn!("Fastest server selection found no server, keeping current selection");
        }
        settings.selected_server
    }

    async fn connect(&mut self) {
        let Some(server) = self.resolve_server().await else {
            warn!("No server selected, not connecting");
            return;
        };

        let access = match self.settings.access_details(&server).await {
            Ok(access) => access,
            Err(e) => {
                warn!("Cannot build access details: {}", e);
                return;
            }
        };

        let protocol = self.settings.snapshot().await.protocol;
        let backend = self.registry.get(protocol.kind).await;
        info!("Connecting {} to {}", protocol.kind, access.server_address);

        if let Err(e) = backend.configure(protocol.params(), &access).await {
            warn!("Configuration rejected, not connecting: {}", e);
            return;
        }
        if let Err(e) = backend.connect().await {
            warn!("Failed to start {} connection: {}", protocol.kind, e);
        }
    }

    async fn disconnect(&mut self, reconnect_automatically: bool) {
        if !reconnect_automatically && self.state.take_reconnect() {
            info!("Manual disconnect cancels the pending reconnect");
        }
        self.settings.set_selected_server_status(ConnectionState::Disconnecting).await;

        let (kind, _) = self.aggregated().await;
        info!("Disconnecting {} (reconnect: {})", kind, reconnect_automatically);
        let backend = self.registry.get(kind).await;
        if let Err(e) = backend.disconnect(reconnect_automatically).await {
            warn!("Failed to disconnect {}: {}", kind, e);
        }

        if self.trust.protection().await.enabled {
            self.schedule(self.config.rule_reinstall_delay, Timer::ReinstallRules(kind));
        }
    }

    async fn reconnect(&mut self) {
        let (kind, status) = self.aggregated().await;
        if !matches!(status, ConnectionState::Connected | ConnectionState::Connecting) {
            debug!("Reconnect ignored while {}", status);
            return;
        }

        self.state.reconnect_pending = true;
        info!("Reconnect requested for {}", kind);
        if let Err(e) = self.registry.get(kind).await.disconnect(true).await {
            warn!("Failed to disconnect {} for reconnect: {}", kind, e);
            self.state.reconnect_pending = false;
        }
    }

    async fn reset_on_demand_rules(&mut self) {
        let (kind, status) = self.aggregated().await;
        let backend = self.registry.get(kind).await;

        let result = if status.is_up() {
            debug!("Installing {} on-demand rule for {}", kind, status);
            backend.install_on_demand_rule(status).await
        } else {
            debug!("Removing {} on-demand rule ({})", kind, status);
            backend.remove_on_demand_rule().await
        };

        if let Err(e) = result {
            warn!("Failed to reset {} on-demand rule: {}", kind, e);
        }
    }

    async fn remove_on_demand_rules(&mut self) {
        self.registry.remove_all_on_demand_rules().await;
        debug!("On-demand rules cleared");
    }

    async fn shortcut(&mut self, shortcut: Shortcut) {
        if shortcut.closes_app() {
            self.state.close_app_pending = true;
        }

        let (_, status) = self.aggregated().await;
        let protection = self.trust.protection().await;
        let clear_rules = shortcut.resets_rules() || protection.enabled;

        if shortcut.is_connect() {
            if status.is_up() {
                debug!("Already {}, nothing to connect", status);
                self.evaluate_close_app();
                return;
            }
            if !can_connect(self.trust.as_ref(), status).await {
                info!("Connect refused on trusted network");
                self.state.close_app_pending = false;
                self.emit(CoordinatorEvent::ConnectVetoed);
                return;
            }
            if clear_rules {
                self.remove_on_demand_rules().await;
            }
            self.connect().await;
        } else {
            if status.is_down() {
                debug!("Already {}, nothing to disconnect", status);
                self.evaluate_close_app();
                return;
            }
            if !can_disconnect(self.trust.as_ref(), status).await {
                info!("Disconnect refused on untrusted network");
                self.state.close_app_pending = false;
                self.emit(CoordinatorEvent::DisconnectVetoed);
                return;
            }
            if clear_rules {
                self.remove_on_demand_rules().await;
            }
            self.disconnect(false).await;
        }
    }

    async fn evaluate_connection(&mut self) {
        let protection = self.trust.protection().await;
        if !protection.enabled {
            return;
        }

        let trust = resolve_trust(self.trust.as_ref()).await;
        let (_, status) = self.aggregated().await;
        debug!("Evaluating network protection: {:?} while {}", trust, status);

        match trust {
            NetworkTrust::Untrusted if protection.auto_connect_on_untrusted => {
                if !matches!(status, ConnectionState::Connected | ConnectionState::Connecting) {
                    info!("Untrusted network, connecting");
                    self.shortcut(Shortcut::ResetRulesAndConnect { close_app: false }).await;
                }
            }
            NetworkTrust::Trusted if protection.auto_disconnect_on_trusted => {
                if !status.is_down() {
                    info!("Trusted network, disconnecting");
                    self.shortcut(Shortcut::ResetRulesAndDisconnect { close_app: false }).await;
                }
            }
            _ => {}
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

use tokio::time::Instant;

use crate::tunnel::{ConnectionState, StatusByKind, TunnelKind};

/// State owned by the coordinator task. Nothing else writes it.
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    /// Last aggregated status, persisted on every change
    pub status: ConnectionState,
    /// Kind whose events last updated `status`
    pub active_kind: TunnelKind,
    /// Set on a Connected event, cleared by any other event
    pub connected: bool,
    /// A reconnect was requested; consumed by the next Disconnected event
    pub reconnect_pending: bool,
    /// A shortcut wants the app suspended once its action completes
    pub close_app_pending: bool,
    /// Latest status seen from each backend
    pub per_kind: StatusByKind,
}

impl CoordinatorState {
    pub fn new(status: ConnectionState, active_kind: TunnelKind) -> Self {
        Self {
            status,
            active_kind,
            connected: false,
            reconnect_pending: false,
            close_app_pending: false,
            per_kind: StatusByKind::default(),
        }
    }

    /// Take the close-app intent, leaving it cleared
    pub fn take_close_app(&mut self) -> bool {
        std::mem::take(&mut self.close_app_pending)
    }

    /// Take the reconnect request, leaving it cleared
    pub fn take_reconnect(&mut self) -> bool {
        std::mem::take(&mut self.reconnect_pending)
    }
}

/// Debounce timer for a Connected signal
///
/// Armed when a backend reports Connected and disarmed by any contradicting
/// event before `deadline`. The post-connect sequence only runs if the timer
/// fires while still armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub kind: TunnelKind,
    pub deadline: Instant,
}

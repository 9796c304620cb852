use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::VpnResult;
use crate::settings::{AccessDetails, ProtocolParams};
use super::{ConnectionState, TunnelKind};

/// Status notification pushed by a tunnel backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelEvent {
    pub kind: TunnelKind,
    pub state: ConnectionState,
}

/// Broadcast stream of backend status changes
///
/// Backends hold a clone and publish on every transition; the coordinator
/// subscribes once and unsubscribes by dropping its receiver.
#[derive(Debug, Clone)]
pub struct TunnelEventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    /// Publish a status change. Having no subscribers is not an error.
    pub fn publish(&self, kind: TunnelKind, state: ConnectionState) {
        debug!("Tunnel event: {} -> {}", kind, state);
        let _ = self.tx.send(TunnelEvent { kind, state });
    }
}

impl Default for TunnelEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Common interface that every tunnel backend must implement
///
/// Operations are requests: `connect` and `disconnect` ask the backend to
/// transition and return once the request is accepted. The resulting status
/// changes arrive on the `TunnelEventBus`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Current status as observed by the backend
    async fn status(&self) -> ConnectionState;

    /// Store protocol parameters and access details for the next connect
    async fn configure(&self, params: &ProtocolParams, access: &AccessDetails) -> VpnResult<()>;

    /// Ask the backend to bring the tunnel up
    async fn connect(&self) -> VpnResult<()>;

    /// Ask the backend to tear the tunnel down. `reconnect` tells the backend
    /// the caller intends to bring it straight back up.
    async fn disconnect(&self, reconnect: bool) -> VpnResult<()>;

    /// Install an on-demand rule matching the given status
    async fn install_on_demand_rule(&self, status: ConnectionState) -> VpnResult<()>;

    /// Remove the on-demand rule and disable on-demand activation
    async fn remove_on_demand_rule(&self) -> VpnResult<()>;

    /// Remove the stored tunnel configuration entirely
    async fn remove_configuration(&self) -> VpnResult<()>;

    /// Most recent diagnostic output, if any
    async fn last_log_snapshot(&self) -> Option<String>;

    /// Address of the server the tunnel is configured for
    async fn server_address(&self) -> Option<String>;
}

/// Factory creating the backend for a tunnel kind
pub type TunnelBackendFactory = Arc<dyn Fn(TunnelKind) -> Arc<dyn TunnelBackend> + Send + Sync>;

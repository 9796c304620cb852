use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::aggregator::{aggregate, StatusByKind};
use super::backend::{TunnelBackend, TunnelBackendFactory};
use super::{ConnectionState, TunnelKind};

/// Backend registry - owns one backend per tunnel kind and routes
/// operations to the backend matching a kind
pub struct BackendRegistry {
    /// Backends created so far
    backends: RwLock<HashMap<TunnelKind, Arc<dyn TunnelBackend>>>,
    /// Creates a backend the first time its kind is requested
    factory: TunnelBackendFactory,
}

impl BackendRegistry {
    /// Create a new registry around a backend factory
    pub fn new(factory: TunnelBackendFactory) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Get the backend for a kind, creating and caching it on first access
    pub async fn get(&self, kind: TunnelKind) -> Arc<dyn TunnelBackend> {
        if let Some(backend) = self.backends.read().await.get(&kind) {
            return backend.clone();
        }

        let mut backends = self.backends.write().await;
        backends
            .entry(kind)
            .or_insert_with(|| {
                info!("Creating tunnel backend: {}", kind);
                (self.factory)(kind)
            })
            .clone()
    }

    /// Query a single backend's status
    pub async fn status_of(&self, kind: TunnelKind) -> ConnectionState {
        self.get(kind).await.status().await
    }

    /// Query all three backends concurrently and wait for every answer
    pub async fn statuses(&self) -> StatusByKind {
        let (ipsec, openvpn, wireguard) = tokio::join!(
            self.status_of(TunnelKind::IPsec),
            self.status_of(TunnelKind::OpenVpn),
            self.status_of(TunnelKind::WireGuard),
        );
        StatusByKind { ipsec, openvpn, wireguard }
    }

    /// Aggregated status: the tunnel in use and its state
    pub async fn aggregated(&self, selected: TunnelKind) -> (TunnelKind, ConnectionState) {
        let statuses = self.statuses().await;
        let result = aggregate(selected, &statuses);
        debug!("Aggregated status {:?} -> {} {}", statuses, result.0, result.1);
        result
    }

    /// Remove every backend's configuration. Individual failures are logged
    /// and never fail the whole operation.
    pub async fn remove_all(&self) {
        let removals = TunnelKind::ALL.iter().map(|kind| async move {
            let backend = self.get(*kind).await;
            if let Err(e) = backend.remove_configuration().await {
                warn!("Failed to remove {} configuration: {}", kind, e);
            }
        });
        futures::future::join_all(removals).await;
        info!("Removed all tunnel configurations");
    }

    /// Remove every backend's on-demand rule, best effort
    pub async fn remove_all_on_demand_rules(&self) {
        let removals = TunnelKind::ALL.iter().map(|kind| async move {
            let backend = self.get(*kind).await;
            if let Err(e) = backend.remove_on_demand_rule().await {
                warn!("Failed to remove {} on-demand rule: {}", kind, e);
            }
        });
        futures::future::join_all(removals).await;
    }
}

//! Shared connection settings
//!
//! A single reference-counted store is handed to the coordinator and to any
//! other consumer, so the selected server and protocol are never copied into
//! separate places that could drift apart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{VpnError, VpnResult};
use crate::tunnel::{ConnectionState, PerKind, TunnelKind};

/// Backend-specific connection parameters (port, transport, MTU, ...)
pub type ProtocolParams = HashMap<String, Value>;

/// Opaque handle to a stored credential. Never the secret itself.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialRef({})", self.0)
    }
}

/// Everything a backend needs to reach a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDetails {
    pub server_address: String,
    pub username: String,
    pub password_ref: CredentialRef,
}

/// A VPN server the user can select
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub address: String,
    /// Last measured round trip, used for fastest-server selection
    #[serde(default)]
    pub latency_ms: Option<u32>,
    #[serde(skip)]
    pub status: ConnectionState,
}

/// The preferred tunnel kind plus per-kind parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedProtocol {
    pub kind: TunnelKind,
    #[serde(default)]
    pub params: PerKind<ProtocolParams>,
}

impl SelectedProtocol {
    pub fn params(&self) -> &ProtocolParams {
        self.params.get(self.kind)
    }
}

impl Default for SelectedProtocol {
    fn default() -> Self {
        Self {
            kind: TunnelKind::WireGuard,
            params: PerKind::default(),
        }
    }
}

/// Current connection settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub servers: Vec<Server>,
    pub selected_server: Option<Server>,
    /// Re-select the fastest server on every connect
    pub fastest_server: bool,
    pub protocol: SelectedProtocol,
    pub username: String,
    pub credential_ref: CredentialRef,
}

/// Shared settings store
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy of the current settings
    pub async fn snapshot(&self) -> Settings {
        self.inner.read().await.clone()
    }

    pub async fn selected_kind(&self) -> TunnelKind {
        self.inner.read().await.protocol.kind
    }

    pub async fn selected_server(&self) -> Option<Server> {
        self.inner.read().await.selected_server.clone()
    }

    pub async fn set_selected_server(&self, server: Server) {
        info!("Selected server: {} ({})", server.id, server.address);
        self.inner.write().await.selected_server = Some(server);
    }

    /// Record the status of the selected server
    pub async fn set_selected_server_status(&self, status: ConnectionState) {
        if let Some(server) = self.inner.write().await.selected_server.as_mut() {
            debug!("Server {} status: {}", server.id, status);
            server.status = status;
        }
    }

    /// Build access details for a server from the stored account
    pub async fn access_details(&self, server: &Server) -> VpnResult<AccessDetails> {
        let settings = self.inner.read().await;
        if server.address.is_empty() {
            return Err(VpnError::InvalidParameter(format!("Server {} has no address", server.id)));
        }

        Ok(AccessDetails {
            server_address: server.address.clone(),
            username: settings.username.clone(),
            password_ref: settings.credential_ref.clone(),
        })
    }
}

/// Fastest-server selection capability
#[async_trait]
pub trait ServerSelector: Send + Sync {
    /// Pick the fastest of the given servers
    async fn fastest(&self, servers: &[Server]) -> Option<Server>;
}

/// Picks the server with the lowest recorded latency. Servers without a
/// measurement sort last.
#[derive(Debug, Default)]
pub struct LowestLatencySelector;

#[async_trait]
impl ServerSelector for LowestLatencySelector {
    async fn fastest(&self, servers: &[Server]) -> Option<Server> {
        servers
            .iter()
            .min_by_key(|s| s.latency_ms.unwrap_or(u32::MAX))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str, latency_ms: Option<u32>) -> Server {
        Server {
            id: id.to_string(),
            name: id.to_uppercase(),
            address: format!("{}.vpn.example.net", id),
            latency_ms,
            status: ConnectionState::Disconnected,
        }
    }

    #[tokio::test]
    async fn test_lowest_latency_selection() {
        let servers = vec![server("de", Some(40)), server("nl", Some(12)), server("us", None)];
        let best = LowestLatencySelector.fastest(&servers).await.unwrap();
        assert_eq!(best.id, "nl");
        assert!(LowestLatencySelector.fastest(&[]).await.is_none());
    }

    #[tokio::test]
    async fn test_store_is_shared() {
        let store = SettingsStore::new(Settings::default());
        let other = store.clone();

        store.set_selected_server(server("de", None)).await;
        other.set_selected_server_status(ConnectionState::Disconnecting).await;

        let selected = store.selected_server().await.unwrap();
        assert_eq!(selected.status, ConnectionState::Disconnecting);
    }

    #[tokio::test]
    async fn test_access_details() {
        let store = SettingsStore::new(Settings {
            username: "alice".to_string(),
            credential_ref: CredentialRef::new("keyring:vpn/alice"),
            ..Settings::default()
        });

        let access = tokio_test::assert_ok!(store.access_details(&server("nl", None)).await);
        assert_eq!(access.server_address, "nl.vpn.example.net");
        assert_eq!(access.username, "alice");
        assert_eq!(access.password_ref.as_str(), "keyring:vpn/alice");

        let mut bad = server("xx", None);
        bad.address.clear();
        tokio_test::assert_err!(store.access_details(&bad).await);
    }

    #[test]
    fn test_default_protocol_and_credential_debug() {
        let reference = CredentialRef::new("keyring:vpn/alice");
        assert_eq!(format!("{:?}", reference), "CredentialRef(keyring:vpn/alice)");

        let protocol = tokio_test::block_on(async {
            let store = SettingsStore::default();
            store.selected_kind().await
        });
        assert_eq!(protocol, TunnelKind::WireGuard);
    }
}

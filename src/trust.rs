//! Network trust policy
//!
//! Consumes the per-network trust classification to gate manual connect and
//! disconnect requests and to drive automatic network protection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::tunnel::ConnectionState;

/// Trust classification of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkTrust {
    Trusted,
    Untrusted,
    #[default]
    Default,
}

/// Network protection feature flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionSettings {
    pub enabled: bool,
    pub auto_connect_on_untrusted: bool,
    pub auto_disconnect_on_trusted: bool,
}

/// Source of network trust information
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrustPolicy: Send + Sync {
    /// Stored trust for the network the host is on, if one is stored
    async fn current_network_trust(&self) -> Option<NetworkTrust>;

    /// Trust applied to networks without a stored value
    async fn default_trust(&self) -> NetworkTrust;

    async fn protection(&self) -> ProtectionSettings;
}

/// Resolve the current network's trust, falling back to the default
pub async fn resolve_trust(policy: &dyn TrustPolicy) -> NetworkTrust {
    match policy.current_network_trust().await {
        Some(trust) => trust,
        None => policy.default_trust().await,
    }
}

/// Whether a manual connect is allowed. Refused only when the tunnel is down
/// and the network is trusted.
pub async fn can_connect(policy: &dyn TrustPolicy, status: ConnectionState) -> bool {
    if !matches!(status, ConnectionState::Disconnected | ConnectionState::Invalid) {
        return true;
    }
    resolve_trust(policy).await != NetworkTrust::Trusted
}

/// Whether a manual disconnect is allowed. Refused only when network
/// protection is on, the tunnel is connected and the network is untrusted.
pub async fn can_disconnect(policy: &dyn TrustPolicy, status: ConnectionState) -> bool {
    if !policy.protection().await.enabled {
        return true;
    }
    if status != ConnectionState::Connected {
        return true;
    }
    resolve_trust(policy).await != NetworkTrust::Untrusted
}

/// Trust policy backed by configuration, with the current network supplied
/// by a network observer
#[derive(Debug, Default)]
pub struct ConfiguredTrustPolicy {
    networks: RwLock<HashMap<String, NetworkTrust>>,
    current_network: RwLock<Option<String>>,
    default_trust: RwLock<NetworkTrust>,
    protection: RwLock<ProtectionSettings>,
}

impl ConfiguredTrustPolicy {
    pub fn new(
        networks: HashMap<String, NetworkTrust>,
        default_trust: NetworkTrust,
        protection: ProtectionSettings,
    ) -> Self {
        Self {
            networks: RwLock::new(networks),
            current_network: RwLock::new(None),
            default_trust: RwLock::new(default_trust),
            protection: RwLock::new(protection),
        }
    }

    /// Record the network the host is currently attached to
    pub async fn set_current_network(&self, network: Option<String>) {
        debug!("Current network: {:?}", network);
        *self.current_network.write().await = network;
    }

    pub async fn current_network(&self) -> Option<String> {
        self.current_network.read().await.clone()
    }

    /// Store a trust value for a network
    pub async fn set_network_trust(&self, network: &str, trust: NetworkTrust) {
        self.networks.write().await.insert(network.to_string(), trust);
    }

    pub async fn set_protection(&self, protection: ProtectionSettings) {
        *self.protection.write().await = protection;
    }
}

#[async_trait]
impl TrustPolicy for ConfiguredTrustPolicy {
    async fn current_network_trust(&self) -> Option<NetworkTrust> {
        let network = self.current_network.read().await.clone()?;
        self.networks.read().await.get(&network).copied()
    }

    async fn default_trust(&self) -> NetworkTrust {
        *self.default_trust.read().await
    }

    async fn protection(&self) -> ProtectionSettings {
        *self.protection.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(stored: Option<NetworkTrust>, default: NetworkTrust, enabled: bool) -> MockTrustPolicy {
        let mut mock = MockTrustPolicy::new();
        mock.expect_current_network_trust().returning(move || stored);
        mock.expect_default_trust().returning(move || default);
        mock.expect_protection().returning(move || ProtectionSettings {
            enabled,
            ..ProtectionSettings::default()
        });
        mock
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_default() {
        let mock = policy(None, NetworkTrust::Untrusted, true);
        assert_eq!(resolve_trust(&mock).await, NetworkTrust::Untrusted);

        let mock = policy(Some(NetworkTrust::Trusted), NetworkTrust::Untrusted, true);
        assert_eq!(resolve_trust(&mock).await, NetworkTrust::Trusted);
    }

    #[tokio::test]
    async fn test_can_connect() {
        let trusted = policy(Some(NetworkTrust::Trusted), NetworkTrust::Default, true);
        assert!(!can_connect(&trusted, ConnectionState::Disconnected).await);
        assert!(!can_connect(&trusted, ConnectionState::Invalid).await);
        assert!(can_connect(&trusted, ConnectionState::Connected).await);

        let untrusted = policy(Some(NetworkTrust::Untrusted), NetworkTrust::Default, true);
        assert!(can_connect(&untrusted, ConnectionState::Disconnected).await);

        let default = policy(Some(NetworkTrust::Default), NetworkTrust::Default, true);
        assert!(can_connect(&default, ConnectionState::Disconnected).await);
    }

    #[tokio::test]
    async fn test_can_disconnect() {
        let untrusted = policy(Some(NetworkTrust::Untrusted), NetworkTrust::Default, true);
        assert!(!can_disconnect(&untrusted, ConnectionState::Connected).await);
        assert!(can_disconnect(&untrusted, ConnectionState::Connecting).await);

        let trusted = policy(Some(NetworkTrust::Trusted), NetworkTrust::Default, true);
        assert!(can_disconnect(&trusted, ConnectionState::Connected).await);

        for trust in [NetworkTrust::Trusted, NetworkTrust::Untrusted, NetworkTrust::Default] {
            let disabled = policy(Some(trust), NetworkTrust::Default, false);
            assert!(can_disconnect(&disabled, ConnectionState::Connected).await);
        }
    }

    #[tokio::test]
    async fn test_configured_policy() {
        let mut networks = HashMap::new();
        networks.insert("HomeWifi".to_string(), NetworkTrust::Trusted);
        let policy = ConfiguredTrustPolicy::new(networks, NetworkTrust::Untrusted, ProtectionSettings::default());

        assert_eq!(policy.current_network_trust().await, None);
        assert_eq!(resolve_trust(&policy).await, NetworkTrust::Untrusted);

        policy.set_current_network(Some("HomeWifi".to_string())).await;
        assert_eq!(resolve_trust(&policy).await, NetworkTrust::Trusted);

        policy.set_current_network(Some("Cafe".to_string())).await;
        assert_eq!(resolve_trust(&policy).await, NetworkTrust::Untrusted);

        policy.set_network_trust("Cafe", NetworkTrust::Default).await;
        assert_eq!(resolve_trust(&policy).await, NetworkTrust::Default);
    }
}

//! Tunnel backend layer
//!
//! This module provides the shared vocabulary for the interchangeable tunnel
//! backends (IPsec, OpenVPN, WireGuard) and the plumbing that sits between
//! them and the connection coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Connection Coordinator        │
//! └──────────────┬──────────────────────┘
//!                │  registry / aggregator
//!    ┌───────────┼───────────┐
//!    │           │           │
//!    ▼           ▼           ▼
//! ┌──────┐   ┌──────┐   ┌──────┐
//! │IPsec │   │ OVPN │   │  WG  │  <- TunnelBackend implementations
//! └──────┘   └──────┘   └──────┘
//!    │           │           │
//!    └───────────┴───────────┴──────> TunnelEventBus (status changes)
//! ```
//!
//! Each backend implements the `TunnelBackend` trait. Only one tunnel can be
//! active on the host at a time, but leftover configurations from earlier
//! sessions may still report a status, so every query fans out to all three.

pub mod aggregator;
pub mod backend;
pub mod command;
pub mod common;
pub mod registry;

pub use aggregator::{aggregate, StatusByKind};
pub use backend::{TunnelBackend, TunnelBackendFactory, TunnelEvent, TunnelEventBus};
pub use registry::BackendRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of tunnel technologies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelKind {
    #[serde(rename = "ipsec")]
    IPsec,
    #[serde(rename = "openvpn")]
    OpenVpn,
    #[serde(rename = "wireguard")]
    WireGuard,
}

impl TunnelKind {
    /// All kinds in aggregation priority order
    pub const ALL: [TunnelKind; 3] = [TunnelKind::IPsec, TunnelKind::OpenVpn, TunnelKind::WireGuard];

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::IPsec => "ipsec",
            TunnelKind::OpenVpn => "openvpn",
            TunnelKind::WireGuard => "wireguard",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TunnelKind {
    type Err = crate::error::VpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipsec" | "ikev2" => Ok(TunnelKind::IPsec),
            "openvpn" => Ok(TunnelKind::OpenVpn),
            "wireguard" | "wg" => Ok(TunnelKind::WireGuard),
            other => Err(crate::error::VpnError::InvalidParameter(
                format!("Unknown tunnel kind: {}", other)
            )),
        }
    }
}

/// One value per tunnel kind
///
/// Serialized as a table with `ipsec`, `openvpn` and `wireguard` keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct PerKind<T> {
    pub ipsec: T,
    pub openvpn: T,
    pub wireguard: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: TunnelKind) -> &T {
        match kind {
            TunnelKind::IPsec => &self.ipsec,
            TunnelKind::OpenVpn => &self.openvpn,
            TunnelKind::WireGuard => &self.wireguard,
        }
    }

    pub fn get_mut(&mut self, kind: TunnelKind) -> &mut T {
        match kind {
            TunnelKind::IPsec => &mut self.ipsec,
            TunnelKind::OpenVpn => &mut self.openvpn,
            TunnelKind::WireGuard => &mut self.wireguard,
        }
    }
}

/// Lifecycle status of a tunnel
///
/// `Invalid` means no tunnel has been configured yet. `Reasserting` is
/// treated like `Connecting` by the on-demand rule policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reasserting,
}

impl ConnectionState {
    /// A state that marks its backend as the one in use
    pub fn is_meaningful(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    /// Connected, or on the way there
    pub fn is_up(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reasserting
        )
    }

    /// Disconnected, tearing down, or never configured
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Disconnecting | ConnectionState::Invalid
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Invalid => "invalid",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Reasserting => "reasserting",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("WireGuard".parse::<TunnelKind>().unwrap(), TunnelKind::WireGuard);
        assert_eq!("ikev2".parse::<TunnelKind>().unwrap(), TunnelKind::IPsec);
        assert!("pptp".parse::<TunnelKind>().is_err());
    }

    #[test]
    fn test_state_classes() {
        assert!(ConnectionState::Disconnecting.is_meaningful());
        assert!(!ConnectionState::Reasserting.is_meaningful());
        assert!(ConnectionState::Reasserting.is_up());
        assert!(ConnectionState::Invalid.is_down());
        assert!(!ConnectionState::Connected.is_down());
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&TunnelKind::OpenVpn).unwrap();
        assert_eq!(json, "\"openvpn\"");
        let state: ConnectionState = serde_json::from_str("\"reasserting\"").unwrap();
        assert_eq!(state, ConnectionState::Reasserting);
    }
}

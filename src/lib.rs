//! vpnctl - VPN Connection Coordinator Library
//!
//! Async library that drives three VPN tunnel backends as one connection:
//! - Tunnel backends (IPsec/IKEv2, OpenVPN, WireGuard) behind one trait
//! - Status aggregation across backends
//! - Connect / disconnect / reconnect with Connected-signal debouncing
//! - On-demand rule management
//! - Network trust protection and auto-connect on untrusted networks
//! - Current network monitoring
//!
//! The `vpnctl` binary wires these together from a TOML configuration.

pub mod error;
pub mod config;
pub mod settings;
pub mod trust;
pub mod diagnostics;
pub mod status_store;
pub mod lifecycle;
pub mod network_monitor;
pub mod tunnel;
pub mod coordinator;

// Re-export commonly used types
pub use error::{VetoKind, VpnError, VpnResult};
pub use config::VpnctlConfig;
pub use settings::{
    AccessDetails, CredentialRef, LowestLatencySelector, ProtocolParams, SelectedProtocol,
    Server, ServerSelector, Settings, SettingsStore,
};
pub use trust::{ConfiguredTrustPolicy, NetworkTrust, ProtectionSettings, TrustPolicy};
pub use diagnostics::{Diagnostics, FileDiagnostics, LogMarkers};
pub use status_store::{FileStatusStore, MemoryStatusStore, StatusStore};
pub use lifecycle::{AppLifecycle, NotifyLifecycle};
pub use network_monitor::{NetworkEvent, NetworkMonitor};
pub use tunnel::{
    aggregate, BackendRegistry, ConnectionState, PerKind, StatusByKind, TunnelBackend,
    TunnelBackendFactory, TunnelEvent, TunnelEventBus, TunnelKind,
};
pub use tunnel::command::{BackendCommands, CommandBackend};
pub use coordinator::{
    ConnectionCoordinator, CoordinatorConfig, CoordinatorDeps, CoordinatorEvent, Shortcut,
};

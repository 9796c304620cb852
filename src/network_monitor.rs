//! Current network observer
//!
//! Polls sysfs for the network the host is attached to and broadcasts a
//! change event whenever it differs from the last one seen. Wireless links
//! are named by their SSID, anything else by the interface name, which is
//! the key trust is stored under.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::{VpnError, VpnResult};
use crate::tunnel::common::run_command;

/// Network event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The current network changed; `None` when no link is up
    NetworkChanged { network: Option<String> },
}

/// Interface name prefixes that belong to tunnels rather than networks
const TUNNEL_PREFIXES: &[&str] = &["wg", "tun", "tap", "ipsec", "vti", "ppp"];

/// Network monitor that watches for changes of the current network
pub struct NetworkMonitor {
    event_tx: broadcast::Sender<NetworkEvent>,
    running: Arc<tokio::sync::RwLock<bool>>,
    sysfs_root: PathBuf,
    poll_interval: Duration,
}

impl NetworkMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_sysfs_root("/sys/class/net", poll_interval)
    }

    /// Monitor a different interface tree (used by tests)
    pub fn with_sysfs_root(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            event_tx,
            running: Arc::new(tokio::sync::RwLock::new(false)),
            sysfs_root: root.into(),
            poll_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    /// Start monitoring. The first poll always produces an event.
    pub async fn start(&self) -> VpnResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(VpnError::InvalidState("Network monitor already running".to_string()));
        }
        *running = true;
        drop(running);

        info!("Starting network monitor on {:?}", self.sysfs_root);

        let event_tx = self.event_tx.clone();
        let running = self.running.clone();
        let root = self.sysfs_root.clone();
        let interval = self.poll_interval;

        tokio::spawn(async move {
            if let Err(e) = Self::poll_loop(event_tx, running, root, interval).await {
                error!("Network monitor error: {}", e);
            }
        });

        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Stopped network monitor");
    }

    async fn poll_loop(
        event_tx: broadcast::Sender<NetworkEvent>,
        running: Arc<tokio::sync::RwLock<bool>>,
        root: PathBuf,
        interval: Duration,
    ) -> VpnResult<()> {
        let mut last: Option<Option<String>> = None;

        while *running.read().await {
            let network = current_network(&root).await?;
            if last.as_ref() != Some(&network) {
                debug!("Current network: {:?}", network);
                let _ = event_tx.send(NetworkEvent::NetworkChanged { network: network.clone() });
                last = Some(network);
            }
            tokio::time::sleep(interval).await;
        }

        Ok(())
    }
}

/// The network the host is currently attached to
///
/// Picks the first interface (by name) that is up and is neither loopback
/// nor a tunnel.
pub async fn current_network(root: &Path) -> VpnResult<Option<String>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();

    for name in names {
        if name == "lo" || TUNNEL_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }

        let operstate = tokio::fs::read_to_string(root.join(&name).join("operstate"))
            .await
            .unwrap_or_default();
        if operstate.trim() != "up" {
            continue;
        }

        if tokio::fs::metadata(root.join(&name).join("wireless")).await.is_ok() {
            if let Some(ssid) = wireless_ssid(&name).await {
                return Ok(Some(ssid));
            }
        }
        return Ok(Some(name));
    }

    Ok(None)
}

async fn wireless_ssid(interface: &str) -> Option<String> {
    let args = ["iw", "dev", interface, "link"].map(String::from);
    match run_command(&args).await {
        Ok(output) => parse_iw_ssid(&output),
        Err(e) => {
            debug!("Cannot read SSID of {}: {}", interface, e);
            None
        }
    }
}

/// Extract the SSID from `iw dev <if> link` output
pub fn parse_iw_ssid(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("SSID:"))
        .map(|ssid| ssid.trim().to_string())
        .filter(|ssid| !ssid.is_empty())
}

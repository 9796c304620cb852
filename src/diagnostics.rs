//! Diagnostic log snapshots

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::error::VpnResult;
use crate::tunnel::{common, PerKind};

/// Start and end markers delimiting a value inside free-text log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMarkers {
    pub start: String,
    pub end: String,
}

impl Default for LogMarkers {
    fn default() -> Self {
        Self {
            start: String::new(),
            end: "\n".to_string(),
        }
    }
}

/// Markers for the tunnel-assigned local address in each backend's log
pub fn default_local_address_markers() -> PerKind<LogMarkers> {
    PerKind {
        ipsec: LogMarkers {
            start: "installing new virtual IP ".to_string(),
            end: "\n".to_string(),
        },
        openvpn: LogMarkers {
            start: "net_addr_v4_add: ".to_string(),
            end: "/".to_string(),
        },
        wireguard: LogMarkers {
            start: "ip -4 address add ".to_string(),
            end: "/".to_string(),
        },
    }
}

/// Extract the text between the first `start` marker and the next `end`
/// marker after it
pub fn extract_between<'a>(blob: &'a str, start: &str, end: &str) -> Option<&'a str> {
    if start.is_empty() {
        return None;
    }
    let from = blob.find(start)? + start.len();
    let rest = &blob[from..];
    let to = rest.find(end)?;
    let value = rest[..to].trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Persistence for named log snapshots
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn save_log_snapshot(&self, name: &str, contents: &str) -> VpnResult<()>;
}

/// Writes snapshots as `<name>.log` files in a log directory
#[derive(Debug, Clone)]
pub struct FileDiagnostics {
    log_dir: PathBuf,
}

impl FileDiagnostics {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", name))
    }
}

#[async_trait]
impl Diagnostics for FileDiagnostics {
    async fn save_log_snapshot(&self, name: &str, contents: &str) -> VpnResult<()> {
        common::ensure_directory_exists(&self.log_dir).await?;
        let path = self.snapshot_path(name);
        tokio::fs::write(&path, contents).await?;
        debug!("Saved log snapshot {:?} ({} bytes)", path, contents.len());
        Ok(())
    }
}

//! Persisted last-known connection status
//!
//! Restores UI state at startup before the first live status query answers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::VpnResult;
use crate::tunnel::{common, ConnectionState};

/// Key-value persistence for the aggregated status
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load(&self) -> Option<ConnectionState>;
    async fn save(&self, status: ConnectionState) -> VpnResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusRecord {
    status: ConnectionState,
    updated_at: String,
}

/// Stores the status as `status.json` in a state directory
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            path: state_dir.join("status.json"),
        }
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn load(&self) -> Option<ConnectionState> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str::<StatusRecord>(&content) {
            Ok(record) => Some(record.status),
            Err(e) => {
                warn!("Ignoring unreadable status file {:?}: {}", self.path, e);
                None
            }
        }
    }

    async fn save(&self, status: ConnectionState) -> VpnResult<()> {
        if let Some(parent) = self.path.parent() {
            common::ensure_directory_exists(parent).await?;
        }
        let record = StatusRecord {
            status,
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&record)?).await?;
        debug!("Persisted status: {}", status);
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    status: RwLock<Option<ConnectionState>>,
}

impl MemoryStatusStore {
    pub fn new(initial: Option<ConnectionState>) -> Self {
        Self {
            status: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self) -> Option<ConnectionState> {
        *self.status.read().await
    }

    async fn save(&self, status: ConnectionState) -> VpnResult<()> {
        *self.status.write().await = Some(status);
        Ok(())
    }
}

//! Application lifecycle hooks

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Lets the coordinator ask the foreground application to step aside once a
/// shortcut action has finished
#[async_trait]
pub trait AppLifecycle: Send + Sync {
    async fn request_suspend(&self);
}

/// Signals a `Notify` so a foreground command can exit
#[derive(Debug, Clone, Default)]
pub struct NotifyLifecycle {
    notify: Arc<Notify>,
}

impl NotifyLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a suspend has been requested
    pub async fn suspended(&self) {
        self.notify.notified().await;
    }
}

#[async_trait]
impl AppLifecycle for NotifyLifecycle {
    async fn request_suspend(&self) {
        info!("Suspend requested");
        self.notify.notify_one();
    }
}

//! Consumer side of the relay: where decoded updates go.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::Update;

/// Receives every routable update a peer relays to this node.
///
/// Returned errors are reported by the connection handler; the connection
/// itself keeps serving.
#[async_trait]
pub trait Updater: Send + Sync {
    async fn update(&self, update: Update) -> Result<()>;
}

/// Hands updates to whatever drains the channel, typically the push
/// server's client registry.
#[async_trait]
impl Updater for mpsc::Sender<Update> {
    async fn update(&self, update: Update) -> Result<()> {
        self.send(update)
            .await
            .map_err(|e| anyhow!("update consumer has gone away: {}", e))
    }
}

//! Change channel trait: asynchronous job lifecycle notifications.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::JobEvent;

/// Publish/subscribe feed of job lifecycle events tied to the store.
///
/// Used only to keep the scheduler's waiting-job estimate fresh between
/// polls; the store remains the source of truth.
#[async_trait]
pub trait ChangeChannel: Send + Sync {
    /// Subscribe to a channel. Subscribing twice is a no-op.
    async fn listen(&mut self, channel: &str) -> Result<()>;

    /// Drain pending notifications without blocking.
    async fn poll(&mut self) -> Result<Vec<JobEvent>>;

    /// End the subscription.
    async fn close(&mut self) -> Result<()>;
}

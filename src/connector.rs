use crate::models::SourceMessage;
use async_trait::async_trait;

/// A conversation as listed by the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: i64,
    pub title: String,
}

/// Messaging platform access used by the scheduler and dispatch.
#[async_trait]
pub trait MessageConnector: Send + Sync {
    fn is_authorized(&self) -> bool;
    async fn list_threads(&self, limit: usize) -> anyhow::Result<Vec<ThreadInfo>>;
    /// Returns up to `limit` most recent messages, ordered oldest -> newest.
    async fn fetch_last_messages(
        &self,
        thread_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<SourceMessage>>;
    /// Sends `text`, optionally as a reply, and returns the new message id.
    async fn send_message(
        &self,
        thread_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<i64>;
}

/// Stand-in used when no platform session is available. Cycles gate-skip against it.
pub struct Disconnected;

#[async_trait]
impl MessageConnector for Disconnected {
    fn is_authorized(&self) -> bool {
        false
    }

    async fn list_threads(&self, _limit: usize) -> anyhow::Result<Vec<ThreadInfo>> {
        Err(anyhow::anyhow!("Messaging connector is not authorized"))
    }

    async fn fetch_last_messages(
        &self,
        _thread_id: i64,
        _limit: usize,
    ) -> anyhow::Result<Vec<SourceMessage>> {
        Err(anyhow::anyhow!("Messaging connector is not authorized"))
    }

    async fn send_message(
        &self,
        _thread_id: i64,
        _text: &str,
        _reply_to: Option<i64>,
    ) -> anyhow::Result<i64> {
        Err(anyhow::anyhow!("Messaging connector is not authorized"))
    }
}

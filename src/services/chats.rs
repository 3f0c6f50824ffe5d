use crate::connector::MessageConnector;
use crate::db::Database;
use crate::models::ThreadRecord;
use std::sync::Arc;
use tracing::info;

/// Thread catalog: mirrors the connector's thread list and holds operator choices.
pub struct ChatService {
    db: Database,
    connector: Arc<dyn MessageConnector>,
}

impl ChatService {
    pub fn new(db: Database, connector: Arc<dyn MessageConnector>) -> Self {
        Self { db, connector }
    }

    /// Upserts up to `limit` threads from the connector. Titles are refreshed, selection kept.
    pub async fn sync_from_connector(&self, limit: usize) -> anyhow::Result<usize> {
        if !self.connector.is_authorized() {
            anyhow::bail!("Messaging connector is not authorized");
        }
        let threads = self.connector.list_threads(limit).await?;
        let count = self
            .db
            .run_blocking(move |db| db.upsert_threads(&threads))
            .await?;
        info!("Synced {} threads from connector", count);
        Ok(count)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<ThreadRecord>> {
        self.db.run_blocking(|db| db.list_threads()).await
    }

    pub async fn selected(&self) -> anyhow::Result<Vec<ThreadRecord>> {
        self.db.run_blocking(|db| db.get_selected_threads()).await
    }

    /// Replaces the selection with exactly `thread_ids`.
    pub async fn set_selected(&self, thread_ids: Vec<i64>) -> anyhow::Result<()> {
        self.db
            .run_blocking(move |db| db.set_selected_threads(&thread_ids))
            .await
    }

    pub async fn set_language_hint(
        &self,
        thread_id: i64,
        hint: Option<String>,
    ) -> anyhow::Result<()> {
        self.db
            .run_blocking(move |db| db.set_language_hint(thread_id, hint.as_deref()))
            .await
    }
}

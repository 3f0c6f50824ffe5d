pub mod config;
pub mod connector;
pub mod db;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod reply_target;
pub mod scheduler;
pub mod services;

use std::sync::Arc;

/// Shared handles wired together at startup.
pub struct App {
    pub config: config::Config,
    pub db: db::Database,
    pub prompts: Arc<prompts::PromptStore>,
    pub llm: Arc<llm::LlmClient>,
    pub chats: services::ChatService,
    pub dispatch: services::DispatchService,
    pub scheduler: Arc<scheduler::SuggestionScheduler>,
}

impl App {
    /// Opens the store, loads prompts and builds the services around `connector`.
    /// The scheduler is created but not started.
    pub fn build(
        config: config::Config,
        connector: Arc<dyn connector::MessageConnector>,
    ) -> anyhow::Result<Self> {
        let db = db::Database::new(&config)?;
        db.execute_init()?;

        let prompts = Arc::new(prompts::PromptStore::new(&config.prompts_dir));
        prompts.reload()?;
        tracing::info!(
            "Loaded {} prompts from {}",
            prompts.list().len(),
            prompts.dir().display()
        );

        let llm = Arc::new(llm::LlmClient::new(&config)?);
        if llm.is_configured() {
            tracing::info!("Completion backend ready: model={}", llm.model());
        } else {
            tracing::warn!("OPENAI_API_KEY is not set; suggestion cycles will be skipped");
        }

        let suggestions = Arc::new(services::SuggestionService::new(
            db.clone(),
            connector.clone(),
            llm.clone(),
            prompts.clone(),
        ));
        let scheduler = scheduler::SuggestionScheduler::new(suggestions, db.clone(), &config);

        Ok(Self {
            chats: services::ChatService::new(db.clone(), connector.clone()),
            dispatch: services::DispatchService::new(db.clone(), connector),
            config,
            db,
            prompts,
            llm,
            scheduler,
        })
    }

    /// Refreshes the thread catalog from the connector, up to `dialogs_limit` threads.
    pub async fn sync_threads(&self) -> anyhow::Result<usize> {
        self.chats.sync_from_connector(self.config.dialogs_limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_without_connector_or_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = config::Config {
            database_url: dir.path().join("data/app.db").to_string_lossy().into_owned(),
            prompts_dir: dir.path().join("prompts").to_string_lossy().into_owned(),
            ..config::Config::for_tests()
        };
        let app = App::build(config, Arc::new(connector::Disconnected)).unwrap();

        assert!(!app.llm.is_configured());
        assert_eq!(app.prompts.list(), vec!["suggest_reply", "system"]);
        let report = app.scheduler.run_once().await.unwrap();
        assert!(report.outcomes.is_empty());
        assert!(app.sync_threads().await.is_err());
    }

    #[tokio::test]
    async fn test_sync_threads_respects_dialogs_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = config::Config {
            prompts_dir: dir.path().to_string_lossy().into_owned(),
            dialogs_limit: 2,
            ..config::Config::for_tests()
        };
        let connector = connector::fake::FakeConnector {
            threads: (1..=5)
                .map(|id| connector::ThreadInfo {
                    id,
                    title: format!("chat {id}"),
                })
                .collect(),
            ..connector::fake::FakeConnector::authorized()
        };
        let app = App::build(config, Arc::new(connector)).unwrap();

        assert_eq!(app.sync_threads().await.unwrap(), 2);
        assert_eq!(app.chats.list().await.unwrap().len(), 2);
    }
}

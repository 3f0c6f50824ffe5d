use crate::connector::MessageConnector;
use crate::db::{Database, NewSuggestion};
use crate::llm::LlmClient;
use crate::models::{
    ReplySuggestion, SchedulerSettings, SourceMessage, SuggestionStatus, ThreadRecord,
};
use crate::prompts::{PromptStore, SUGGEST_REPLY_PROMPT, SYSTEM_PROMPT};
use anyhow::Context as _;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What happened to one thread during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadOutcome {
    Created(i64),
    QuotaFull,
    CoolingDown,
    NoMessages,
    NoNewMessages,
    NoReplyNeeded,
    Failed(String),
}

#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub outcomes: Vec<(i64, ThreadOutcome)>,
    /// Set when the cycle stopped early because shutdown was requested.
    pub cancelled: bool,
}

impl CycleReport {
    pub fn created(&self) -> Vec<i64> {
        self.outcomes
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                ThreadOutcome::Created(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ThreadOutcome::Failed(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.created().len() - self.failed()
    }
}

/// Runs suggestion cycles over the selected threads.
pub struct SuggestionService {
    db: Database,
    connector: Arc<dyn MessageConnector>,
    llm: Arc<LlmClient>,
    prompts: Arc<PromptStore>,
}

impl SuggestionService {
    pub fn new(
        db: Database,
        connector: Arc<dyn MessageConnector>,
        llm: Arc<LlmClient>,
        prompts: Arc<PromptStore>,
    ) -> Self {
        Self {
            db,
            connector,
            llm,
            prompts,
        }
    }

    /// One pass over every selected thread. Per-thread errors are recorded as failed
    /// suggestions and never abort the pass; `cancel` is checked between threads.
    pub async fn generate_cycle(&self, cancel: &CancellationToken) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();

        if !self.connector.is_authorized() {
            debug!("Skipping suggestion cycle: connector not authorized");
            return Ok(report);
        }
        if !self.llm.is_configured() {
            debug!("Skipping suggestion cycle: completion backend not configured");
            return Ok(report);
        }

        let settings = self
            .db
            .run_blocking(|db| db.get_settings())
            .await
            .context("Failed to load scheduler settings")?;
        let threads = self
            .db
            .run_blocking(|db| db.get_selected_threads())
            .await
            .context("Failed to load selected threads")?;
        if threads.is_empty() {
            debug!("Skipping suggestion cycle: no selected threads");
            return Ok(report);
        }

        let system_prompt = self.prompts.get(SYSTEM_PROMPT)?.content;

        info!(
            "Suggestion cycle start: threads={} k={} max_pending={} cooldown={}m",
            threads.len(),
            settings.k_messages,
            settings.max_suggestions_per_chat,
            settings.cooldown_minutes
        );

        for thread in &threads {
            if cancel.is_cancelled() {
                info!("Suggestion cycle cancelled, leaving remaining threads for the next run");
                report.cancelled = true;
                break;
            }

            let outcome = match self.process_thread(thread, &settings, &system_prompt).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(
                        "Suggestion generation failed for thread {} ({}): {}",
                        thread.id, thread.title, message
                    );
                    self.record_failure(thread.id, &message).await;
                    ThreadOutcome::Failed(message)
                }
            };
            debug!("Thread {}: {:?}", thread.id, outcome);
            report.outcomes.push((thread.id, outcome));
        }

        info!(
            "Suggestion cycle done: created={} skipped={} failed={}",
            report.created().len(),
            report.skipped(),
            report.failed()
        );
        Ok(report)
    }

    async fn process_thread(
        &self,
        thread: &ThreadRecord,
        settings: &SchedulerSettings,
        system_prompt: &str,
    ) -> anyhow::Result<ThreadOutcome> {
        let thread_id = thread.id;

        let pending = self
            .db
            .run_blocking(move |db| db.count_pending_suggestions(thread_id))
            .await?;
        if pending >= settings.max_suggestions_per_chat {
            return Ok(ThreadOutcome::QuotaFull);
        }

        if settings.cooldown_minutes > 0 {
            let last_created = self
                .db
                .run_blocking(move |db| db.latest_suggestion_created_at(thread_id))
                .await?;
            if let Some(last_created) = last_created {
                let cooldown = chrono::Duration::minutes(i64::from(settings.cooldown_minutes));
                if Utc::now() - last_created < cooldown {
                    return Ok(ThreadOutcome::CoolingDown);
                }
            }
        }

        let fetched = self
            .connector
            .fetch_last_messages(thread_id, settings.k_messages as usize)
            .await
            .context("Failed to fetch messages")?;

        let source: Vec<SourceMessage> = fetched
            .into_iter()
            .filter_map(|m| {
                let text = m.text.trim().to_string();
                if text.is_empty() {
                    return None;
                }
                Some(SourceMessage { text, ..m })
            })
            .collect();

        let Some(newest) = source.last() else {
            return Ok(ThreadOutcome::NoMessages);
        };
        let latest_id = source.iter().map(|m| m.id).max().unwrap_or(newest.id);

        if thread
            .last_seen_message_id
            .is_some_and(|seen| latest_id <= seen)
        {
            return Ok(ThreadOutcome::NoNewMessages);
        }

        // Our own message is the newest one: nothing to answer yet
        if newest.from_self {
            self.db
                .run_blocking(move |db| db.advance_last_seen(thread_id, latest_id))
                .await?;
            return Ok(ThreadOutcome::NoReplyNeeded);
        }

        let messages_json = serde_json::to_string(&source)?;
        let user_prompt = self
            .prompts
            .render(
                SUGGEST_REPLY_PROMPT,
                &[
                    ("chat_title", thread.title.as_str()),
                    ("language_hint", thread.language_hint.as_deref().unwrap_or("")),
                    ("messages_json", messages_json.as_str()),
                ],
            )?
            .content;

        let reply: ReplySuggestion = self
            .llm
            .request_structured(system_prompt, &user_prompt)
            .await?;

        // Only keep a target the model could actually have seen
        let reply_to_message_id = reply
            .reply_to_message_id
            .filter(|id| source.iter().any(|m| m.id == *id && !m.from_self));

        let new = NewSuggestion {
            thread_id,
            source_messages_json: messages_json,
            suggested_text: reply.suggested_text,
            ru_translation: reply.ru_translation,
            status: SuggestionStatus::Pending,
            error: None,
            reply_to_message_id,
        };
        let id = self
            .db
            .run_blocking(move |db| db.create_suggestion_and_advance(&new, latest_id))
            .await?;
        Ok(ThreadOutcome::Created(id))
    }

    async fn record_failure(&self, thread_id: i64, message: &str) {
        let new = NewSuggestion::failed(thread_id, message);
        if let Err(e) = self
            .db
            .run_blocking(move |db| db.create_suggestion(&new))
            .await
        {
            error!(
                "Failed to persist failed suggestion record for thread {}: {}",
                thread_id, e
            );
        }
    }

    /// Keeps the newest `keep_last_per_chat` suggestions of every thread. Zero disables cleanup.
    pub async fn cleanup_old_suggestions(&self, keep_last_per_chat: usize) -> anyhow::Result<usize> {
        let removed = self
            .db
            .run_blocking(move |db| db.cleanup_old_suggestions(keep_last_per_chat))
            .await?;
        if removed > 0 {
            info!("Retention: removed {} old suggestions", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connector::fake::FakeConnector;
    use crate::connector::ThreadInfo;
    use crate::llm::client::tests::ScriptedTransport;
    use crate::llm::{ChatReply, TransportError};
    use std::sync::atomic::Ordering;

    pub fn thread(id: i64, title: &str) -> ThreadInfo {
        ThreadInfo {
            id,
            title: title.to_string(),
        }
    }

    pub fn incoming(id: i64, text: &str) -> SourceMessage {
        SourceMessage::new(id, false, text)
    }

    pub fn outgoing(id: i64, text: &str) -> SourceMessage {
        SourceMessage::new(id, true, text)
    }

    /// Store with every connector thread selected.
    pub fn test_db(connector: &FakeConnector) -> Database {
        let db = Database::new(&Config::for_tests()).unwrap();
        db.execute_init().unwrap();
        db.upsert_threads(&connector.threads).unwrap();
        let ids: Vec<i64> = connector.threads.iter().map(|t| t.id).collect();
        db.set_selected_threads(&ids).unwrap();
        db
    }

    pub fn service_with(
        db: &Database,
        connector: Arc<FakeConnector>,
        llm: LlmClient,
    ) -> SuggestionService {
        SuggestionService::new(
            db.clone(),
            connector,
            Arc::new(llm),
            Arc::new(PromptStore::new("prompts-not-on-disk")),
        )
    }

    fn setup(
        connector: FakeConnector,
        transport: &Arc<ScriptedTransport>,
    ) -> (SuggestionService, Database, Arc<FakeConnector>) {
        let db = test_db(&connector);
        let connector = Arc::new(connector);
        let llm = LlmClient::with_transport(transport.clone(), "gpt-4o-mini", 0);
        (service_with(&db, connector.clone(), llm), db, connector)
    }

    fn one_thread(messages: Vec<SourceMessage>) -> FakeConnector {
        FakeConnector {
            threads: vec![thread(1, "Alice")],
            ..FakeConnector::authorized()
        }
        .with_messages(1, messages)
    }

    fn watermark(db: &Database, thread_id: i64) -> Option<i64> {
        db.get_thread(thread_id).unwrap().unwrap().last_seen_message_id
    }

    #[tokio::test]
    async fn test_creates_pending_suggestion() {
        let transport = ScriptedTransport::always(Ok(ChatReply::text(
            r#"{"suggested_text": "Yes, after six", "ru_translation": "Да, после шести", "reply_to_message_id": 2}"#,
        )));
        let (service, db, _) = setup(
            one_thread(vec![incoming(1, "hi"), incoming(2, "  are you free?  ")]),
            &transport,
        );

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        let created = report.created();
        assert_eq!(created.len(), 1);
        assert!(!report.cancelled);

        let record = db.get_suggestion(created[0]).unwrap().unwrap();
        assert_eq!(record.status, SuggestionStatus::Pending);
        assert_eq!(record.suggested_text, "Yes, after six");
        assert_eq!(record.reply_to_message_id, Some(2));
        let source = record.source_messages().unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source[1].text, "are you free?");
        assert_eq!(watermark(&db, 1), Some(2));

        let request = transport.request(0);
        assert!(request.user_prompt.contains("Conversation: Alice"));
        assert!(request.user_prompt.contains("are you free?"));
    }

    #[tokio::test]
    async fn test_quota_full_skips_thread() {
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, connector) = setup(one_thread(vec![incoming(1, "hi")]), &transport);

        service.generate_cycle(&CancellationToken::new()).await.unwrap();
        connector.set_messages(1, vec![incoming(1, "hi"), incoming(2, "hello?")]);

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes, vec![(1, ThreadOutcome::QuotaFull)]);
        assert_eq!(db.count_pending_suggestions(1).unwrap(), 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_skips_recent_threads() {
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, connector) = setup(one_thread(vec![incoming(1, "hi")]), &transport);
        db.save_settings(&SchedulerSettings {
            max_suggestions_per_chat: 5,
            cooldown_minutes: 10,
            ..Default::default()
        })
        .unwrap();

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        let first = report.created()[0];

        connector.set_messages(1, vec![incoming(1, "hi"), incoming(2, "still there?")]);
        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes, vec![(1, ThreadOutcome::CoolingDown)]);

        // A zone-less timestamp is read as UTC, so this one is long past the window
        db.set_suggestion_created_at(first, "2020-01-01 00:00:00");
        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.created().len(), 1);
        assert_eq!(watermark(&db, 1), Some(2));
    }

    #[tokio::test]
    async fn test_own_last_message_advances_watermark_only() {
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, _) = setup(
            one_thread(vec![incoming(4, "thanks!"), outgoing(5, "you're welcome")]),
            &transport,
        );

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes, vec![(1, ThreadOutcome::NoReplyNeeded)]);
        assert_eq!(watermark(&db, 1), Some(5));
        assert_eq!(db.count_pending_suggestions(1).unwrap(), 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_seen_messages_are_not_resuggested() {
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, _) = setup(
            one_thread(vec![incoming(3, "hey"), incoming(5, "you there?")]),
            &transport,
        );
        db.advance_last_seen(1, 7).unwrap();

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes, vec![(1, ThreadOutcome::NoNewMessages)]);
        assert_eq!(watermark(&db, 1), Some(7));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_blank_messages_are_ignored() {
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, _) = setup(
            one_thread(vec![incoming(1, "   "), incoming(2, "")]),
            &transport,
        );

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes, vec![(1, ThreadOutcome::NoMessages)]);
        assert_eq!(watermark(&db, 1), None);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_thread() {
        let connector = FakeConnector {
            threads: vec![thread(1, "alpha"), thread(2, "Bravo")],
            failing: vec![1],
            ..FakeConnector::authorized()
        }
        .with_messages(2, vec![incoming(9, "ping?")]);
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, _) = setup(connector, &transport);

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].0, 1);
        assert!(matches!(report.outcomes[0].1, ThreadOutcome::Failed(_)));
        assert!(matches!(report.outcomes[1].1, ThreadOutcome::Created(_)));
        assert_eq!(report.failed(), 1);

        let failed = db.list_suggestions(Some(SuggestionStatus::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].thread_id, 1);
        assert!(failed[0].error.as_deref().unwrap().contains("fetch failed"));
        assert_eq!(watermark(&db, 1), None);
        assert_eq!(watermark(&db, 2), Some(9));
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_watermark() {
        let transport =
            ScriptedTransport::always(Err(TransportError::Unauthorized("bad key".into())));
        let (service, db, _) = setup(one_thread(vec![incoming(1, "hello?")]), &transport);

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(watermark(&db, 1), None);
        // failed records do not count against the quota
        assert_eq!(db.count_pending_suggestions(1).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reply_target_must_be_incoming_in_window() {
        let transport = ScriptedTransport::new(vec![
            Ok(ChatReply::text(
                r#"{"suggested_text": "ok", "ru_translation": "ок", "reply_to_message_id": 1}"#,
            )),
        ]);
        let (service, db, _) = setup(
            one_thread(vec![outgoing(1, "lunch?"), incoming(2, "sure")]),
            &transport,
        );

        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        let record = db.get_suggestion(report.created()[0]).unwrap().unwrap();
        assert_eq!(record.reply_to_message_id, None);
    }

    #[tokio::test]
    async fn test_gate_skips_without_side_effects() {
        let connector = FakeConnector {
            authorized: false,
            ..one_thread(vec![incoming(1, "hi")])
        };
        let transport = ScriptedTransport::new(vec![]);
        let (service, _, connector) = setup(connector, &transport);
        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(connector.fetch_calls.load(Ordering::SeqCst), 0);

        let connector = one_thread(vec![incoming(1, "hi")]);
        let db = test_db(&connector);
        let connector = Arc::new(connector);
        let llm = LlmClient::new(&Config::for_tests()).unwrap();
        let service = service_with(&db, connector.clone(), llm);
        let report = service.generate_cycle(&CancellationToken::new()).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(connector.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_leaves_threads() {
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, _) = setup(one_thread(vec![incoming(1, "hi")]), &transport);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = service.generate_cycle(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.outcomes.is_empty());
        assert_eq!(db.count_pending_suggestions(1).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_old_suggestions() {
        let transport = ScriptedTransport::new(vec![]);
        let (service, db, _) = setup(one_thread(vec![incoming(1, "hi")]), &transport);
        for _ in 0..3 {
            db.create_suggestion(&NewSuggestion::failed(1, "x")).unwrap();
        }
        assert_eq!(service.cleanup_old_suggestions(0).await.unwrap(), 0);
        assert_eq!(service.cleanup_old_suggestions(1).await.unwrap(), 2);
    }
}

use crate::connector::MessageConnector;
use crate::db::Database;
use crate::models::{SuggestionRecord, SuggestionStatus};
use crate::reply_target;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

const EMPTY_TEXT_ERROR: &str = "Empty suggested_text; nothing to send.";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("suggestion {0} not found")]
    NotFound(i64),
    #[error("suggestion {id} is {status}, only pending suggestions can be dispatched")]
    NotPending { id: i64, status: SuggestionStatus },
    #[error("suggestion {0} is already being dispatched")]
    InFlight(i64),
    #[error("{}", EMPTY_TEXT_ERROR)]
    EmptyText,
    #[error("failed to send suggestion {id}: {message}")]
    Send { id: i64, message: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Acts on reviewed suggestions: sends them through the connector or declines them.
/// Concurrent calls for the same suggestion are refused while one is in flight.
pub struct DispatchService {
    db: Database,
    connector: Arc<dyn MessageConnector>,
    in_flight: Mutex<HashSet<i64>>,
}

/// Releases a suggestion claim when dropped.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<i64>>,
    suggestion_id: i64,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.suggestion_id);
    }
}

impl DispatchService {
    pub fn new(db: Database, connector: Arc<dyn MessageConnector>) -> Self {
        Self {
            db,
            connector,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Sends the suggestion as a plain message. Returns the new message id.
    pub async fn send(&self, suggestion_id: i64) -> Result<i64, DispatchError> {
        let _claim = self.claim(suggestion_id)?;
        let record = self.load_pending(suggestion_id).await?;
        self.deliver(record, None).await
    }

    /// Sends the suggestion as a reply to the stored target, or to the best incoming
    /// message of its source window. Falls back to a plain message when neither exists.
    pub async fn send_as_reply(&self, suggestion_id: i64) -> Result<i64, DispatchError> {
        let _claim = self.claim(suggestion_id)?;
        let record = self.load_pending(suggestion_id).await?;
        let reply_to = record
            .reply_to_message_id
            .filter(|id| *id > 0)
            .or_else(|| reply_target::select_from_json(&record.source_messages_json));
        self.deliver(record, reply_to).await
    }

    pub async fn decline(&self, suggestion_id: i64) -> Result<(), DispatchError> {
        let _claim = self.claim(suggestion_id)?;
        self.load_pending(suggestion_id).await?;
        self.set_status(suggestion_id, SuggestionStatus::Declined, None)
            .await?;
        info!("Suggestion {} declined", suggestion_id);
        Ok(())
    }

    fn claim(&self, suggestion_id: i64) -> Result<Claim<'_>, DispatchError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !in_flight.insert(suggestion_id) {
            warn!("Suggestion {} is already being dispatched", suggestion_id);
            return Err(DispatchError::InFlight(suggestion_id));
        }
        Ok(Claim {
            in_flight: &self.in_flight,
            suggestion_id,
        })
    }

    async fn load_pending(&self, suggestion_id: i64) -> Result<SuggestionRecord, DispatchError> {
        let record = self
            .db
            .run_blocking(move |db| db.get_suggestion(suggestion_id))
            .await?
            .ok_or(DispatchError::NotFound(suggestion_id))?;
        if record.status != SuggestionStatus::Pending {
            return Err(DispatchError::NotPending {
                id: suggestion_id,
                status: record.status,
            });
        }
        Ok(record)
    }

    async fn deliver(
        &self,
        record: SuggestionRecord,
        reply_to: Option<i64>,
    ) -> Result<i64, DispatchError> {
        let text = record.suggested_text.trim();
        if text.is_empty() {
            self.set_status(record.id, SuggestionStatus::Failed, Some(EMPTY_TEXT_ERROR.to_string()))
                .await?;
            return Err(DispatchError::EmptyText);
        }

        let sent_id = match self
            .connector
            .send_message(record.thread_id, text, reply_to)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let message = format!("{:#}", e);
                error!(
                    "Failed to send suggestion {} to thread {} (reply_to={:?}): {}",
                    record.id, record.thread_id, reply_to, message
                );
                self.set_status(record.id, SuggestionStatus::Failed, Some(message.clone()))
                    .await?;
                return Err(DispatchError::Send {
                    id: record.id,
                    message,
                });
            }
        };

        // Our own message is now the newest; the next cycle has nothing new to answer
        if sent_id > 0 {
            let thread_id = record.thread_id;
            if let Err(e) = self
                .db
                .run_blocking(move |db| db.advance_last_seen(thread_id, sent_id))
                .await
            {
                warn!("Failed to advance watermark for thread {}: {}", thread_id, e);
            }
        }
        self.set_status(record.id, SuggestionStatus::Sent, None)
            .await?;
        info!(
            "Suggestion {} sent to thread {} as message {}",
            record.id, record.thread_id, sent_id
        );
        Ok(sent_id)
    }

    async fn set_status(
        &self,
        suggestion_id: i64,
        status: SuggestionStatus,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        self.db
            .run_blocking(move |db| {
                db.update_suggestion_status(suggestion_id, status, error.as_deref())
            })
            .await
    }
}

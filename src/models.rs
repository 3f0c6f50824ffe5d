use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A conversation the scheduler may generate replies for, plus its watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: i64,
    pub title: String,
    pub language_hint: Option<String>,
    pub is_selected: bool,
    /// Id of the newest message already considered by the cycle engine.
    pub last_seen_message_id: Option<i64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Snapshot of a fetched message. Only ever persisted inside a suggestion's JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    pub date: String,
    pub from_self: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
}

impl SourceMessage {
    pub fn new(id: i64, from_self: bool, text: impl Into<String>) -> Self {
        Self {
            id,
            date: crate::db::utc_now_string(),
            from_self,
            sender_name: Some(if from_self { "me" } else { "other" }.to_string()),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuggestionStatus {
    Pending,
    Sent,
    Declined,
    Failed,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Sent => "sent",
            SuggestionStatus::Declined => "declined",
            SuggestionStatus::Failed => "failed",
        }
    }

    /// Only pending suggestions move, and only to a final state.
    pub fn can_transition_to(&self, next: SuggestionStatus) -> bool {
        matches!(
            (self, next),
            (
                SuggestionStatus::Pending,
                SuggestionStatus::Sent | SuggestionStatus::Declined | SuggestionStatus::Failed
            )
        )
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown suggestion status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for SuggestionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "sent" => Ok(SuggestionStatus::Sent),
            "declined" => Ok(SuggestionStatus::Declined),
            "failed" => Ok(SuggestionStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl ToSql for SuggestionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SuggestionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestionRecord {
    pub id: i64,
    pub thread_id: i64,
    pub created_at: String,
    pub source_messages_json: String,
    pub suggested_text: String,
    pub ru_translation: String,
    pub status: SuggestionStatus,
    pub error: Option<String>,
    pub updated_at: String,
    pub reply_to_message_id: Option<i64>,
}

impl SuggestionRecord {
    pub fn source_messages(&self) -> anyhow::Result<Vec<SourceMessage>> {
        Ok(serde_json::from_str(&self.source_messages_json)?)
    }
}

/// Listing row joined with the owning thread's title.
#[derive(Debug, Clone)]
pub struct SuggestionView {
    pub id: i64,
    pub thread_id: i64,
    pub thread_title: String,
    pub created_at: String,
    pub suggested_text: String,
    pub ru_translation: String,
    pub status: SuggestionStatus,
    pub error: Option<String>,
}

/// Operator-editable scheduler knobs, re-read on every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub k_messages: u32,
    pub n_minutes: u32,
    pub max_suggestions_per_chat: u32,
    pub cooldown_minutes: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            k_messages: 20,
            n_minutes: 5,
            max_suggestions_per_chat: 1,
            cooldown_minutes: 0,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{field} must be between {min} and {max}, got {value}")]
pub struct SettingsError {
    pub field: &'static str,
    pub min: u32,
    pub max: u32,
    pub value: u32,
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let checks = [
            ("k_messages", self.k_messages, 1, 100),
            ("n_minutes", self.n_minutes, 1, 1440),
            ("max_suggestions_per_chat", self.max_suggestions_per_chat, 1, 10),
            ("cooldown_minutes", self.cooldown_minutes, 0, 1440),
        ];
        for (field, value, min, max) in checks {
            if value < min || value > max {
                return Err(SettingsError {
                    field,
                    min,
                    max,
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Structured output the completion backend must produce for a thread.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ReplySuggestion {
    /// Reply text in the conversation's language.
    pub suggested_text: String,
    /// Russian translation of the reply for the reviewer.
    pub ru_translation: String,
    /// Id of the incoming message this reply answers, if any.
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
}

impl crate::llm::StructuredReply for ReplySuggestion {
    fn validate(&self) -> Result<(), String> {
        if self.suggested_text.trim().is_empty() {
            return Err("suggested_text must be a non-empty string".to_string());
        }
        if self.ru_translation.trim().is_empty() {
            return Err("ru_translation must be a non-empty string".to_string());
        }
        Ok(())
    }
}

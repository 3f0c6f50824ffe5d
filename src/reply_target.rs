//! Picks which incoming message a suggestion should be sent as a reply to.
//!
//! Scoring favours recent messages and questions, and penalises very short or
//! punctuation-only messages:
//!
//! ```text
//! score = index_from_oldest + 50 (question) - 25 (shorter than 3 chars) - 25 (no word char)
//! ```

use crate::models::SourceMessage;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[?？¿]").unwrap());
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w").unwrap());

const QUESTION_BONUS: i64 = 50;
const SHORT_PENALTY: i64 = 25;
const NO_WORD_PENALTY: i64 = 25;

fn score(index: usize, text: &str) -> i64 {
    let text = text.trim();
    let mut score = index as i64;
    if QUESTION_RE.is_match(text) {
        score += QUESTION_BONUS;
    }
    if text.chars().count() < 3 {
        score -= SHORT_PENALTY;
    }
    if !WORD_RE.is_match(text) {
        score -= NO_WORD_PENALTY;
    }
    score
}

/// Returns the id of the best incoming message to reply to, or `None` when there is no candidate.
///
/// Ties go to the later message.
pub fn select_reply_target(messages: &[SourceMessage]) -> Option<i64> {
    pick(
        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.from_self && m.id > 0)
            .map(|(idx, m)| (idx, m.id, m.text.as_str())),
    )
}

/// Same selection over a persisted `source_messages_json` payload.
///
/// Entries that are not objects, lack a positive integer id, or are not explicitly
/// incoming are skipped; unparseable payloads select nothing.
pub fn select_from_json(source_messages_json: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(source_messages_json).ok()?;
    let items = value.as_array()?;
    pick(items.iter().enumerate().filter_map(|(idx, item)| {
        let obj = item.as_object()?;
        if obj.get("from_self").and_then(Value::as_bool) != Some(false) {
            return None;
        }
        let id = obj.get("id").and_then(Value::as_i64).filter(|id| *id > 0)?;
        let text = obj.get("text").and_then(Value::as_str).unwrap_or("");
        Some((idx, id, text))
    }))
}

fn pick<'a>(candidates: impl Iterator<Item = (usize, i64, &'a str)>) -> Option<i64> {
    let mut best: Option<(i64, i64)> = None;
    for (idx, id, text) in candidates {
        let s = score(idx, text);
        // `>=` lets a later message win on equal score
        if best.map_or(true, |(best_score, _)| s >= best_score) {
            best = Some((s, id));
        }
    }
    best.map(|(_, id)| id)
}

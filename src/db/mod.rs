use crate::config::Config;
use crate::connector::ThreadInfo;
use crate::models::{
    SchedulerSettings, SuggestionRecord, SuggestionStatus, SuggestionView, ThreadRecord,
};
use anyhow::Context as _;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub mod schema;

/// Current time as an RFC 3339 UTC string with second precision.
pub fn utc_now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parses a stored timestamp. Values without an offset are taken as UTC.
pub fn parse_utc(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(ts, fmt).ok())
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// Row to insert into `suggestions`.
#[derive(Debug, Clone)]
pub struct NewSuggestion {
    pub thread_id: i64,
    pub source_messages_json: String,
    pub suggested_text: String,
    pub ru_translation: String,
    pub status: SuggestionStatus,
    pub error: Option<String>,
    pub reply_to_message_id: Option<i64>,
}

impl NewSuggestion {
    /// Empty-payload record that keeps a per-thread failure visible to reviewers.
    pub fn failed(thread_id: i64, error: impl Into<String>) -> Self {
        Self {
            thread_id,
            source_messages_json: "[]".to_string(),
            suggested_text: String::new(),
            ru_translation: String::new(),
            status: SuggestionStatus::Failed,
            error: Some(error.into()),
            reply_to_message_id: None,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        if config.database_url != ":memory:" {
            if let Some(parent) = Path::new(&config.database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory {:?}", parent)
                    })?;
                }
            }
        }

        let conn = Connection::open(&config.database_url)
            .with_context(|| format!("Failed to open database {}", config.database_url))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        // journal_mode answers with the resulting mode ("memory" for in-memory databases)
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs a synchronous store call on the blocking pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("Database task panicked")?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn();
        conn.execute_batch(schema::SCHEMA)?;

        let defaults = SchedulerSettings::default();
        conn.execute(
            "INSERT INTO settings (id, k_messages, n_minutes, max_suggestions_per_chat, cooldown_minutes, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO NOTHING",
            params![
                defaults.k_messages,
                defaults.n_minutes,
                defaults.max_suggestions_per_chat,
                defaults.cooldown_minutes,
                utc_now_string()
            ],
        )?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Settings ---

    pub fn get_settings(&self) -> anyhow::Result<SchedulerSettings> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT k_messages, n_minutes, max_suggestions_per_chat, cooldown_minutes
                 FROM settings WHERE id = 1",
                [],
                |row| {
                    Ok(SchedulerSettings {
                        k_messages: row.get(0)?,
                        n_minutes: row.get(1)?,
                        max_suggestions_per_chat: row.get(2)?,
                        cooldown_minutes: row.get::<_, Option<u32>>(3)?.unwrap_or(0),
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &SchedulerSettings) -> anyhow::Result<()> {
        settings.validate()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO settings (id, k_messages, n_minutes, max_suggestions_per_chat, cooldown_minutes, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                k_messages = excluded.k_messages,
                n_minutes = excluded.n_minutes,
                max_suggestions_per_chat = excluded.max_suggestions_per_chat,
                cooldown_minutes = excluded.cooldown_minutes,
                updated_at = excluded.updated_at",
            params![
                settings.k_messages,
                settings.n_minutes,
                settings.max_suggestions_per_chat,
                settings.cooldown_minutes,
                utc_now_string()
            ],
        )?;
        Ok(())
    }

    // --- Threads ---

    fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
        Ok(ThreadRecord {
            id: row.get(0)?,
            title: row.get(1)?,
            language_hint: row.get(2)?,
            is_selected: row.get(3)?,
            last_seen_message_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    /// Inserts new threads and refreshes titles of known ones; selection is left alone.
    pub fn upsert_threads(&self, threads: &[ThreadInfo]) -> anyhow::Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = utc_now_string();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO threads (id, title, is_selected, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    updated_at = excluded.updated_at",
            )?;
            for thread in threads {
                stmt.execute(params![thread.id, thread.title, now])?;
            }
        }
        tx.commit()?;
        Ok(threads.len())
    }

    pub fn list_threads(&self) -> anyhow::Result<Vec<ThreadRecord>> {
        self.query_threads(false)
    }

    /// Selected threads ordered by case-insensitive title.
    pub fn get_selected_threads(&self) -> anyhow::Result<Vec<ThreadRecord>> {
        self.query_threads(true)
    }

    fn query_threads(&self, selected_only: bool) -> anyhow::Result<Vec<ThreadRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT id, title, language_hint, is_selected, last_seen_message_id, created_at, updated_at
             FROM threads {}
             ORDER BY lower(title) ASC, id ASC",
            if selected_only { "WHERE is_selected = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::thread_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn get_thread(&self, thread_id: i64) -> anyhow::Result<Option<ThreadRecord>> {
        let conn = self.conn();
        let thread = conn
            .query_row(
                "SELECT id, title, language_hint, is_selected, last_seen_message_id, created_at, updated_at
                 FROM threads WHERE id = ?1",
                [thread_id],
                Self::thread_from_row,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn set_selected_threads(&self, thread_ids: &[i64]) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = utc_now_string();
        tx.execute("UPDATE threads SET is_selected = 0, updated_at = ?1", [&now])?;
        {
            let mut stmt =
                tx.prepare("UPDATE threads SET is_selected = 1, updated_at = ?1 WHERE id = ?2")?;
            for id in thread_ids {
                stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_language_hint(&self, thread_id: i64, hint: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn();
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());
        conn.execute(
            "UPDATE threads SET language_hint = ?1, updated_at = ?2 WHERE id = ?3",
            params![hint, utc_now_string(), thread_id],
        )?;
        Ok(())
    }

    /// Moves the watermark forward only; returns whether anything changed.
    pub fn advance_last_seen(&self, thread_id: i64, message_id: i64) -> anyhow::Result<bool> {
        let conn = self.conn();
        Ok(Self::advance_last_seen_in(&conn, thread_id, message_id)? > 0)
    }

    fn advance_last_seen_in(
        conn: &Connection,
        thread_id: i64,
        message_id: i64,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE threads SET last_seen_message_id = ?1, updated_at = ?2
             WHERE id = ?3 AND (last_seen_message_id IS NULL OR last_seen_message_id < ?1)",
            params![message_id, utc_now_string(), thread_id],
        )
    }

    // --- Suggestions ---

    fn insert_suggestion(conn: &Connection, new: &NewSuggestion) -> rusqlite::Result<i64> {
        let now = utc_now_string();
        conn.execute(
            "INSERT INTO suggestions
                (thread_id, created_at, source_messages_json, suggested_text, ru_translation,
                 status, error, updated_at, reply_to_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?2, ?8)",
            params![
                new.thread_id,
                now,
                new.source_messages_json,
                new.suggested_text,
                new.ru_translation,
                new.status,
                new.error,
                new.reply_to_message_id
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_suggestion(&self, new: &NewSuggestion) -> anyhow::Result<i64> {
        let conn = self.conn();
        Ok(Self::insert_suggestion(&conn, new)?)
    }

    /// Inserts the suggestion and advances the thread watermark in one transaction.
    pub fn create_suggestion_and_advance(
        &self,
        new: &NewSuggestion,
        last_seen_message_id: i64,
    ) -> anyhow::Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = Self::insert_suggestion(&tx, new)?;
        Self::advance_last_seen_in(&tx, new.thread_id, last_seen_message_id)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_suggestion(&self, suggestion_id: i64) -> anyhow::Result<Option<SuggestionRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, thread_id, created_at, source_messages_json, suggested_text,
                        ru_translation, status, error, updated_at, reply_to_message_id
                 FROM suggestions WHERE id = ?1",
                [suggestion_id],
                |row| {
                    Ok(SuggestionRecord {
                        id: row.get(0)?,
                        thread_id: row.get(1)?,
                        created_at: row.get(2)?,
                        source_messages_json: row.get(3)?,
                        suggested_text: row.get(4)?,
                        ru_translation: row.get(5)?,
                        status: row.get(6)?,
                        error: row.get(7)?,
                        updated_at: row.get(8)?,
                        reply_to_message_id: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Pending first, then failed, sent, declined; newest first within each group.
    pub fn list_suggestions(
        &self,
        status: Option<SuggestionStatus>,
        limit: usize,
    ) -> anyhow::Result<Vec<SuggestionView>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.thread_id, t.title, s.created_at, s.suggested_text,
                    s.ru_translation, s.status, s.error
             FROM suggestions s
             JOIN threads t ON t.id = s.thread_id
             WHERE ?1 IS NULL OR s.status = ?1
             ORDER BY
                CASE s.status
                    WHEN 'pending' THEN 0
                    WHEN 'failed' THEN 1
                    WHEN 'sent' THEN 2
                    WHEN 'declined' THEN 3
                    ELSE 9
                END,
                s.created_at DESC,
                s.id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![status, limit as i64], |row| {
            Ok(SuggestionView {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                thread_title: row.get(2)?,
                created_at: row.get(3)?,
                suggested_text: row.get(4)?,
                ru_translation: row.get(5)?,
                status: row.get(6)?,
                error: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Applies a status transition; fails unless the current status allows it.
    pub fn update_suggestion_status(
        &self,
        suggestion_id: i64,
        status: SuggestionStatus,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current: Option<SuggestionStatus> = tx
            .query_row(
                "SELECT status FROM suggestions WHERE id = ?1",
                [suggestion_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| anyhow::anyhow!("Suggestion {} not found", suggestion_id))?;
        if !current.can_transition_to(status) {
            anyhow::bail!(
                "Suggestion {} cannot move from {} to {}",
                suggestion_id,
                current,
                status
            );
        }
        tx.execute(
            "UPDATE suggestions SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status, error, utc_now_string(), suggestion_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn count_pending_suggestions(&self, thread_id: i64) -> anyhow::Result<u32> {
        let conn = self.conn();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM suggestions WHERE thread_id = ?1 AND status = ?2",
            params![thread_id, SuggestionStatus::Pending],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn latest_suggestion_created_at(
        &self,
        thread_id: i64,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let created_at: Option<String> = conn
            .query_row(
                "SELECT created_at FROM suggestions WHERE thread_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(created_at.as_deref().and_then(parse_utc))
    }

    /// Deletes everything beyond the newest `keep_last_per_thread` suggestions of each thread.
    pub fn cleanup_old_suggestions(&self, keep_last_per_thread: usize) -> anyhow::Result<usize> {
        if keep_last_per_thread == 0 {
            return Ok(0);
        }
        let conn = self.conn();
        let count = conn.execute(
            "DELETE FROM suggestions WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY thread_id ORDER BY created_at DESC, id DESC
                    ) AS rn
                    FROM suggestions
                ) WHERE rn > ?1
             )",
            [keep_last_per_thread as i64],
        )?;
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn set_suggestion_created_at(&self, suggestion_id: i64, created_at: &str) {
        self.conn()
            .execute(
                "UPDATE suggestions SET created_at = ?1 WHERE id = ?2",
                params![created_at, suggestion_id],
            )
            .unwrap();
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) {
        self.conn().execute_batch(sql).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::new(&Config::for_tests()).unwrap();
        db.execute_init().unwrap();
        db
    }

    fn seed_thread(db: &Database, id: i64, title: &str) {
        db.upsert_threads(&[ThreadInfo {
            id,
            title: title.to_string(),
        }])
        .unwrap();
    }

    fn pending(thread_id: i64) -> NewSuggestion {
        NewSuggestion {
            thread_id,
            source_messages_json: "[]".to_string(),
            suggested_text: "hello".to_string(),
            ru_translation: "привет".to_string(),
            status: SuggestionStatus::Pending,
            error: None,
            reply_to_message_id: None,
        }
    }

    #[test]
    fn test_settings_defaults_and_save() {
        let db = test_db();
        assert_eq!(db.get_settings().unwrap(), SchedulerSettings::default());

        let custom = SchedulerSettings {
            k_messages: 50,
            n_minutes: 10,
            max_suggestions_per_chat: 3,
            cooldown_minutes: 15,
        };
        db.save_settings(&custom).unwrap();
        assert_eq!(db.get_settings().unwrap(), custom);

        // Init again must not reset operator changes
        db.execute_init().unwrap();
        assert_eq!(db.get_settings().unwrap(), custom);

        let invalid = SchedulerSettings {
            n_minutes: 0,
            ..custom
        };
        assert!(db.save_settings(&invalid).is_err());
        assert_eq!(db.get_settings().unwrap(), custom);
    }

    #[test]
    fn test_thread_upsert_preserves_selection() {
        let db = test_db();
        seed_thread(&db, 1, "bravo");
        seed_thread(&db, 2, "Alpha");
        db.set_selected_threads(&[1]).unwrap();

        seed_thread(&db, 1, "Bravo renamed");
        let selected = db.get_selected_threads().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].title, "Bravo renamed");

        let all = db.list_threads().unwrap();
        let titles: Vec<_> = all.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Alpha", "Bravo renamed"]);

        db.set_selected_threads(&[2]).unwrap();
        let selected = db.get_selected_threads().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 2);
    }

    #[test]
    fn test_language_hint() {
        let db = test_db();
        seed_thread(&db, 1, "t");
        db.set_language_hint(1, Some(" en ")).unwrap();
        assert_eq!(db.get_thread(1).unwrap().unwrap().language_hint.as_deref(), Some("en"));
        db.set_language_hint(1, Some("")).unwrap();
        assert_eq!(db.get_thread(1).unwrap().unwrap().language_hint, None);
    }

    #[test]
    fn test_watermark_only_advances() {
        let db = test_db();
        seed_thread(&db, 1, "t");

        assert!(db.advance_last_seen(1, 10).unwrap());
        assert!(!db.advance_last_seen(1, 5).unwrap());
        assert!(!db.advance_last_seen(1, 10).unwrap());
        assert_eq!(db.get_thread(1).unwrap().unwrap().last_seen_message_id, Some(10));

        assert!(db.advance_last_seen(1, 11).unwrap());
        assert_eq!(db.get_thread(1).unwrap().unwrap().last_seen_message_id, Some(11));
    }

    #[test]
    fn test_create_and_advance_is_atomic_unit() {
        let db = test_db();
        seed_thread(&db, 1, "t");
        let id = db.create_suggestion_and_advance(&pending(1), 42).unwrap();

        let record = db.get_suggestion(id).unwrap().unwrap();
        assert_eq!(record.status, SuggestionStatus::Pending);
        assert_eq!(db.get_thread(1).unwrap().unwrap().last_seen_message_id, Some(42));
        assert_eq!(db.count_pending_suggestions(1).unwrap(), 1);
        assert!(db.latest_suggestion_created_at(1).unwrap().is_some());
    }

    #[test]
    fn test_status_transitions_guarded() {
        let db = test_db();
        seed_thread(&db, 1, "t");
        let id = db.create_suggestion(&pending(1)).unwrap();

        db.update_suggestion_status(id, SuggestionStatus::Declined, None)
            .unwrap();
        assert_eq!(
            db.get_suggestion(id).unwrap().unwrap().status,
            SuggestionStatus::Declined
        );
        assert!(db
            .update_suggestion_status(id, SuggestionStatus::Sent, None)
            .is_err());
        assert!(db
            .update_suggestion_status(9999, SuggestionStatus::Sent, None)
            .is_err());
        assert_eq!(db.count_pending_suggestions(1).unwrap(), 0);
    }

    #[test]
    fn test_list_suggestions_ordering_and_filter() {
        let db = test_db();
        seed_thread(&db, 1, "t");
        let a = db.create_suggestion(&pending(1)).unwrap();
        let b = db.create_suggestion(&NewSuggestion::failed(1, "boom")).unwrap();
        let c = db.create_suggestion(&pending(1)).unwrap();
        db.update_suggestion_status(a, SuggestionStatus::Sent, None).unwrap();

        let all = db.list_suggestions(None, 10).unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![c, b, a]);
        assert_eq!(all[1].error.as_deref(), Some("boom"));
        assert_eq!(all[0].thread_title, "t");

        let failed = db.list_suggestions(Some(SuggestionStatus::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, b);
    }

    #[test]
    fn test_parse_utc_naive_is_utc() {
        let aware = parse_utc("2026-01-01T10:00:00+02:00").unwrap();
        assert_eq!(aware.to_rfc3339(), "2026-01-01T08:00:00+00:00");
        let naive = parse_utc("2026-01-01T10:00:00").unwrap();
        assert_eq!(naive.to_rfc3339(), "2026-01-01T10:00:00+00:00");
        let spaced = parse_utc("2026-01-01 10:00:00").unwrap();
        assert_eq!(spaced, naive);
        assert!(parse_utc("yesterday").is_none());
    }

    #[test]
    fn test_cleanup_old_suggestions() {
        let db = test_db();
        seed_thread(&db, 1, "a");
        seed_thread(&db, 2, "b");
        for _ in 0..5 {
            db.create_suggestion(&pending(1)).unwrap();
        }
        let keep = db.create_suggestion(&pending(2)).unwrap();

        assert_eq!(db.cleanup_old_suggestions(0).unwrap(), 0);
        assert_eq!(db.cleanup_old_suggestions(2).unwrap(), 3);
        assert_eq!(db.count_pending_suggestions(1).unwrap(), 2);
        assert!(db.get_suggestion(keep).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = test_db();
        seed_thread(&db, 7, "t");
        let thread = db
            .run_blocking(|db| db.get_thread(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.title, "t");
    }
}

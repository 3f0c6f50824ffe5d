/// Tables are created idempotently on every start; there is no migration history.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS threads (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        language_hint TEXT NULL,
        is_selected INTEGER NOT NULL DEFAULT 0,
        last_seen_message_id INTEGER NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_threads_selected ON threads (is_selected);

    CREATE TABLE IF NOT EXISTS suggestions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        source_messages_json TEXT NOT NULL,
        suggested_text TEXT NOT NULL,
        ru_translation TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT NULL,
        updated_at TEXT NOT NULL,
        reply_to_message_id INTEGER NULL,
        FOREIGN KEY (thread_id) REFERENCES threads (id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_suggestions_status_created ON suggestions (status, created_at);
    CREATE INDEX IF NOT EXISTS idx_suggestions_thread_status ON suggestions (thread_id, status);

    CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        k_messages INTEGER NOT NULL,
        n_minutes INTEGER NOT NULL,
        max_suggestions_per_chat INTEGER NOT NULL,
        cooldown_minutes INTEGER NULL,
        updated_at TEXT NOT NULL
    );
";

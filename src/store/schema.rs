//! SQLite schema, as forward-only versioned migrations.
//!
//! `PRAGMA user_version` records how many entries of [`MIGRATIONS`] have been
//! applied. Migrations only ever append; editing an existing entry requires a
//! full rebuild of the database instead.

pub const MIGRATIONS: &[&str] = &[
    // Migration 1: canonical tables
    r#"
-- Logical grouping of sessions, derived from workspace paths in the logs.
CREATE TABLE projects (
    source TEXT NOT NULL,
    project_key TEXT NOT NULL,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source, project_key)
);

-- One conversation transcript. session_key derives from source + file/row
-- identity, never from content.
CREATE TABLE sessions (
    session_key TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    project_key TEXT NOT NULL,
    external_id TEXT,
    title TEXT,
    created_at TEXT,
    updated_at TEXT,
    forked_from TEXT,                      -- parent session_key, immutable once set
    starred INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT,                     -- per-row fingerprint for multi-session stores
    origin_path TEXT NOT NULL              -- physical file this session came from
);

-- One turn. Ordinals are contiguous from 0 within a session after every
-- (re)import; messages are replaced wholesale, never diffed.
CREATE TABLE messages (
    id INTEGER PRIMARY KEY,
    session_key TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    role TEXT NOT NULL,                    -- 'user', 'assistant', 'system', 'tool'
    content TEXT NOT NULL,
    timestamp TEXT,
    extra_json TEXT,                       -- source-specific metadata bag
    UNIQUE(session_key, ordinal)
);

-- One row per physical input file seen by the sync engine.
CREATE TABLE file_states (
    path TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime_ms INTEGER NOT NULL,
    fingerprint TEXT,
    outcome TEXT NOT NULL,                 -- 'ok', 'skipped_unchanged', 'failed'
    last_error TEXT,
    processed_at TEXT NOT NULL
);
"#,
    // Migration 2: full-text index over message content.
    // External-content FTS5 kept in lockstep with `messages` by triggers, so
    // the index can never be stale for a session inside a committed
    // transaction.
    r#"
CREATE VIRTUAL TABLE messages_fts USING fts5(
    content,
    content=messages,
    content_rowid=id
);

CREATE TRIGGER messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content) VALUES (NEW.id, NEW.content);
END;

CREATE TRIGGER messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content) VALUES('delete', OLD.id, OLD.content);
END;

CREATE TRIGGER messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content) VALUES('delete', OLD.id, OLD.content);
    INSERT INTO messages_fts(rowid, content) VALUES (NEW.id, NEW.content);
END;
"#,
    // Migration 3: query-path indexes
    r#"
CREATE INDEX idx_sessions_source ON sessions(source);
CREATE INDEX idx_sessions_project ON sessions(source, project_key);
CREATE INDEX idx_sessions_updated ON sessions(updated_at DESC);
CREATE INDEX idx_sessions_origin ON sessions(origin_path);
CREATE INDEX idx_sessions_starred ON sessions(starred) WHERE starred = 1;
CREATE INDEX idx_messages_session ON messages(session_key, ordinal);
CREATE INDEX idx_file_states_source ON file_states(source);
"#,
];

//! Source parsers and the canonical record model
//!
//! One parser per supported assistant, all conforming to the same contract:
//! a raw log file in, one or more [`SessionParse`] results out. Parsers are
//! tolerant at record granularity — a malformed message is skipped with a
//! warning — and only fail the whole file when it is structurally unreadable.
//!
//! Source status:
//! - ClaudeCode: JSONL transcripts
//! - Cursor: SQLite store with binary message payloads
//! - Aider: markdown chat history
//! - Codex: rollout JSONL (event_msg and response_item flavors)
//! - GeminiCli: per-session JSON documents

mod aider;
mod claude_code;
mod codex;
mod cursor;
mod gemini;

pub use aider::AiderParser;
pub use claude_code::ClaudeCodeParser;
pub use codex::CodexParser;
pub use cursor::CursorParser;
pub use gemini::GeminiCliParser;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{ParseError, RowDecodeError};

/// Origin of a session. Fixed, closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    ClaudeCode,
    Cursor,
    Aider,
    Codex,
    GeminiCli,
}

impl Source {
    pub const ALL: [Source; 5] = [
        Source::ClaudeCode,
        Source::Cursor,
        Source::Aider,
        Source::Codex,
        Source::GeminiCli,
    ];

    /// Stable name used in storage, config, and session keys.
    pub fn name(&self) -> &'static str {
        match self {
            Source::ClaudeCode => "claude_code",
            Source::Cursor => "cursor",
            Source::Aider => "aider",
            Source::Codex => "codex",
            Source::GeminiCli => "gemini_cli",
        }
    }

    pub fn from_name(name: &str) -> Option<Source> {
        Source::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Conventional log locations when no roots are configured.
    pub fn default_roots(&self) -> Vec<PathBuf> {
        let home = dirs::home_dir().unwrap_or_default();
        match self {
            Source::ClaudeCode => vec![home.join(".claude/projects")],
            Source::Cursor => {
                let mut roots = vec![home.join(".cursor/chats")];
                // Cursor is VS Code-based; the globalStorage DB moved with it.
                roots.push(home.join(".config/Cursor/User/globalStorage"));
                roots.push(home.join("Library/Application Support/Cursor/User/globalStorage"));
                roots
            }
            Source::Aider => vec![home],
            Source::Codex => vec![home.join(".codex/sessions")],
            Source::GeminiCli => vec![home.join(".gemini/tmp")],
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Normalized message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn from_str(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }

    /// Map a source-native role vocabulary onto the canonical set.
    pub fn normalize(raw: &str) -> Option<Role> {
        match raw {
            "user" | "human" => Some(Role::User),
            "assistant" | "agent" | "gemini" | "model" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" | "tool_result" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One canonical conversation turn as produced by a parser.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub role: Role,
    pub content: String,
    /// Best-effort; sources without per-message timestamps inherit the
    /// session timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Source-specific fields preserved verbatim, never interpreted.
    pub extra: Map<String, Value>,
}

impl ParsedMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            extra: Map::new(),
        }
    }
}

/// One session's metadata plus its ordered messages.
#[derive(Debug, Clone)]
pub struct SessionParse {
    pub source: Source,
    /// Derived from source + file/row identity, never from content.
    pub session_key: String,
    /// Original identifier from the source (session id, thread id, ...).
    pub external_id: String,
    pub title: Option<String>,
    pub project_key: String,
    pub project_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub messages: Vec<ParsedMessage>,
    /// Records skipped at message granularity while parsing.
    pub warnings: Vec<RowDecodeError>,
}

impl SessionParse {
    /// Fingerprint of the session's canonical content, used for per-row
    /// change detection in multi-session store files.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for msg in &self.messages {
            hasher.update(msg.role.as_str().as_bytes());
            hasher.update([0x1f]);
            hasher.update(msg.content.as_bytes());
            hasher.update([0x1f]);
            if let Some(ts) = msg.timestamp {
                hasher.update(ts.to_rfc3339().as_bytes());
            }
            hasher.update([0x1e]);
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Derive a stable session key from a file identity.
///
/// Keys must be content-independent so reprocessing an unchanged or edited
/// file updates the same session rather than duplicating it.
pub fn session_key(source: Source, identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.name().as_bytes());
    hasher.update(b":");
    hasher.update(identity.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Session key for a one-file-one-session source.
pub fn file_session_key(source: Source, path: &Path) -> String {
    session_key(source, &path.to_string_lossy())
}

/// Session key for one row inside a multi-session store file.
pub fn row_session_key(source: Source, path: &Path, row_id: &str) -> String {
    session_key(source, &format!("{}#{}", path.to_string_lossy(), row_id))
}

/// Parser contract: discover candidate files under the configured roots and
/// turn one file into canonical sessions.
pub trait SourceParser: Send + Sync {
    fn source(&self) -> Source;

    /// Candidate files under `roots`, in deterministic order.
    fn discover(&self, roots: &[PathBuf]) -> Vec<PathBuf>;

    /// Parse one file. Multi-session store files return one entry per
    /// conversation row; everything else returns exactly one.
    fn parse(&self, path: &Path) -> Result<Vec<SessionParse>, ParseError>;
}

/// Registry of enabled parsers.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn SourceParser>>,
}

impl ParserRegistry {
    pub fn new(config: &Config) -> Self {
        let mut registry = Self { parsers: vec![] };

        if config.is_source_enabled(Source::ClaudeCode) {
            registry.register(Box::new(ClaudeCodeParser));
        }
        if config.is_source_enabled(Source::Cursor) {
            registry.register(Box::new(CursorParser));
        }
        if config.is_source_enabled(Source::Aider) {
            registry.register(Box::new(AiderParser));
        }
        if config.is_source_enabled(Source::Codex) {
            registry.register(Box::new(CodexParser));
        }
        if config.is_source_enabled(Source::GeminiCli) {
            registry.register(Box::new(GeminiCliParser));
        }

        registry
    }

    pub fn register(&mut self, parser: Box<dyn SourceParser>) {
        self.parsers.push(parser);
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn SourceParser> {
        self.parsers.iter().map(|p| p.as_ref())
    }

    pub fn get(&self, source: Source) -> Option<&dyn SourceParser> {
        self.parsers
            .iter()
            .find(|p| p.source() == source)
            .map(|p| p.as_ref())
    }
}

/// Parse a timestamp from the formats seen across sources: RFC3339, a
/// handful of naive layouts, and Unix seconds/milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H-%M-%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    None
}

/// Parse a Unix timestamp, tolerating milliseconds vs seconds.
pub fn parse_unix_timestamp(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = if value > 1e12 { value } else { value * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}

/// Timestamp from a JSON value that may be a string or a number.
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_f64().and_then(parse_unix_timestamp),
        _ => None,
    }
}

/// First line of a message, truncated for display.
pub fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or(text).trim();
    if first_line.chars().count() > 100 {
        let cut: String = first_line.chars().take(97).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}

/// Collect the text blocks of a string-or-array content value.
///
/// Several sources share the `[{type: "text", text: ...}]` block shape.
pub fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let text = s.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Array(items) => {
            let mut parts: Vec<&str> = vec![];
            for item in items {
                if item.get("type").and_then(|t| t.as_str()) != Some("text") {
                    continue;
                }
                if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
            }
            let joined = parts.join("\n");
            let joined = joined.trim();
            (!joined.is_empty()).then(|| joined.to_string())
        }
        _ => None,
    }
}

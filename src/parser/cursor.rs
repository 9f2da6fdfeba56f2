//! Cursor parser
//!
//! Cursor persists chats in SQLite stores, in two flavors:
//!   - Legacy: ~/.cursor/chats/<workspace-id>/<chat-id>/store.db
//!     `blobs` rows hold one serialized message each, either JSON or a
//!     protobuf-framed binary payload; `meta` holds hex-encoded JSON.
//!   - Modern (VS Code globalStorage): .../User/globalStorage/state.vscdb
//!     `cursorDiskKV` rows keyed `composerData:<id>` and
//!     `bubbleId:<composerId>:<bubbleId>`, one conversation per composer.
//!
//! One physical store file can hold many conversations, so `parse` returns
//! one `SessionParse` per conversation row. A row that fails to decode is
//! skipped with a warning, never the whole store.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{
    file_session_key, row_session_key, timestamp_from_value, truncate_title, ParsedMessage, Role,
    SessionParse, Source, SourceParser,
};
use crate::error::{ParseError, RowDecodeError};

pub struct CursorParser;

impl SourceParser for CursorParser {
    fn source(&self) -> Source {
        Source::Cursor
    }

    fn discover(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = vec![];
        for root in roots {
            for entry in WalkDir::new(root)
                .max_depth(4)
                .into_iter()
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name == "store.db" || name == "state.vscdb" {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        files.sort();
        files
    }

    fn parse(&self, path: &Path) -> Result<Vec<SessionParse>, ParseError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| ParseError::invalid("Cursor SQLite store", e.to_string()))?;

        if path.file_name().map(|n| n == "state.vscdb").unwrap_or(false) {
            parse_global_storage(&conn, path)
        } else {
            parse_legacy_store(&conn, path)
        }
    }
}

/// Legacy store.db: one chat per store, messages in `blobs`.
fn parse_legacy_store(conn: &Connection, path: &Path) -> Result<Vec<SessionParse>, ParseError> {
    let chat_id = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let workspace_id = path
        .parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    // Chat name and creation time live in `meta` as hex-encoded JSON.
    let mut chat_name = String::from("Unknown");
    let mut created_at: Option<DateTime<Utc>> = None;
    if let Ok(hex_value) =
        conn.query_row("SELECT value FROM meta LIMIT 1", [], |row| {
            row.get::<_, String>(0)
        })
    {
        if let Ok(bytes) = hex::decode(hex_value.trim()) {
            if let Ok(meta) = serde_json::from_slice::<Value>(&bytes) {
                if let Some(name) = meta.get("name").and_then(|v| v.as_str()) {
                    chat_name = name.to_string();
                }
                created_at = meta.get("createdAt").and_then(timestamp_from_value);
            }
        }
    }

    let mut stmt = conn
        .prepare("SELECT id, data FROM blobs ORDER BY rowid")
        .map_err(|e| ParseError::invalid("Cursor SQLite store", e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(|e| ParseError::invalid("Cursor SQLite store", e.to_string()))?;

    let mut messages = vec![];
    let mut warnings = vec![];
    let mut title = None;
    let mut seen_heads: Vec<String> = vec![];

    for row in rows {
        let (blob_id, data) = match row {
            Ok(r) => r,
            Err(e) => {
                warnings.push(RowDecodeError::new("blob row", e.to_string()));
                continue;
            }
        };

        let decoded = decode_json_blob(&data).or_else(|| decode_binary_blob(&data));
        let Some((role, content)) = decoded else {
            warnings.push(RowDecodeError::new(
                format!("blob {}", blob_id),
                "payload is neither JSON nor a known binary message",
            ));
            continue;
        };
        if content.trim().is_empty() {
            continue;
        }

        // The store duplicates streamed messages; the head of the content is
        // a stable enough identity to collapse them.
        let head: String = content.chars().take(200).collect();
        if seen_heads.contains(&head) {
            continue;
        }
        seen_heads.push(head);

        if title.is_none() && role == Role::User {
            title = Some(truncate_title(&content));
        }

        let mut msg = ParsedMessage::new(role, content);
        msg.timestamp = created_at;
        msg.extra
            .insert("blobId".into(), Value::String(blob_id.clone()));
        messages.push(msg);
    }

    Ok(vec![SessionParse {
        source: Source::Cursor,
        session_key: file_session_key(Source::Cursor, path),
        external_id: chat_id,
        title: title.or(Some(chat_name.clone())),
        project_key: format!("cursor:{}", workspace_id),
        project_name: chat_name,
        started_at: created_at,
        updated_at: created_at,
        messages,
        warnings,
    }])
}

/// Modern state.vscdb: many conversations per store, keyed by composer.
fn parse_global_storage(conn: &Connection, path: &Path) -> Result<Vec<SessionParse>, ParseError> {
    let has_kv: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='cursorDiskKV'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .map_err(|e| ParseError::invalid("Cursor globalStorage DB", e.to_string()))?;
    if !has_kv {
        return Ok(vec![]);
    }

    let mut composers: BTreeMap<String, Value> = BTreeMap::new();
    let mut bubbles: BTreeMap<String, Vec<(String, Value)>> = BTreeMap::new();
    let mut warnings_by_composer: BTreeMap<String, Vec<RowDecodeError>> = BTreeMap::new();

    let mut stmt = conn
        .prepare(
            "SELECT key, value FROM cursorDiskKV \
             WHERE key LIKE 'composerData:%' OR key LIKE 'bubbleId:%'",
        )
        .map_err(|e| ParseError::invalid("Cursor globalStorage DB", e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(|e| ParseError::invalid("Cursor globalStorage DB", e.to_string()))?;

    for row in rows.filter_map(Result::ok) {
        let (key, raw) = row;
        let value: Option<Value> = std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| serde_json::from_str(text).ok());

        if let Some(composer_id) = key.strip_prefix("composerData:") {
            match value {
                Some(v) if v.is_object() => {
                    composers.insert(composer_id.to_string(), v);
                }
                _ => {
                    warnings_by_composer
                        .entry(composer_id.to_string())
                        .or_default()
                        .push(RowDecodeError::new(key.clone(), "composer value is not JSON"));
                }
            }
        } else if let Some(rest) = key.strip_prefix("bubbleId:") {
            let Some((composer_id, bubble_id)) = rest.split_once(':') else {
                continue;
            };
            match value {
                Some(v) if v.is_object() => {
                    bubbles
                        .entry(composer_id.to_string())
                        .or_default()
                        .push((bubble_id.to_string(), v));
                }
                _ => {
                    warnings_by_composer
                        .entry(composer_id.to_string())
                        .or_default()
                        .push(RowDecodeError::new(key.clone(), "bubble value is not JSON"));
                }
            }
        }
    }

    let mut sessions = vec![];
    for (composer_id, mut composer_bubbles) in bubbles {
        let composer = composers.get(&composer_id);

        // Stable conversation order: bubble timestamp, then bubble id.
        composer_bubbles.sort_by(|a, b| {
            let ta = bubble_sort_key(&a.1);
            let tb = bubble_sort_key(&b.1);
            ta.cmp(&tb).then_with(|| a.0.cmp(&b.0))
        });

        let fallback_ts = composer
            .and_then(|c| c.get("createdAt"))
            .and_then(timestamp_from_value);

        let mut messages = vec![];
        let mut title = None;
        let mut started_at = None;
        let mut updated_at = None;

        for (bubble_id, bubble) in &composer_bubbles {
            // type 1 = user bubble, type 2 = assistant bubble
            let role = match bubble.get("type").and_then(|v| v.as_i64()) {
                Some(1) => Role::User,
                Some(2) => Role::Assistant,
                _ => continue,
            };
            let Some(text) = bubble.get("text").and_then(|v| v.as_str()) else {
                continue;
            };
            let content = strip_editor_tags(text);
            if content.is_empty() {
                continue;
            }

            let timestamp = bubble_timestamp(bubble).or(fallback_ts);
            if let Some(ts) = timestamp {
                if started_at.is_none() {
                    started_at = Some(ts);
                }
                updated_at = Some(ts);
            }
            if title.is_none() && role == Role::User {
                title = Some(truncate_title(&content));
            }

            let mut msg = ParsedMessage::new(role, content);
            msg.timestamp = timestamp;
            msg.extra
                .insert("bubbleId".into(), Value::String(bubble_id.clone()));
            messages.push(msg);
        }

        if messages.is_empty() {
            continue;
        }

        let project_key = composer
            .and_then(infer_project_path)
            .map(|p| format!("cursor:{}", p))
            .unwrap_or_else(|| "cursor".to_string());
        let project_name = project_key
            .rsplit('/')
            .next()
            .unwrap_or("cursor")
            .to_string();

        sessions.push(SessionParse {
            source: Source::Cursor,
            session_key: row_session_key(Source::Cursor, path, &composer_id),
            external_id: composer_id.clone(),
            title,
            project_key,
            project_name,
            started_at: started_at.or(fallback_ts),
            updated_at: updated_at.or(fallback_ts),
            messages,
            warnings: warnings_by_composer.remove(&composer_id).unwrap_or_default(),
        });
    }

    Ok(sessions)
}

fn bubble_timestamp(bubble: &Value) -> Option<DateTime<Utc>> {
    if let Some(ts) = bubble.get("createdAt").and_then(timestamp_from_value) {
        return Some(ts);
    }
    bubble
        .get("timingInfo")
        .and_then(|t| t.get("clientEndTime"))
        .and_then(timestamp_from_value)
}

/// Millisecond sort key; unknown timestamps sort last but stay deterministic
/// via the bubble-id tie-break.
fn bubble_sort_key(bubble: &Value) -> i64 {
    bubble_timestamp(bubble)
        .map(|ts| ts.timestamp_millis())
        .unwrap_or(i64::MAX)
}

/// Best-effort workspace root from composer metadata: the common directory
/// prefix of the file paths it references.
fn infer_project_path(composer: &Value) -> Option<String> {
    let mut paths: Vec<String> = vec![];
    if let Some(blocks) = composer.get("codeBlockData").and_then(|v| v.as_object()) {
        for entry in blocks.values() {
            if let Some(fs_path) = entry
                .get("uri")
                .and_then(|u| u.get("fsPath"))
                .and_then(|p| p.as_str())
            {
                paths.push(fs_path.to_string());
            }
        }
    }
    if paths.is_empty() {
        return None;
    }

    let mut common: Vec<&str> = paths[0].split('/').collect();
    common.pop(); // drop the file name
    for p in &paths[1..] {
        let parts: Vec<&str> = p.split('/').collect();
        let shared = common
            .iter()
            .zip(parts.iter())
            .take_while(|(a, b)| a == b)
            .count();
        common.truncate(shared);
    }
    let joined = common.join("/");
    (!joined.is_empty() && joined != "/").then_some(joined)
}

/// Remove the editor's prompt wrapper tags from user text.
fn strip_editor_tags(text: &str) -> String {
    let mut out = text.replace("<user_query>", "");
    out = out.replace("</user_query>", "");
    for tag in ["user_info", "environment_context"] {
        while let (Some(start), Some(end)) = (
            out.find(&format!("<{}>", tag)),
            out.find(&format!("</{}>", tag)),
        ) {
            if end < start {
                break;
            }
            let close = end + tag.len() + 3;
            out.replace_range(start..close.min(out.len()), "");
        }
    }
    out.trim().to_string()
}

/// JSON flavor of a legacy blob payload.
fn decode_json_blob(data: &[u8]) -> Option<(Role, String)> {
    let value: Value = serde_json::from_slice(data).ok()?;
    let role = value.get("role")?.as_str()?;
    let content = value.get("content")?;
    match role {
        "user" => message_text(content).map(|t| (Role::User, t)),
        "assistant" => message_text(content).map(|t| (Role::Assistant, t)),
        "tool" => Some((Role::Tool, message_text(content).unwrap_or_default())),
        _ => None,
    }
}

/// Text from a string or block-array content value, accepting the
/// input_text/output_text/reasoning block types this store uses.
fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Array(blocks) => {
            let mut parts = vec![];
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") | Some("input_text") | Some("output_text") => {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            if !t.is_empty() {
                                parts.push(t.to_string());
                            }
                        }
                    }
                    Some("reasoning") => {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            if !t.is_empty() {
                                parts.push(format!("[Reasoning] {}", t));
                            }
                        }
                    }
                    _ => {}
                }
            }
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

// ── Binary payload decoding ──────────────────────────────────────────────
//
// Legacy blobs that are not JSON carry a protobuf-framed message. The field
// layout is fixed and versioned by the upstream tool: field 4 holds an
// embedded JSON message ({role, content}), field 1 may hold plain user text.
// Unknown field numbers and wire types are skipped, which is what keeps the
// decoder forward-compatible with upstream schema additions.

/// Decode a binary blob into (role, text), or None when no message-bearing
/// field is present.
fn decode_binary_blob(data: &[u8]) -> Option<(Role, String)> {
    let strings = collect_payload_strings(data, 0);

    for (field_num, text) in &strings {
        if *field_num == 4 && text.starts_with('{') {
            if let Ok(embedded) = serde_json::from_str::<Value>(text) {
                let role = embedded.get("role").and_then(|r| r.as_str());
                let content = embedded.get("content");
                match (role, content) {
                    (Some("user"), Some(c)) => {
                        if let Some(t) = message_text(c) {
                            return Some((Role::User, t));
                        }
                    }
                    (Some("assistant"), Some(c)) => {
                        if let Some(t) = message_text(c) {
                            return Some((Role::Assistant, t));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // Fallback: a long printable field-1 string is a bare user message.
    for (field_num, text) in &strings {
        if *field_num == 1
            && text.len() > 20
            && !text.starts_with("file://")
            && !text.starts_with("http")
            && !text.starts_with('{')
            && text.chars().any(|c| c.is_alphabetic())
        {
            return Some((Role::User, text.clone()));
        }
    }

    None
}

/// Walk protobuf wire format and collect (field number, string) pairs,
/// recursing into length-delimited chunks that are not valid UTF-8.
fn collect_payload_strings(data: &[u8], depth: usize) -> Vec<(u64, String)> {
    // Malformed payloads could otherwise recurse on arbitrary bytes.
    if depth > 4 {
        return vec![];
    }

    let mut strings = vec![];
    let mut pos = 0usize;

    while pos < data.len() {
        let Some((tag, next)) = decode_varint(data, pos) else {
            break;
        };
        pos = next;
        let field_num = tag >> 3;
        let wire_type = tag & 0x7;

        match wire_type {
            0 => {
                // varint
                let Some((_, next)) = decode_varint(data, pos) else {
                    break;
                };
                pos = next;
            }
            1 => pos += 8,
            5 => pos += 4,
            2 => {
                // length-delimited
                let Some((len, next)) = decode_varint(data, pos) else {
                    break;
                };
                pos = next;
                let len = len as usize;
                if pos + len > data.len() {
                    break;
                }
                let chunk = &data[pos..pos + len];
                pos += len;

                match std::str::from_utf8(chunk) {
                    Ok(s) if s.len() > 5 && s.chars().all(|c| !c.is_control() || c == '\n') => {
                        strings.push((field_num, s.to_string()));
                    }
                    _ => strings.extend(collect_payload_strings(chunk, depth + 1)),
                }
            }
            _ => break,
        }
    }

    strings
}

fn decode_varint(data: &[u8], mut pos: usize) -> Option<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(pos)?;
        result |= u64::from(byte & 0x7f) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            return Some((result, pos));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

//! Claude Code parser
//!
//! Data format: JSONL files in ~/.claude/projects/<project-dir>/<session>.jsonl
//! Each line is one event:
//!   - type: 'user' | 'assistant' | 'file-history-snapshot' | ...
//!   - message.role / message.content (string or block array)
//!   - uuid, timestamp (RFC3339), sessionId, cwd
//! Sidechain logs (`agent-*.jsonl`) are skipped.

use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{ParseError, RowDecodeError};
use super::{
    extract_text, file_session_key, parse_timestamp, truncate_title, ParsedMessage, Role,
    SessionParse, Source, SourceParser,
};

pub struct ClaudeCodeParser;

impl SourceParser for ClaudeCodeParser {
    fn source(&self) -> Source {
        Source::ClaudeCode
    }

    fn discover(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = vec![];
        for root in roots {
            for entry in WalkDir::new(root)
                .max_depth(3)
                .into_iter()
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if !entry.file_type().is_file() {
                    continue;
                }
                if path.extension().map(|e| e == "jsonl").unwrap_or(false)
                    && !entry.file_name().to_string_lossy().starts_with("agent-")
                {
                    files.push(path.to_path_buf());
                }
            }
        }
        files.sort();
        files
    }

    fn parse(&self, path: &Path) -> Result<Vec<SessionParse>, ParseError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut messages = vec![];
        let mut warnings = vec![];
        let mut external_id: Option<String> = None;
        let mut project_path: Option<String> = None;
        let mut title: Option<String> = None;
        let mut started_at = None;
        let mut updated_at = None;
        let mut non_empty_lines = 0usize;
        let mut decoded_lines = 0usize;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            non_empty_lines += 1;

            let event: Value = match serde_json::from_str(trimmed) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(_) => {
                    warnings.push(RowDecodeError::new(
                        format!("line {}", idx + 1),
                        "not a JSON object",
                    ));
                    continue;
                }
                Err(e) => {
                    warnings.push(RowDecodeError::new(
                        format!("line {}", idx + 1),
                        e.to_string(),
                    ));
                    continue;
                }
            };
            decoded_lines += 1;

            if external_id.is_none() {
                external_id = event
                    .get("sessionId")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            if project_path.is_none() {
                project_path = event.get("cwd").and_then(|v| v.as_str()).map(String::from);
            }

            let timestamp = event
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp);
            if let Some(ts) = timestamp {
                if started_at.is_none() {
                    started_at = Some(ts);
                }
                updated_at = Some(ts);
            }

            // Snapshots, queue operations, and summaries carry no turns.
            let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if !matches!(event_type, "user" | "assistant" | "system") {
                continue;
            }

            let Some(message) = event.get("message").filter(|m| m.is_object()) else {
                continue;
            };
            let Some(role) = message
                .get("role")
                .and_then(|v| v.as_str())
                .and_then(Role::normalize)
            else {
                continue;
            };
            // Events whose content is pure tool traffic carry no text.
            let Some(content) = message.get("content").and_then(extract_text) else {
                continue;
            };

            if title.is_none() && role == Role::User {
                title = Some(truncate_title(&content));
            }

            let mut msg = ParsedMessage::new(role, content);
            msg.timestamp = timestamp;
            if let Some(uuid) = event.get("uuid").and_then(|v| v.as_str()) {
                msg.extra.insert("uuid".into(), Value::String(uuid.into()));
            }
            if let Some(model) = message.get("model").and_then(|v| v.as_str()) {
                msg.extra
                    .insert("model".into(), Value::String(model.into()));
            }
            messages.push(msg);
        }

        if non_empty_lines > 0 && decoded_lines == 0 {
            return Err(ParseError::invalid(
                "Claude Code JSONL",
                "no line decodes as JSON",
            ));
        }

        // Project path from cwd; directory-name fallback matches how Claude
        // Code encodes the workspace path into the directory name.
        let project_key = project_path.unwrap_or_else(|| {
            let dir_name = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("/{}", dir_name.trim_start_matches('-').replace('-', "/"))
        });
        let project_name = project_name_from_path(&project_key);

        let external_id = external_id.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        Ok(vec![SessionParse {
            source: Source::ClaudeCode,
            session_key: file_session_key(Source::ClaudeCode, path),
            external_id,
            title,
            project_key,
            project_name,
            started_at,
            updated_at,
            messages,
            warnings,
        }])
    }
}

pub(crate) fn project_name_from_path(path: &str) -> String {
    path.rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or(path)
        .to_string()
}

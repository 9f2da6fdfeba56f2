//! Gemini CLI parser
//!
//! Data format: one JSON document per session at
//! ~/.gemini/tmp/<project_hash>/chats/session-*.json:
//!   {projectHash, sessionId, startTime, lastUpdated,
//!    messages: [{id, timestamp, type: "user"|"gemini", content}]}

use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{
    file_session_key, parse_timestamp, truncate_title, ParsedMessage, Role, SessionParse, Source,
    SourceParser,
};
use crate::error::{ParseError, RowDecodeError};

pub struct GeminiCliParser;

#[derive(Debug, Deserialize)]
struct GeminiSession {
    #[serde(rename = "projectHash")]
    project_hash: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "startTime")]
    start_time: Option<String>,
    #[serde(rename = "lastUpdated")]
    last_updated: Option<String>,
    #[serde(default)]
    messages: Vec<Value>,
}

impl SourceParser for GeminiCliParser {
    fn source(&self) -> Source {
        Source::GeminiCli
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
                if name.starts_with("session-") && name.ends_with(".json") {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        files.sort();
        files
    }

    fn parse(&self, path: &Path) -> Result<Vec<SessionParse>, ParseError> {
        let raw = fs::read_to_string(path)?;
        let session: GeminiSession = serde_json::from_str(&raw)
            .map_err(|e| ParseError::invalid("Gemini CLI session", e.to_string()))?;

        let project_hash = session.project_hash.clone().unwrap_or_else(|| {
            path.parent()
                .and_then(|p| p.parent())
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let external_id = session.session_id.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        let started_at = session.start_time.as_deref().and_then(parse_timestamp);
        let mut updated_at = session.last_updated.as_deref().and_then(parse_timestamp);

        let mut messages = vec![];
        let mut warnings = vec![];
        let mut title = None;

        for (idx, raw_msg) in session.messages.iter().enumerate() {
            let Some(obj) = raw_msg.as_object() else {
                warnings.push(RowDecodeError::new(
                    format!("message {}", idx),
                    "not a JSON object",
                ));
                continue;
            };

            let Some(role) = obj
                .get("type")
                .and_then(|v| v.as_str())
                .and_then(Role::normalize)
            else {
                // Tool events and future message types are not turns.
                continue;
            };
            let Some(content) = obj
                .get("content")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|c| !c.is_empty())
            else {
                continue;
            };

            let timestamp = obj
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp)
                .or(started_at);
            if updated_at.is_none() {
                updated_at = timestamp;
            }
            if title.is_none() && role == Role::User {
                title = Some(truncate_title(content));
            }

            let mut msg = ParsedMessage::new(role, content);
            msg.timestamp = timestamp;
            if let Some(id) = obj.get("id").and_then(|v| v.as_str()) {
                msg.extra.insert("id".into(), Value::String(id.into()));
            }
            messages.push(msg);
        }

        Ok(vec![SessionParse {
            source: Source::GeminiCli,
            session_key: file_session_key(Source::GeminiCli, path),
            external_id,
            title,
            project_key: format!("gemini_cli:{}", project_hash),
            project_name: project_hash,
            started_at,
            updated_at: updated_at.or(started_at),
            messages,
            warnings,
        }])
    }
}

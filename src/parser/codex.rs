//! Codex parser
//!
//! Data format: rollout JSONL at ~/.codex/sessions/YYYY/MM/DD/rollout-*.jsonl
//! Each line is {timestamp, type, payload}:
//!   - session_meta: {id, cwd, originator, cli_version, ...}
//!   - event_msg: payload.type user_message | agent_message | agent_reasoning
//!     | token_count
//!   - response_item: payload {role, content: [{type: output_text|input_text,
//!     text}]}
//! Older rollouts carry only response_item lines, newer ones only event_msg
//! lines, and resumed sessions mix both; both flavors normalize to the same
//! turns and a duplicated adjacent turn is collapsed.

use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{
    file_session_key, parse_timestamp, truncate_title, ParsedMessage, Role, SessionParse, Source,
    SourceParser,
};
use crate::error::{ParseError, RowDecodeError};

pub struct CodexParser;

impl SourceParser for CodexParser {
    fn source(&self) -> Source {
        Source::Codex
    }

    fn discover(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = vec![];
        for root in roots {
            for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with("rollout-") && name.ends_with(".jsonl") {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        files.sort();
        files
    }

    fn parse(&self, path: &Path) -> Result<Vec<SessionParse>, ParseError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut messages: Vec<ParsedMessage> = vec![];
        let mut warnings = vec![];
        let mut external_id: Option<String> = None;
        let mut project_path: Option<String> = None;
        let mut title = None;
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

            let item: Value = match serde_json::from_str::<Value>(trimmed) {
                Ok(v) if v.is_object() => v,
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

            let timestamp = item
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp);
            if let Some(ts) = timestamp {
                if started_at.is_none() {
                    started_at = Some(ts);
                }
                updated_at = Some(ts);
            }

            let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
            let payload = item.get("payload").cloned().unwrap_or(Value::Null);

            let turn = match item_type {
                "session_meta" => {
                    if external_id.is_none() {
                        external_id = payload
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                    }
                    if project_path.is_none() {
                        project_path = payload
                            .get("cwd")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                    }
                    None
                }
                "event_msg" => event_msg_turn(&payload),
                "response_item" => response_item_turn(&payload),
                // turn_context, compacted, and future item types carry no turns
                _ => None,
            };

            let Some((role, content)) = turn else {
                continue;
            };

            // A resumed session replays the same turn through both flavors.
            if messages
                .last()
                .map(|prev| prev.role == role && prev.content == content)
                .unwrap_or(false)
            {
                continue;
            }

            if title.is_none() && role == Role::User {
                title = Some(truncate_title(&content));
            }

            let mut msg = ParsedMessage::new(role, content);
            msg.timestamp = timestamp;
            msg.extra
                .insert("item".into(), Value::String(item_type.into()));
            messages.push(msg);
        }

        if non_empty_lines > 0 && decoded_lines == 0 {
            return Err(ParseError::invalid(
                "Codex rollout",
                "no line decodes as JSON",
            ));
        }

        let external_id = external_id.unwrap_or_else(|| {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            stem.strip_prefix("rollout-").unwrap_or(&stem).to_string()
        });

        let project_key = project_path.unwrap_or_else(|| "codex".to_string());
        let project_name = super::claude_code::project_name_from_path(&project_key);

        Ok(vec![SessionParse {
            source: Source::Codex,
            session_key: file_session_key(Source::Codex, path),
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

fn event_msg_turn(payload: &Value) -> Option<(Role, String)> {
    match payload.get("type").and_then(|v| v.as_str())? {
        "user_message" => {
            let text = payload.get("message")?.as_str()?.trim();
            (!text.is_empty()).then(|| (Role::User, text.to_string()))
        }
        "agent_message" => {
            let text = payload.get("message")?.as_str()?.trim();
            (!text.is_empty()).then(|| (Role::Assistant, text.to_string()))
        }
        // agent_reasoning, token_count, exec_* and friends are not turns
        _ => None,
    }
}

fn response_item_turn(payload: &Value) -> Option<(Role, String)> {
    let role = payload
        .get("role")
        .and_then(|v| v.as_str())
        .and_then(Role::normalize)?;

    let content = payload.get("content")?.as_array()?;
    let mut parts = vec![];
    for block in content {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("output_text") | Some("input_text") | Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        parts.push(text);
                    }
                }
            }
            _ => {}
        }
    }
    let joined = parts.join("\n");
    let joined = joined.trim();
    (!joined.is_empty()).then(|| (role, joined.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn meta_line(id: &str, cwd: &str) -> String {
        serde_json::json!({
            "timestamp": "2024-06-01T08:00:00Z",
            "type": "session_meta",
            "payload": {"id": id, "cwd": cwd, "cli_version": "0.9.1"},
        })
        .to_string()
    }

    fn event_line(ev_type: &str, message: &str, ts: &str) -> String {
        serde_json::json!({
            "timestamp": ts,
            "type": "event_msg",
            "payload": {"type": ev_type, "message": message},
        })
        .to_string()
    }

    fn response_line(role: &str, text: &str, ts: &str) -> String {
        serde_json::json!({
            "timestamp": ts,
            "type": "response_item",
            "payload": {
                "type": "message",
                "role": role,
                "content": [{"type": "output_text", "text": text}],
            },
        })
        .to_string()
    }

    fn write_rollout(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn event_msg_flavor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rollout(
            dir.path(),
            "rollout-2024-06-01T08-00-00-abc.jsonl",
            &[
                meta_line("sess-42", "/work/api"),
                event_line("user_message", "profile the slow endpoint", "2024-06-01T08:00:01Z"),
                serde_json::json!({
                    "timestamp": "2024-06-01T08:00:02Z",
                    "type": "event_msg",
                    "payload": {"type": "agent_reasoning", "text": "thinking..."},
                })
                .to_string(),
                event_line("agent_message", "The N+1 query in list_users is the culprit.", "2024-06-01T08:00:09Z"),
            ],
        );

        let parse = &CodexParser.parse(&path).unwrap()[0];
        assert_eq!(parse.external_id, "sess-42");
        assert_eq!(parse.project_key, "/work/api");
        assert_eq!(parse.messages.len(), 2);
        assert_eq!(parse.messages[0].role, Role::User);
        assert_eq!(parse.messages[1].role, Role::Assistant);
        assert_eq!(parse.title.as_deref(), Some("profile the slow endpoint"));
    }

    #[test]
    fn response_item_flavor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rollout(
            dir.path(),
            "rollout-x.jsonl",
            &[
                meta_line("sess-43", "/work/cli"),
                response_line("user", "what does the retry flag do", "2024-06-02T10:00:00Z"),
                response_line("assistant", "It re-runs failed requests up to N times.", "2024-06-02T10:00:03Z"),
            ],
        );

        let parse = &CodexParser.parse(&path).unwrap()[0];
        assert_eq!(parse.messages.len(), 2);
        assert_eq!(parse.messages[0].role, Role::User);
        assert_eq!(parse.messages[1].content, "It re-runs failed requests up to N times.");
    }

    #[test]
    fn mixed_flavors_deduplicate_adjacent_turns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rollout(
            dir.path(),
            "rollout-y.jsonl",
            &[
                meta_line("sess-44", "/work/x"),
                event_line("user_message", "show the diff again please", "2024-06-03T10:00:00Z"),
                // Same turn replayed as a response_item on resume.
                serde_json::json!({
                    "timestamp": "2024-06-03T10:00:00Z",
                    "type": "response_item",
                    "payload": {
                        "type": "message",
                        "role": "user",
                        "content": [{"type": "input_text", "text": "show the diff again please"}],
                    },
                })
                .to_string(),
                event_line("agent_message", "Here it is.", "2024-06-03T10:00:04Z"),
            ],
        );

        let parse = &CodexParser.parse(&path).unwrap()[0];
        assert_eq!(parse.messages.len(), 2);
    }

    #[test]
    fn unknown_item_types_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rollout(
            dir.path(),
            "rollout-z.jsonl",
            &[
                meta_line("sess-45", "/work/x"),
                serde_json::json!({
                    "timestamp": "2024-06-04T10:00:00Z",
                    "type": "shiny_new_item",
                    "payload": {"whatever": true},
                })
                .to_string(),
                event_line("user_message", "carry on regardless", "2024-06-04T10:00:01Z"),
            ],
        );

        let parse = &CodexParser.parse(&path).unwrap()[0];
        assert_eq!(parse.messages.len(), 1);
        assert!(parse.warnings.is_empty());
    }

    #[test]
    fn discover_matches_rollout_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2024").join("06").join("01");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("rollout-a.jsonl"), "").unwrap();
        std::fs::write(nested.join("history.jsonl"), "").unwrap();

        let found = CodexParser.discover(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("rollout-a.jsonl"));
    }
}

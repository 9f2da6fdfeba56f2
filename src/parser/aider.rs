//! Aider parser
//!
//! Data format: markdown chat history at <project>/.aider.chat.history.md
//! `# aider chat started at <timestamp>` opens a chat; `> ` quoted lines are
//! user turns, unquoted blocks between them are assistant output. One
//! history file accumulates every chat run in that project and maps to one
//! session; messages carry no timestamps of their own and inherit the
//! nearest chat header.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{
    file_session_key, parse_timestamp, truncate_title, ParsedMessage, Role, SessionParse, Source,
    SourceParser,
};
use crate::error::ParseError;

const HISTORY_FILE: &str = ".aider.chat.history.md";
const SESSION_HEADER: &str = "# aider chat started at ";

pub struct AiderParser;

impl SourceParser for AiderParser {
    fn source(&self) -> Source {
        Source::Aider
    }

    fn discover(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = vec![];
        for root in roots {
            for entry in WalkDir::new(root)
                .max_depth(4)
                .into_iter()
                .filter_map(Result::ok)
            {
                if entry.file_type().is_file() && entry.file_name() == HISTORY_FILE {
                    files.push(entry.path().to_path_buf());
                }
            }
        }
        files.sort();
        files
    }

    fn parse(&self, path: &Path) -> Result<Vec<SessionParse>, ParseError> {
        let content = fs::read_to_string(path)?;
        let project_key = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let project_name = super::claude_code::project_name_from_path(&project_key);

        if !content.trim().is_empty() && !content.contains(SESSION_HEADER) {
            return Err(ParseError::invalid(
                "Aider history",
                "no chat session header found",
            ));
        }

        let mut messages = vec![];
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut updated_at: Option<DateTime<Utc>> = None;
        let mut current_ts: Option<DateTime<Utc>> = None;
        let mut seen_header = false;
        let mut user_lines: Vec<String> = vec![];
        let mut assistant_lines: Vec<String> = vec![];

        fn flush(
            role: Role,
            lines: &mut Vec<String>,
            timestamp: Option<DateTime<Utc>>,
            messages: &mut Vec<ParsedMessage>,
        ) {
            let text = lines.join("\n").trim().to_string();
            lines.clear();
            if text.is_empty() {
                return;
            }
            // Banner output before the first user turn is tool noise.
            if role == Role::Assistant && messages.is_empty() {
                return;
            }
            let mut msg = ParsedMessage::new(role, text);
            msg.timestamp = timestamp;
            messages.push(msg);
        }

        for line in content.lines() {
            if let Some(header_ts) = line.strip_prefix(SESSION_HEADER) {
                flush(Role::User, &mut user_lines, current_ts, &mut messages);
                flush(
                    Role::Assistant,
                    &mut assistant_lines,
                    current_ts,
                    &mut messages,
                );
                current_ts = parse_timestamp(header_ts.trim());
                seen_header = true;
                if let Some(ts) = current_ts {
                    if started_at.is_none() {
                        started_at = Some(ts);
                    }
                    updated_at = Some(ts);
                }
                continue;
            }
            // Preamble before the first header is not conversation.
            if !seen_header {
                continue;
            }

            if let Some(rest) = line.strip_prefix("> ") {
                flush(
                    Role::Assistant,
                    &mut assistant_lines,
                    current_ts,
                    &mut messages,
                );
                user_lines.push(rest.to_string());
            } else if line.trim() == ">" {
                if !user_lines.is_empty() {
                    user_lines.push(String::new());
                }
            } else {
                flush(Role::User, &mut user_lines, current_ts, &mut messages);
                assistant_lines.push(line.to_string());
            }
        }
        flush(Role::User, &mut user_lines, current_ts, &mut messages);
        flush(
            Role::Assistant,
            &mut assistant_lines,
            current_ts,
            &mut messages,
        );

        let title = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| truncate_title(&m.content));

        Ok(vec![SessionParse {
            source: Source::Aider,
            session_key: file_session_key(Source::Aider, path),
            external_id: project_name.clone(),
            title,
            project_key,
            project_name,
            started_at,
            updated_at,
            messages,
            warnings: vec![],
        }])
    }
}

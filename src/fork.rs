//! Fork engine: materialize a source-native continuation artifact.
//!
//! Forking reads a stored transcript and writes a brand-new log file in the
//! originating source's own format, so the originating tool can open and
//! continue the conversation. The artifact is written to a temporary path
//! and renamed into place; the source tool never sees a partial file. The
//! forked-from relation is registered before the next sync absorbs the new
//! file, so the link exists no matter which run imports it.
//!
//! Claude Code and Codex have well-defined continuation files. Cursor's
//! store is owned by a live editor process, Aider's history is append-only
//! output of a running session, and Gemini CLI has no resume contract, so
//! those sources refuse to fork.

use chrono::Utc;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::error::ForkError;
use crate::parser::{file_session_key, Source};
use crate::store::{ForkRegistration, PromptRecord, SessionSummary, Store};

#[derive(Debug, Clone)]
pub struct ForkResult {
    /// Session key the forked artifact will import under.
    pub session_key: String,
    pub source: Source,
    pub path: PathBuf,
}

pub struct ForkEngine<'a> {
    store: &'a mut Store,
}

impl<'a> ForkEngine<'a> {
    pub fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    pub fn fork(&mut self, session_key: &str) -> Result<ForkResult, ForkError> {
        let session = self
            .store
            .get_session(session_key)?
            .ok_or_else(|| ForkError::SessionNotFound(session_key.to_string()))?;
        let transcript = self.store.transcript(&session.session_key)?;

        let (path, lines) = match session.source {
            Source::ClaudeCode => claude_code_artifact(&session, &transcript),
            Source::Codex => codex_artifact(&session, &transcript),
            other => return Err(ForkError::UnsupportedSource(other)),
        };

        write_atomically(&path, &lines)?;

        let child_key = file_session_key(session.source, &path);
        let title = session
            .title
            .as_deref()
            .map(|t| format!("Fork: {}", t))
            .or_else(|| Some(format!("Fork of {}", session.session_key)));
        self.store.register_fork(&ForkRegistration {
            session_key: child_key.clone(),
            source: session.source,
            project_key: session.project_key.clone(),
            project_name: session
                .project_name
                .clone()
                .unwrap_or_else(|| session.project_key.clone()),
            title,
            origin_path: path.to_string_lossy().to_string(),
            parent_key: session.session_key.clone(),
        })?;

        info!(
            parent = %session.session_key,
            child = %child_key,
            path = %path.display(),
            "forked session"
        );

        Ok(ForkResult {
            session_key: child_key,
            source: session.source,
            path,
        })
    }
}

/// Claude Code continuation: a fresh <uuid>.jsonl beside the parent's file,
/// seeded with the transcript in Claude Code's own event shape.
fn claude_code_artifact(
    session: &SessionSummary,
    transcript: &[PromptRecord],
) -> (PathBuf, Vec<String>) {
    let dir = parent_dir(&session.origin_path);
    let new_id = Uuid::new_v4().to_string();
    let path = dir.join(format!("{}.jsonl", new_id));
    let fallback_ts = Utc::now().to_rfc3339();

    let mut lines = vec![];
    for record in transcript {
        let timestamp = record.timestamp.clone().unwrap_or_else(|| fallback_ts.clone());
        let event = match record.role.as_str() {
            "user" => json!({
                "type": "user",
                "uuid": Uuid::new_v4().to_string(),
                "sessionId": new_id,
                "cwd": session.project_key,
                "timestamp": timestamp,
                "message": {"role": "user", "content": record.content},
            }),
            "assistant" => json!({
                "type": "assistant",
                "uuid": Uuid::new_v4().to_string(),
                "sessionId": new_id,
                "timestamp": timestamp,
                "message": {
                    "role": "assistant",
                    "content": [{"type": "text", "text": record.content}],
                },
            }),
            // System notes travel too; tool records are native to the run
            // that produced them and do not seed a continuation.
            "system" => json!({
                "type": "system",
                "uuid": Uuid::new_v4().to_string(),
                "sessionId": new_id,
                "timestamp": timestamp,
                "message": {"role": "system", "content": record.content},
            }),
            _ => continue,
        };
        lines.push(event.to_string());
    }

    (path, lines)
}

/// Codex continuation: a fresh rollout file under the parent's sessions
/// tree, seeded as session_meta + event_msg lines.
fn codex_artifact(
    session: &SessionSummary,
    transcript: &[PromptRecord],
) -> (PathBuf, Vec<String>) {
    let dir = parent_dir(&session.origin_path);
    let new_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let stamp = now.format("%Y-%m-%dT%H-%M-%S");
    let path = dir.join(format!("rollout-{}-{}.jsonl", stamp, new_id));
    let now_rfc = now.to_rfc3339();

    let mut lines = vec![json!({
        "timestamp": now_rfc,
        "type": "session_meta",
        "payload": {
            "id": new_id,
            "cwd": session.project_key,
            "timestamp": now_rfc,
            "originator": "memoir_fork",
        },
    })
    .to_string()];

    for record in transcript {
        let timestamp = record.timestamp.clone().unwrap_or_else(|| now_rfc.clone());
        let payload = match record.role.as_str() {
            "user" => json!({"type": "user_message", "message": record.content}),
            "assistant" => json!({"type": "agent_message", "message": record.content}),
            _ => continue,
        };
        lines.push(
            json!({
                "timestamp": timestamp,
                "type": "event_msg",
                "payload": payload,
            })
            .to_string(),
        );
    }

    (path, lines)
}

fn parent_dir(origin_path: &str) -> PathBuf {
    Path::new(origin_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Temp-write-then-rename so the artifact appears atomically or not at all.
fn write_atomically(path: &Path, lines: &[String]) -> Result<(), ForkError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("jsonl.tmp");

    let result = (|| -> std::io::Result<()> {
        fs::write(&tmp, lines.join("\n") + "\n")?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(ForkError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{
        ClaudeCodeParser, CodexParser, ParsedMessage, Role, SessionParse, SourceParser,
    };
    use chrono::TimeZone;

    fn seed_session(
        store: &mut Store,
        source: Source,
        origin_path: &Path,
        turns: &[(&str, &str)],
    ) -> String {
        let ts = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let key = file_session_key(source, origin_path);
        let parse = SessionParse {
            source,
            session_key: key.clone(),
            external_id: "parent-ext".to_string(),
            title: Some("parent session".to_string()),
            project_key: "/home/dev/widget".to_string(),
            project_name: "widget".to_string(),
            started_at: Some(ts),
            updated_at: Some(ts),
            messages: turns
                .iter()
                .map(|(role, content)| {
                    let mut m =
                        ParsedMessage::new(Role::from_str(role).unwrap(), content.to_string());
                    m.timestamp = Some(ts);
                    m
                })
                .collect(),
            warnings: vec![],
        };
        store
            .apply_file(
                &origin_path.to_string_lossy(),
                source,
                64,
                1,
                None,
                &[parse],
            )
            .unwrap();
        key
    }

    #[test]
    fn fork_claude_session_writes_native_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("proj");
        std::fs::create_dir(&logs).unwrap();
        let origin = logs.join("parent.jsonl");

        let mut store = Store::open(&dir.path().join("db.sqlite")).unwrap();
        let parent_key = seed_session(
            &mut store,
            Source::ClaudeCode,
            &origin,
            &[
                ("user", "set up the release pipeline"),
                ("assistant", "Pipeline configured with three stages."),
            ],
        );

        let result = ForkEngine::new(&mut store).fork(&parent_key).unwrap();
        assert_eq!(result.source, Source::ClaudeCode);
        assert!(result.path.exists());
        assert_ne!(result.session_key, parent_key);
        // No temp leftovers.
        assert!(!result.path.with_extension("jsonl.tmp").exists());

        // The artifact is valid Claude Code input.
        let reparsed = &ClaudeCodeParser.parse(&result.path).unwrap()[0];
        assert_eq!(reparsed.messages.len(), 2);
        assert_eq!(reparsed.messages[0].role, Role::User);
        assert_eq!(reparsed.messages[0].content, "set up the release pipeline");
        assert_eq!(
            reparsed.messages[1].content,
            "Pipeline configured with three stages."
        );

        // Link registered ahead of any sync.
        let child = store.get_session(&result.session_key).unwrap().unwrap();
        assert_eq!(child.forked_from.as_deref(), Some(parent_key.as_str()));
    }

    #[test]
    fn fork_codex_session_writes_rollout() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("sessions");
        std::fs::create_dir(&logs).unwrap();
        let origin = logs.join("rollout-2024-03-01T09-00-00-orig.jsonl");

        let mut store = Store::open(&dir.path().join("db.sqlite")).unwrap();
        let parent_key = seed_session(
            &mut store,
            Source::Codex,
            &origin,
            &[
                ("user", "trace the flaky integration test"),
                ("assistant", "The fixture port collides across workers."),
            ],
        );

        let result = ForkEngine::new(&mut store).fork(&parent_key).unwrap();
        let name = result.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("rollout-"));

        let reparsed = &CodexParser.parse(&result.path).unwrap()[0];
        assert_eq!(reparsed.messages.len(), 2);
        assert_eq!(reparsed.project_key, "/home/dev/widget");
        assert_eq!(reparsed.messages[1].role, Role::Assistant);
    }

    #[test]
    fn unsupported_sources_refuse() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join(".aider.chat.history.md");
        let mut store = Store::open(&dir.path().join("db.sqlite")).unwrap();
        let key = seed_session(
            &mut store,
            Source::Aider,
            &origin,
            &[("user", "not forkable")],
        );

        assert!(matches!(
            ForkEngine::new(&mut store).fork(&key),
            Err(ForkError::UnsupportedSource(Source::Aider))
        ));
    }

    #[test]
    fn missing_session_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("db.sqlite")).unwrap();
        assert!(matches!(
            ForkEngine::new(&mut store).fork("nope"),
            Err(ForkError::SessionNotFound(_))
        ));
    }

    #[test]
    fn fork_linkage_survives_the_next_sync() {
        use crate::config::Config;
        use crate::parser::ParserRegistry;
        use crate::sync::{CancelToken, SyncEngine, SyncMode};

        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("projects").join("widget");
        std::fs::create_dir_all(&logs).unwrap();
        let origin = logs.join("parent.jsonl");
        std::fs::write(
            &origin,
            format!(
                "{}\n{}\n",
                serde_json::json!({
                    "type": "user", "sessionId": "p", "cwd": "/home/dev/widget",
                    "timestamp": "2024-03-01T09:00:00Z",
                    "message": {"role": "user", "content": "original request text"},
                }),
                serde_json::json!({
                    "type": "assistant", "timestamp": "2024-03-01T09:00:05Z",
                    "message": {"role": "assistant",
                                "content": [{"type": "text", "text": "original answer text"}]},
                }),
            ),
        )
        .unwrap();

        let yaml = format!(
            r#"
database:
  path: {}
sources:
  claude_code: {{ roots: ["{}"] }}
  cursor: {{ enabled: false }}
  aider: {{ enabled: false }}
  codex: {{ enabled: false }}
  gemini_cli: {{ enabled: false }}
"#,
            dir.path().join("db.sqlite").display(),
            dir.path().join("projects").display(),
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let registry = ParserRegistry::new(&config);
        let mut store = Store::open(&config.database_path()).unwrap();

        SyncEngine::new(&mut store, &config, &registry)
            .run(SyncMode::Incremental, None, &CancelToken::new())
            .unwrap();
        let parent_key = file_session_key(Source::ClaudeCode, &origin);
        assert!(store.get_session(&parent_key).unwrap().is_some());

        let fork = ForkEngine::new(&mut store).fork(&parent_key).unwrap();

        // The next sync absorbs the new artifact like any other log file.
        let report = SyncEngine::new(&mut store, &config, &registry)
            .run(SyncMode::Incremental, None, &CancelToken::new())
            .unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 1);

        let child = store.get_session(&fork.session_key).unwrap().unwrap();
        assert_eq!(child.forked_from.as_deref(), Some(parent_key.as_str()));
        assert_eq!(child.message_count, 2);
        let transcript = store.transcript(&fork.session_key).unwrap();
        assert_eq!(transcript[0].content, "original request text");
    }
}

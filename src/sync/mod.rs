//! Sync engine: discover, classify, parse, reconcile.
//!
//! Each run walks the configured roots per source, asks the tracker which
//! files changed, parses new/modified files in parallel (parsing is pure
//! over independent inputs), and reconciles results into the store one
//! file-scoped transaction at a time. A file-level failure marks its
//! FileState and moves on; the run never aborts for one bad file.

pub mod tracker;

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ParseError, StorageError};
use crate::parser::{ParserRegistry, SessionParse, Source};
use crate::store::Store;
use tracker::{classify, confirm_unchanged, fingerprint_file, stat_file, FileClass, FileMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Parse only files classified as new or modified. Default.
    Incremental,
    /// Discard all derived data first and reprocess every discoverable file.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// The whole file was unreadable; prior data kept, retried next run.
    File,
    /// One record inside an otherwise-imported file was skipped.
    Record,
}

#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub path: PathBuf,
    pub scope: FailureScope,
    pub reason: String,
}

/// Structured outcome of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: usize,
    pub cancelled: bool,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn files_processed(&self) -> usize {
        self.imported + self.updated + self.skipped
    }
}

/// Cooperative cancellation, checked between files. A cancelled run leaves
/// the store exactly at the last fully-reconciled file.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct ParseJob {
    source: Source,
    meta: FileMeta,
    class: FileClass,
}

struct ParseOutcome {
    source: Source,
    meta: FileMeta,
    class: FileClass,
    fingerprint: Option<String>,
    result: Result<Vec<SessionParse>, ParseError>,
}

pub struct SyncEngine<'a> {
    store: &'a mut Store,
    config: &'a Config,
    registry: &'a ParserRegistry,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a mut Store, config: &'a Config, registry: &'a ParserRegistry) -> Self {
        Self {
            store,
            config,
            registry,
        }
    }

    /// Run one sync pass. `scope` restricts the run to one source.
    pub fn run(
        &mut self,
        mode: SyncMode,
        scope: Option<Source>,
        cancel: &CancelToken,
    ) -> Result<SyncReport, StorageError> {
        let mut report = SyncReport::default();

        let snapshot = if mode == SyncMode::Full {
            let snapshot = self.store.snapshot_user_state()?;
            self.store.clear_derived(scope)?;
            snapshot
        } else {
            vec![]
        };

        let mut jobs: Vec<ParseJob> = vec![];
        let registry = self.registry;

        for parser in registry.all() {
            let source = parser.source();
            if scope.map(|s| s != source).unwrap_or(false) {
                continue;
            }

            let roots: Vec<PathBuf> = self
                .config
                .roots_for(source)
                .into_iter()
                .filter(|r| r.exists())
                .collect();
            if roots.is_empty() {
                // Missing roots skip this source for the run; others proceed.
                debug!(source = source.name(), "no existing roots, skipping source");
                continue;
            }

            let candidates = parser.discover(&roots);
            debug!(
                source = source.name(),
                candidates = candidates.len(),
                "discovered"
            );

            self.detect_deletions(source, &candidates, &mut report)?;

            for path in candidates {
                let meta = match stat_file(&path) {
                    Ok(meta) => meta,
                    Err(e) => {
                        // Transient stat failure: prior state kept, retried
                        // on the next run, never treated as deleted.
                        report.failed += 1;
                        report.failures.push(SyncFailure {
                            path,
                            scope: FailureScope::File,
                            reason: format!("stat failed: {}", e),
                        });
                        continue;
                    }
                };

                let known = self.store.file_state(&meta.path.to_string_lossy())?;
                let mut class = classify(&meta, known.as_ref());

                if class == FileClass::Unchanged
                    && mode == SyncMode::Incremental
                    && self.config.sync.verify_fingerprint
                {
                    match confirm_unchanged(&meta, known.as_ref().expect("known state")) {
                        Ok(true) => {}
                        Ok(false) => class = FileClass::Modified,
                        Err(e) => {
                            report.failed += 1;
                            report.failures.push(SyncFailure {
                                path: meta.path.clone(),
                                scope: FailureScope::File,
                                reason: format!("fingerprint failed: {}", e),
                            });
                            continue;
                        }
                    }
                }

                if class == FileClass::Unchanged {
                    report.skipped += 1;
                    self.store
                        .mark_file_unchanged(&meta.path.to_string_lossy())?;
                    continue;
                }

                jobs.push(ParseJob {
                    source,
                    meta,
                    class,
                });
            }
        }

        // Parse phase: pure and side-effect-free over independent files, so
        // it fans out across the worker pool.
        let mut outcomes: Vec<ParseOutcome> = jobs
            .into_par_iter()
            .map(|job| {
                let parser = registry.get(job.source).expect("registered parser");
                let fingerprint = fingerprint_file(&job.meta.path).ok();
                let result = parser.parse(&job.meta.path);
                ParseOutcome {
                    source: job.source,
                    meta: job.meta,
                    class: job.class,
                    fingerprint,
                    result,
                }
            })
            .collect();
        outcomes.sort_by(|a, b| a.meta.path.cmp(&b.meta.path));

        // Reconcile phase: serialized, one transaction per file, with a
        // cancellation checkpoint between files.
        for outcome in outcomes {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.reconcile(outcome, &mut report)?;
        }

        if mode == SyncMode::Full {
            self.store.restore_user_state(&snapshot)?;
        }

        info!(
            imported = report.imported,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            deleted = report.deleted,
            "sync complete"
        );
        Ok(report)
    }

    fn reconcile(
        &mut self,
        outcome: ParseOutcome,
        report: &mut SyncReport,
    ) -> Result<(), StorageError> {
        let path_str = outcome.meta.path.to_string_lossy().to_string();
        match outcome.result {
            Ok(sessions) => {
                self.store.apply_file(
                    &path_str,
                    outcome.source,
                    outcome.meta.size,
                    outcome.meta.mtime_ms,
                    outcome.fingerprint.as_deref(),
                    &sessions,
                )?;
                match outcome.class {
                    FileClass::New => report.imported += 1,
                    _ => report.updated += 1,
                }
                for session in &sessions {
                    for warning in &session.warnings {
                        warn!(path = %path_str, %warning, "record skipped");
                        report.failed += 1;
                        report.failures.push(SyncFailure {
                            path: outcome.meta.path.clone(),
                            scope: FailureScope::Record,
                            reason: warning.to_string(),
                        });
                    }
                }
            }
            Err(e) => {
                warn!(path = %path_str, error = %e, "file failed to parse");
                self.store.mark_file_failed(
                    &path_str,
                    outcome.source,
                    outcome.meta.size,
                    outcome.meta.mtime_ms,
                    &e.to_string(),
                )?;
                report.failed += 1;
                report.failures.push(SyncFailure {
                    path: outcome.meta.path,
                    scope: FailureScope::File,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Tracked files that vanished from disk. Imported sessions are retained
    /// as soft-orphans unless configured otherwise; the file-state row goes
    /// either way so a reappearing file imports as new.
    fn detect_deletions(
        &mut self,
        source: Source,
        _candidates: &[PathBuf],
        report: &mut SyncReport,
    ) -> Result<(), StorageError> {
        let tracked = self.store.file_states_for_source(source)?;
        for state in tracked {
            match std::fs::symlink_metadata(Path::new(&state.path)) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let drop_sessions = !self.config.sync.retain_orphans;
                    debug!(
                        path = %state.path,
                        drop_sessions,
                        "tracked file no longer on disk"
                    );
                    self.store.remove_file(&state.path, drop_sessions)?;
                    report.deleted += 1;
                }
                // Permission or transient I/O errors are not deletions; the
                // file keeps its prior state and is retried next run.
                Err(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionFilter;
    use std::io::Write;

    fn test_config(dir: &Path, claude_root: &Path) -> Config {
        let yaml = format!(
            r#"
database:
  path: {}
sources:
  claude_code:
    roots: ["{}"]
  cursor: {{ enabled: false }}
  aider: {{ enabled: false }}
  codex: {{ enabled: false }}
  gemini_cli: {{ enabled: false }}
"#,
            dir.join("memoir.db").display(),
            claude_root.display()
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn write_claude_log(dir: &Path, name: &str, turns: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for (i, (role, text)) in turns.iter().enumerate() {
            let event = serde_json::json!({
                "type": role,
                "uuid": format!("u-{}", i),
                "sessionId": name.trim_end_matches(".jsonl"),
                "cwd": "/home/dev/widget",
                "timestamp": format!("2024-03-01T10:{:02}:00Z", i),
                "message": {"role": role, "content": *text},
            });
            writeln!(f, "{}", event).unwrap();
        }
        path
    }

    fn run_sync(config: &Config, mode: SyncMode) -> (SyncReport, Store) {
        let mut store = Store::open(&config.database_path()).unwrap();
        let registry = ParserRegistry::new(config);
        let report = {
            let mut engine = SyncEngine::new(&mut store, config, &registry);
            engine
                .run(mode, None, &CancelToken::new())
                .unwrap()
        };
        (report, store)
    }

    #[test]
    fn incremental_sync_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        write_claude_log(
            &logs,
            "a.jsonl",
            &[
                ("user", "please fix the flaky websocket test"),
                ("assistant", "The teardown was racing the server; fixed."),
            ],
        );
        let config = test_config(dir.path(), &logs);

        let (first, store) = run_sync(&config, SyncMode::Incremental);
        assert_eq!(first.imported, 1);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.failed, 0);
        let session = &store.list_sessions(&SessionFilter::default()).unwrap()[0];
        let transcript_before = store.transcript(&session.session_key).unwrap();
        let updated_before = session.updated_at.clone();
        drop(store);

        let (second, store) = run_sync(&config, SyncMode::Incremental);
        assert_eq!(second.imported, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.failed, 0);

        let session = &store.list_sessions(&SessionFilter::default()).unwrap()[0];
        assert_eq!(session.updated_at, updated_before);
        let transcript_after = store.transcript(&session.session_key).unwrap();
        assert_eq!(transcript_before.len(), transcript_after.len());
        for (a, b) in transcript_before.iter().zip(&transcript_after) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.ordinal, b.ordinal);
        }
    }

    #[test]
    fn malformed_line_counts_as_failure_but_file_imports() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        write_claude_log(
            &logs,
            "a.jsonl",
            &[
                ("user", "show me the migration plan"),
                ("assistant", "Three steps: schema, backfill, cutover."),
            ],
        );
        // b.jsonl: one valid turn then a malformed line
        let b = logs.join("b.jsonl");
        let mut f = std::fs::File::create(&b).unwrap();
        writeln!(
            f,
            "{}",
            serde_json::json!({
                "type": "user",
                "sessionId": "b",
                "cwd": "/home/dev/widget",
                "timestamp": "2024-03-01T11:00:00Z",
                "message": {"role": "user", "content": "only this turn survives"},
            })
        )
        .unwrap();
        writeln!(f, "{{truncated garbage").unwrap();
        drop(f);

        let config = test_config(dir.path(), &logs);
        let (report, store) = run_sync(&config, SyncMode::Incremental);

        assert_eq!(report.imported, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].scope, FailureScope::Record);

        let sessions = store.list_sessions(&SessionFilter::default()).unwrap();
        assert_eq!(sessions.len(), 2);
        let b_session = sessions
            .iter()
            .find(|s| s.origin_path.ends_with("b.jsonl"))
            .unwrap();
        let transcript = store.transcript(&b_session.session_key).unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].content, "only this turn survives");
    }

    #[test]
    fn corrupt_file_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        write_claude_log(&logs, "good1.jsonl", &[("user", "valid conversation one")]);
        write_claude_log(&logs, "good2.jsonl", &[("user", "valid conversation two")]);
        std::fs::write(logs.join("corrupt.jsonl"), "utterly\nnot\njson\n").unwrap();

        let config = test_config(dir.path(), &logs);
        let (report, store) = run_sync(&config, SyncMode::Incremental);

        assert_eq!(report.imported, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].scope, FailureScope::File);
        assert!(report.failures[0].path.ends_with("corrupt.jsonl"));
        assert_eq!(store.list_sessions(&SessionFilter::default()).unwrap().len(), 2);

        // The failed file keeps a failed state and is retried next run.
        let state = store
            .file_state(&logs.join("corrupt.jsonl").to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(state.outcome, crate::store::FileOutcome::Failed);
        drop(store);

        let (second, _) = run_sync(&config, SyncMode::Incremental);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.failed, 1);
    }

    #[test]
    fn modified_file_is_reprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        write_claude_log(&logs, "a.jsonl", &[("user", "the first question asked")]);
        let config = test_config(dir.path(), &logs);

        let (first, store) = run_sync(&config, SyncMode::Incremental);
        assert_eq!(first.imported, 1);
        drop(store);

        // Append a turn; the size change reclassifies the file.
        write_claude_log(
            &logs,
            "a.jsonl",
            &[
                ("user", "the first question asked"),
                ("assistant", "and now an answer exists"),
            ],
        );

        let (second, store) = run_sync(&config, SyncMode::Incremental);
        assert_eq!(second.updated, 1);
        assert_eq!(second.imported, 0);

        let session = &store.list_sessions(&SessionFilter::default()).unwrap()[0];
        assert_eq!(session.message_count, 2);
        let ordinals: Vec<i64> = store
            .transcript(&session.session_key)
            .unwrap()
            .iter()
            .map(|r| r.ordinal)
            .collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn deleted_file_soft_orphans_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        let path = write_claude_log(&logs, "a.jsonl", &[("user", "soon to be rotated away")]);
        let config = test_config(dir.path(), &logs);

        let (_, store) = run_sync(&config, SyncMode::Incremental);
        drop(store);
        std::fs::remove_file(&path).unwrap();

        let (report, store) = run_sync(&config, SyncMode::Incremental);
        assert_eq!(report.deleted, 1);
        // Session retained, tracker row gone.
        assert_eq!(store.list_sessions(&SessionFilter::default()).unwrap().len(), 1);
        assert!(store
            .file_state(&path.to_string_lossy())
            .unwrap()
            .is_none());
    }

    #[test]
    fn deleted_file_drops_sessions_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        let path = write_claude_log(&logs, "a.jsonl", &[("user", "do not keep me around")]);
        let mut config = test_config(dir.path(), &logs);
        config.sync.retain_orphans = false;

        let (_, store) = run_sync(&config, SyncMode::Incremental);
        drop(store);
        std::fs::remove_file(&path).unwrap();

        let (report, store) = run_sync(&config, SyncMode::Incremental);
        assert_eq!(report.deleted, 1);
        assert!(store.list_sessions(&SessionFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn full_rebuild_reproduces_content_and_keeps_stars() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        write_claude_log(
            &logs,
            "a.jsonl",
            &[
                ("user", "walk me through the cache layer"),
                ("assistant", "It is a two-tier LRU with a write-behind queue."),
            ],
        );
        let config = test_config(dir.path(), &logs);

        let (_, mut store) = run_sync(&config, SyncMode::Incremental);
        let session = store.list_sessions(&SessionFilter::default()).unwrap()[0].clone();
        store.set_starred(&session.session_key, true).unwrap();
        let before = store.transcript(&session.session_key).unwrap();
        drop(store);

        let (report, store) = run_sync(&config, SyncMode::Full);
        assert_eq!(report.imported, 1);

        let rebuilt = store.get_session(&session.session_key).unwrap().unwrap();
        assert!(rebuilt.starred);
        let after = store.transcript(&session.session_key).unwrap();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.role, b.role);
            assert_eq!(a.ordinal, b.ordinal);
        }
    }

    #[test]
    fn cancelled_run_stops_between_files() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        write_claude_log(&logs, "a.jsonl", &[("user", "first file in the run")]);
        write_claude_log(&logs, "b.jsonl", &[("user", "second file in the run")]);
        let config = test_config(dir.path(), &logs);

        let mut store = Store::open(&config.database_path()).unwrap();
        let registry = ParserRegistry::new(&config);
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = SyncEngine::new(&mut store, &config, &registry)
            .run(SyncMode::Incremental, None, &cancel)
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.imported, 0);
        // Resumable: the next run picks both files up as new.
        let report = SyncEngine::new(&mut store, &config, &registry)
            .run(SyncMode::Incremental, None, &CancelToken::new())
            .unwrap();
        assert_eq!(report.imported, 2);
    }
}

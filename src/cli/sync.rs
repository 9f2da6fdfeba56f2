//! Sync command implementation

use anyhow::Result;

use crate::config::Config;
use crate::parser::{ParserRegistry, Source};
use crate::store::Store;
use crate::sync::{CancelToken, FailureScope, SyncEngine, SyncMode};

pub fn run(
    store: &mut Store,
    config: &Config,
    registry: &ParserRegistry,
    full: bool,
    source: Option<Source>,
    show_failures: bool,
) -> Result<()> {
    let mode = if full {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    };

    if full {
        println!("Rebuilding index from scratch...");
    }

    let cancel = CancelToken::new();
    let report = SyncEngine::new(store, config, registry).run(mode, source, &cancel)?;

    println!(
        "imported: {}  updated: {}  skipped: {}  failed: {}",
        report.imported, report.updated, report.skipped, report.failed
    );
    if report.deleted > 0 {
        println!("files no longer on disk: {}", report.deleted);
    }
    if report.cancelled {
        println!("run was cancelled; remaining files resume on the next sync");
    }

    if show_failures && !report.failures.is_empty() {
        println!("\nFailures:");
        for failure in &report.failures {
            let scope = match failure.scope {
                FailureScope::File => "file",
                FailureScope::Record => "record",
            };
            println!("  [{}] {}: {}", scope, failure.path.display(), failure.reason);
        }
    } else if report.failed > 0 {
        println!("run with --failures to list failing files");
    }

    Ok(())
}

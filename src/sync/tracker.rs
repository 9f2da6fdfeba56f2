//! File state tracking: cheap change classification for discovered files.
//!
//! mtime+size is the first pass; the sha256 content fingerprint confirms a
//! suspected change only when the caller asks for certainty (full rebuilds
//! always fingerprint, incremental runs trust mtime+size unless configured
//! otherwise).

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::store::{FileOutcome, FileStateRow};

/// Identity of a file as observed on disk right now.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ms: i64,
}

/// Classification of a discovered file against its tracked state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileClass {
    New,
    Unchanged,
    Modified,
}

pub fn stat_file(path: &Path) -> io::Result<FileMeta> {
    let metadata = std::fs::metadata(path)?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0);
    Ok(FileMeta {
        path: path.to_path_buf(),
        size: metadata.len(),
        mtime_ms,
    })
}

/// mtime+size classification. A file whose last outcome was `Failed` is
/// always reprocessed, whatever its stat says.
pub fn classify(meta: &FileMeta, known: Option<&FileStateRow>) -> FileClass {
    match known {
        None => FileClass::New,
        Some(state) if state.outcome == FileOutcome::Failed => FileClass::Modified,
        Some(state) => {
            if state.size == meta.size && state.mtime_ms == meta.mtime_ms {
                FileClass::Unchanged
            } else {
                FileClass::Modified
            }
        }
    }
}

/// Strong content fingerprint (streaming sha256).
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Confirm an `Unchanged` classification against the stored fingerprint.
/// Returns false when the content actually differs (stat told a lie, e.g. a
/// same-size in-place edit with a restored mtime).
pub fn confirm_unchanged(meta: &FileMeta, known: &FileStateRow) -> io::Result<bool> {
    let Some(expected) = known.fingerprint.as_deref() else {
        // Nothing recorded to compare against; treat as changed so the file
        // gets a fingerprint baseline.
        return Ok(false);
    };
    let actual = fingerprint_file(&meta.path)?;
    Ok(actual == expected)
}

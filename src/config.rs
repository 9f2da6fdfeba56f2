//! Configuration management with YAML support

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::parser::Source;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Per-source settings, keyed by the source's stable name
    /// (`claude_code`, `cursor`, `aider`, `codex`, `gemini_cli`).
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,

    #[serde(default)]
    pub sync: SyncConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Individual source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Root directories to walk for this source. When empty, the source's
    /// conventional default location is used.
    #[serde(default)]
    pub roots: Vec<String>,
}

/// Sync engine policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Confirm mtime+size classification with a content fingerprint even in
    /// incremental mode. Full rebuilds always fingerprint.
    #[serde(default)]
    pub verify_fingerprint: bool,

    /// Keep sessions whose originating file disappeared from disk
    /// (rotated or moved logs). When false, such sessions are dropped
    /// during the incremental run that notices the deletion.
    #[serde(default = "default_enabled")]
    pub retain_orphans: bool,
}

fn default_database_path() -> String {
    "~/.local/share/memoir/memoir.db".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            roots: vec![],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            verify_fingerprint: false,
            retain_orphans: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            sources: HashMap::new(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./memoir.yaml (current directory)
    /// 3. ~/.config/memoir/memoir.yaml
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "memoir.yaml".to_string(),
            shellexpand::tilde("~/.config/memoir/memoir.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path).map_err(|e| {
                    ConfigError::Unreadable {
                        path: search_path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let config: Config =
                    serde_yaml::from_str(&content).map_err(|e| ConfigError::Unreadable {
                        path: search_path.clone(),
                        reason: e.to_string(),
                    })?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.database.path).to_string();
        PathBuf::from(expanded)
    }

    /// Check if a source is enabled
    pub fn is_source_enabled(&self, source: Source) -> bool {
        self.sources
            .get(source.name())
            .map_or(true, |s| s.enabled)
    }

    /// Root directories to walk for a source. Falls back to the source's
    /// conventional default locations when none are configured.
    pub fn roots_for(&self, source: Source) -> Vec<PathBuf> {
        let configured = self
            .sources
            .get(source.name())
            .map(|s| s.roots.as_slice())
            .unwrap_or(&[]);

        if !configured.is_empty() {
            return configured
                .iter()
                .map(|r| PathBuf::from(shellexpand::tilde(r).to_string()))
                .collect();
        }

        source.default_roots()
    }
}

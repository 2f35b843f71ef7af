//! Session log sources
//!
//! A [`SessionSource`] knows where one provider keeps its session logs and
//! how to enumerate them. Discovery only stats files; it never reads them.
//!
//! | Source | Root | Pattern |
//! |--------|------|---------|
//! | `codex` | `~/.codex` | `sessions/*/*/*/rollout-*.jsonl` |
//! | `claude-code` | `~/.claude` | `projects/*/*.jsonl` (sub-agent `agent-*.jsonl` excluded) |

use crate::config::SourcesConfig;
use crate::error::Result;
use crate::types::FileIdentity;
use std::path::{Path, PathBuf};

/// A file surfaced by a source, with its identity at discovery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Name of the source that surfaced the file
    pub provider: String,
    pub path: PathBuf,
    pub identity: FileIdentity,
}

/// A provider of session log files.
pub trait SessionSource: Send + Sync {
    /// Short provider name (e.g. `codex`)
    fn name(&self) -> &str;

    /// Root directory for this source, if it can be determined.
    fn root_path(&self) -> Option<PathBuf>;

    /// Check if this source is installed (root path exists)
    fn is_installed(&self) -> bool {
        self.root_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Glob patterns relative to [`Self::root_path`].
    fn source_patterns(&self) -> Vec<String>;

    /// Whether a matched path should be skipped.
    fn excludes(&self, _path: &Path) -> bool {
        false
    }

    /// Discover all files matching this source's patterns, sorted by path.
    ///
    /// Files that disappear between globbing and stat are skipped.
    fn discover_files(&self) -> Result<Vec<DiscoveredFile>> {
        let root = match self.root_path() {
            Some(r) => r,
            None => return Ok(vec![]),
        };

        let mut files = Vec::new();
        for pattern in self.source_patterns() {
            let full_pattern = root.join(&pattern);
            let pattern_str = full_pattern.to_string_lossy();

            for entry in glob::glob(&pattern_str)?.flatten() {
                if self.excludes(&entry) {
                    continue;
                }
                let Ok(metadata) = std::fs::metadata(&entry) else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                files.push(DiscoveredFile {
                    provider: self.name().to_string(),
                    identity: FileIdentity::from_metadata(&metadata),
                    path: entry,
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);
        Ok(files)
    }
}

/// Glob-driven source rooted at a directory.
#[derive(Debug, Clone)]
pub struct GlobSource {
    name: String,
    root: Option<PathBuf>,
    patterns: Vec<String>,
    excluded_prefix: Option<String>,
}

impl GlobSource {
    pub fn new(name: impl Into<String>, root: PathBuf, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            root: Some(root),
            patterns,
            excluded_prefix: None,
        }
    }

    /// Codex CLI rollouts under `root` (normally `~/.codex`).
    pub fn codex(root: Option<PathBuf>) -> Self {
        Self {
            name: "codex".to_string(),
            root: root.or_else(|| dirs::home_dir().map(|h| h.join(".codex"))),
            patterns: vec!["sessions/*/*/*/rollout-*.jsonl".to_string()],
            excluded_prefix: None,
        }
    }

    /// Claude Code project sessions under `root` (normally `~/.claude`).
    pub fn claude_code(root: Option<PathBuf>) -> Self {
        Self {
            name: "claude-code".to_string(),
            root: root.or_else(|| dirs::home_dir().map(|h| h.join(".claude"))),
            patterns: vec!["projects/*/*.jsonl".to_string()],
            excluded_prefix: Some("agent-".to_string()),
        }
    }
}

impl SessionSource for GlobSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_path(&self) -> Option<PathBuf> {
        self.root.clone()
    }

    fn source_patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    fn excludes(&self, path: &Path) -> bool {
        match (&self.excluded_prefix, path.file_stem().and_then(|s| s.to_str())) {
            (Some(prefix), Some(stem)) => stem.starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

/// The built-in sources, honoring path overrides from config.
pub fn default_sources(config: &SourcesConfig) -> Vec<Box<dyn SessionSource>> {
    vec![
        Box::new(GlobSource::claude_code(config.claude_code_path.clone())),
        Box::new(GlobSource::codex(config.codex_path.clone())),
    ]
}

//! Repository scanner: enumerates the committed working set through the
//! external `git` binary and scores files by commit frecency.
//!
//! The scanner never reads the working tree. File discovery is
//! `git ls-tree -r HEAD`, blob contents come from `git cat-file`, and the
//! history walk is a single `git log --name-only` bounded by
//! `read_max_commits`. The repo state hash is a digest over the sorted
//! `(path, blob id)` pairs at HEAD, which the engine uses to short-circuit
//! maintenance when nothing was committed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::process::Command;

use crate::error::{Result, RetrieverError};
use crate::sources::with_retry;

/// Decay rate for frecency: a 90-day-old commit is worth half of one made
/// today.
const FRECENCY_HALF_LIFE_DAYS: f64 = 90.0;

/// Marker prefixing commit lines in the history walk so timestamps can
/// never be confused with file names.
const COMMIT_MARKER: &str = "###";

/// Extensions the index will accept. The check is applied to the path
/// string only; content is never sniffed.
const INDEXABLE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "jsx", "tsx", "go", "java", "c", "cpp", "h", "hpp", "rb", "php",
    "cs", "swift", "kt", "scala", "sh", "sql", "md", "markdown", "txt", "toml", "yaml", "yml",
    "json", "html", "css",
];

/// A file tracked at HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Repository-relative path.
    pub path: String,
    /// Git object id of the committed content.
    pub blob_id: String,
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Maximum number of commits walked for frecency.
    pub read_max_commits: usize,
    /// Glob patterns excluded from indexing.
    pub ignore_patterns: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            read_max_commits: 10_000,
            ignore_patterns: Vec::new(),
        }
    }
}

/// Read-only view of one Git repository at HEAD.
pub struct Repository {
    path: PathBuf,
    config: RepositoryConfig,
    ignore: GlobSet,
}

impl Repository {
    pub fn open(path: &Path, config: RepositoryConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                RetrieverError::internal(format!("bad ignore pattern {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .map_err(|e| RetrieverError::internal(format!("ignore patterns: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            ignore,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .output()
            .await
            .map_err(|e| RetrieverError::backend(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RetrieverError::backend(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn git_text(&self, args: &[&str]) -> Result<String> {
        let bytes = self.git(args).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// All indexable files tracked at HEAD, sorted by path.
    pub async fn head_files(&self) -> Result<Vec<FileEntry>> {
        let args = ["ls-tree", "-r", "HEAD"];
        let listing = with_retry("git ls-tree", || self.git_text(&args)).await?;
        let mut files: Vec<FileEntry> = listing
            .lines()
            .filter_map(parse_ls_tree_line)
            .filter(|entry| self.is_indexable(&entry.path))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Raw bytes of a committed blob.
    pub async fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        let args = ["cat-file", "-p", blob_id];
        with_retry("git cat-file", || self.git(&args)).await
    }

    /// Digest over the sorted `(path, blob id)` pairs at HEAD. Two scans of
    /// the same commit always produce the same hash.
    pub async fn state_hash(&self) -> Result<String> {
        let files = self.head_files().await?;
        Ok(state_hash_of(&files))
    }

    /// Frecency scores for the given tracked files, normalized so the
    /// highest-scoring file is exactly 1.0. Files without history score 0
    /// and are omitted from the map.
    pub async fn frecency_scores(&self, tracked: &[FileEntry]) -> Result<HashMap<String, f32>> {
        let max_count = format!("--max-count={}", self.config.read_max_commits);
        let pretty = format!("--pretty=format:{COMMIT_MARKER}%ct");
        let args = ["log", "--no-merges", "--name-only", &max_count, &pretty];
        let log = with_retry("git log", || self.git_text(&args)).await?;

        let tracked_paths: std::collections::HashSet<&str> =
            tracked.iter().map(|f| f.path.as_str()).collect();
        let now = chrono::Utc::now().timestamp();

        let mut raw: HashMap<String, f64> = HashMap::new();
        let mut current_age_days = 0.0f64;
        for line in log.lines() {
            let line = line.trim_end();
            if let Some(ts) = line.strip_prefix(COMMIT_MARKER) {
                let ts: i64 = ts.trim().parse().unwrap_or(now);
                current_age_days = ((now - ts).max(0)) as f64 / 86_400.0;
            } else if !line.is_empty() && tracked_paths.contains(line) {
                *raw.entry(line.to_string()).or_default() += decay(current_age_days);
            }
        }

        Ok(normalize(raw))
    }

    fn is_indexable(&self, path: &str) -> bool {
        if self.ignore.is_match(path) {
            return false;
        }
        is_indexable_path(path)
    }
}

/// Whether a path belongs to the allowed-extension set.
pub fn is_indexable_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.starts_with('.') {
        return false;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) => INDEXABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => matches!(name, "README" | "CHANGELOG" | "LICENSE" | "Makefile" | "Dockerfile"),
    }
}

/// Compute the state hash for a scanned file list.
pub fn state_hash_of(files: &[FileEntry]) -> String {
    let mut sorted: Vec<&FileEntry> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let mut hasher = blake3::Hasher::new();
    for entry in sorted {
        hasher.update(entry.blob_id.as_bytes());
        hasher.update(b" ");
        hasher.update(entry.path.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

fn parse_ls_tree_line(line: &str) -> Option<FileEntry> {
    // `<mode> <type> <oid>\t<path>`
    let (meta, path) = line.split_once('\t')?;
    let mut parts = meta.split_whitespace();
    let _mode = parts.next()?;
    let kind = parts.next()?;
    let oid = parts.next()?;
    if kind != "blob" {
        return None;
    }
    Some(FileEntry {
        path: path.to_string(),
        blob_id: oid.to_string(),
    })
}

fn decay(age_days: f64) -> f64 {
    (-(std::f64::consts::LN_2 / FRECENCY_HALF_LIFE_DAYS) * age_days).exp()
}

fn normalize(raw: HashMap<String, f64>) -> HashMap<String, f32> {
    let max = raw.values().cloned().fold(0.0f64, f64::max);
    if max <= 0.0 {
        return HashMap::new();
    }
    raw.into_iter()
        .map(|(path, score)| (path, (score / max) as f32))
        .collect()
}

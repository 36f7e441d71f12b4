//! The engine: orchestrates scanner → chunker → sources → cache.
//!
//! All mutation runs on exactly one worker (see `task_queue`); the engine
//! itself is free of locking beyond what the sources need internally. An
//! analyze pass is split into resumable batches with explicit yield points
//! so the dispatcher can interleave queries between them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use globset::GlobSet;
use kelp_context::ChunkerConfig;

use crate::cache::{AnalysisCache, AnalysisSnapshot};
use crate::embedding::{provider_for_name, HASHED_PROVIDER};
use crate::error::{Result, RetrieverError};
use crate::merge::{merge_hits, MergeConfig, SearchResult};
use crate::repository::{state_hash_of, FileEntry, Repository, RepositoryConfig};
use crate::sources::vector::DEFAULT_BATCH_SIZE;
use crate::sources::{Hit, LineCorpus, RegexSource, SearchSource, VectorSource};

/// Files processed per analyze batch before yielding back to the queue.
const FILES_PER_BATCH: usize = 4;

/// Per-source hit limit for a query.
pub const DEFAULT_SOURCE_LIMIT: usize = 500;

/// Cooperative cancellation flag checked at the engine's yield points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RetrieverError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the Git repository being indexed.
    pub repo_path: PathBuf,
    /// Cache root override; `None` uses the platform cache directory.
    pub cache_root: Option<PathBuf>,
    pub repository: RepositoryConfig,
    pub chunker: ChunkerConfig,
    /// Named embedding function (see `embedding::provider_for_name`).
    pub embedding_function: String,
    /// Maximum chunks per vector upsert batch.
    pub embedding_batch_size: usize,
    pub merge: MergeConfig,
    /// Per-source hit limit for queries.
    pub source_limit: usize,
}

impl EngineConfig {
    pub fn new(repo_path: PathBuf) -> Self {
        Self {
            repo_path,
            cache_root: None,
            repository: RepositoryConfig::default(),
            chunker: ChunkerConfig::default(),
            embedding_function: HASHED_PROVIDER.to_string(),
            embedding_batch_size: DEFAULT_BATCH_SIZE,
            merge: MergeConfig::default(),
            source_limit: DEFAULT_SOURCE_LIMIT,
        }
    }

    pub fn with_cache_root(mut self, cache_root: PathBuf) -> Self {
        self.cache_root = Some(cache_root);
        self
    }

    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.repository.ignore_patterns = patterns;
        self
    }

    pub fn with_read_max_commits(mut self, max: usize) -> Self {
        self.repository.read_max_commits = max;
        self
    }

    pub fn with_embedding_function(mut self, name: &str) -> Self {
        self.embedding_function = name.to_string();
        self
    }

    pub fn with_embedding_batch_size(mut self, size: usize) -> Self {
        self.embedding_batch_size = size;
        self
    }
}

/// Per-query knobs carried by the request.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Total line budget; `None` uses the merge default.
    pub limit_lines: Option<usize>,
    pub context_above: Option<u32>,
    pub context_below: Option<u32>,
    /// Cap on the number of blocks returned.
    pub max_results: Option<usize>,
    pub include: Option<GlobSet>,
    pub exclude: Option<GlobSet>,
}

/// What `get_stats` reports.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub chunks_analyzed: usize,
    pub total_files: usize,
    pub last_analyzed_at: Option<i64>,
}

/// Summary of one analyze pass.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzeSummary {
    /// False when the repo state hash matched and nothing was done.
    pub changed: bool,
    pub files_processed: usize,
}

enum FileTask {
    /// Blob changed (or is new): re-chunk and re-embed.
    Reindex(FileEntry),
    /// Blob unchanged but the in-memory corpus needs its lines.
    Hydrate(FileEntry),
}

/// A resumable analyze pass. Produced by [`Engine::begin_analysis`],
/// driven by [`Engine::run_analysis_batch`], sealed by
/// [`Engine::finish_analysis`].
pub struct AnalysisPass {
    state_hash: String,
    pending: VecDeque<FileTask>,
    files_processed: usize,
}

impl AnalysisPass {
    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn remaining_files(&self) -> usize {
        self.pending.len()
    }
}

/// The query engine and index maintainer for one repository.
pub struct Engine {
    config: EngineConfig,
    repository: Repository,
    cache: AnalysisCache,
    snapshot: AnalysisSnapshot,
    vector: VectorSource,
    regex: RegexSource,
    corpus: Arc<LineCorpus>,
    /// Whether the regex corpus reflects the current HEAD. Always false on
    /// a fresh process until the first pass hydrates it.
    hydrated: bool,
}

impl Engine {
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let repository = Repository::open(&config.repo_path, config.repository.clone())?;
        let cache = match &config.cache_root {
            Some(root) => AnalysisCache::open(root, &config.repo_path)?,
            None => AnalysisCache::open_default(&config.repo_path)?,
        };
        let snapshot = cache.load_or_discard();

        let provider = provider_for_name(&config.embedding_function)?;
        let vector = VectorSource::open(
            &cache.vector_db_path(),
            provider,
            config.embedding_batch_size,
        )
        .await?;

        let corpus = Arc::new(LineCorpus::new());
        let regex = RegexSource::new(Arc::clone(&corpus));

        tracing::info!(
            "engine ready for {} (cache {})",
            config.repo_path.display(),
            cache.dir().display()
        );

        Ok(Self {
            config,
            repository,
            cache,
            snapshot,
            vector,
            regex,
            corpus,
            hydrated: false,
        })
    }

    /// Begin an analyze pass. Returns `None` when the repo state hash
    /// matches the cache and the corpus is already hydrated: the
    /// maintenance no-op path.
    pub async fn begin_analysis(&mut self, cancel: &CancelToken) -> Result<Option<AnalysisPass>> {
        cancel.check()?;
        let files = self.repository.head_files().await?;
        let state_hash = state_hash_of(&files);

        let current_blobs: HashMap<String, String> = files
            .iter()
            .map(|f| (f.path.clone(), f.blob_id.clone()))
            .collect();
        self.vector.set_current_blobs(current_blobs.clone());

        if self.hydrated && self.snapshot.repo_state_hash.as_deref() == Some(&state_hash) {
            tracing::debug!("repo state unchanged, skipping analysis");
            return Ok(None);
        }

        // Frecency is recomputed per pass; the history walk is one git log.
        self.snapshot.frecency = self.repository.frecency_scores(&files).await?;

        // Purge paths that vanished from HEAD. The analyzed set keeps their
        // ids: it records what was ever embedded under this cache version.
        let stored = self.vector.paths_and_blobs().await?;
        for path in stored.keys() {
            if !current_blobs.contains_key(path) {
                tracing::debug!("purging {path}: no longer tracked");
                self.vector.purge_path(path).await?;
                self.regex.purge_path(path);
            }
        }

        let mut pending = VecDeque::new();
        for entry in files {
            match stored.get(&entry.path) {
                Some(blob) if *blob == entry.blob_id => {
                    if !self.hydrated {
                        pending.push_back(FileTask::Hydrate(entry));
                    }
                }
                _ => pending.push_back(FileTask::Reindex(entry)),
            }
        }

        tracing::info!("analysis pass: {} files pending", pending.len());
        Ok(Some(AnalysisPass {
            state_hash,
            pending,
            files_processed: 0,
        }))
    }

    /// Process up to one batch of files from the pass, yielding afterwards.
    pub async fn run_analysis_batch(
        &mut self,
        pass: &mut AnalysisPass,
        cancel: &CancelToken,
    ) -> Result<()> {
        for _ in 0..FILES_PER_BATCH {
            cancel.check()?;
            let Some(task) = pass.pending.pop_front() else {
                return Ok(());
            };
            let entry = match &task {
                FileTask::Reindex(entry) | FileTask::Hydrate(entry) => entry.clone(),
            };
            let outcome = match task {
                FileTask::Reindex(entry) => self.reindex_file(&entry, cancel).await,
                FileTask::Hydrate(entry) => self.hydrate_file(&entry).await,
            };
            match outcome {
                Ok(()) => pass.files_processed += 1,
                // One bad file never aborts a pass.
                Err(RetrieverError::Cancelled) => return Err(RetrieverError::Cancelled),
                Err(err) => {
                    tracing::warn!("skipping {}: {err}", entry.path);
                }
            }
        }
        Ok(())
    }

    /// Seal a completed pass: record the state hash and persist the cache.
    pub async fn finish_analysis(&mut self, pass: AnalysisPass) -> Result<AnalyzeSummary> {
        debug_assert!(pass.is_done());
        self.snapshot.repo_state_hash = Some(pass.state_hash);
        self.snapshot.last_analyzed_at = Some(chrono::Utc::now().timestamp());
        self.cache.store(&self.snapshot)?;
        self.hydrated = true;
        tracing::info!(
            "analysis pass complete: {} files, {} chunks analyzed",
            pass.files_processed,
            self.snapshot.analyzed.len()
        );
        Ok(AnalyzeSummary {
            changed: true,
            files_processed: pass.files_processed,
        })
    }

    /// Run a full analyze pass to completion.
    pub async fn analyze(&mut self, cancel: &CancelToken) -> Result<AnalyzeSummary> {
        match self.begin_analysis(cancel).await? {
            None => Ok(AnalyzeSummary {
                changed: false,
                files_processed: 0,
            }),
            Some(mut pass) => {
                while !pass.is_done() {
                    self.run_analysis_batch(&mut pass, cancel).await?;
                }
                self.finish_analysis(pass).await
            }
        }
    }

    async fn reindex_file(&mut self, entry: &FileEntry, cancel: &CancelToken) -> Result<()> {
        let bytes = self.repository.read_blob(&entry.blob_id).await?;

        // The old blob's chunks go first, unconditionally: an unreadable
        // new blob must still leave no stale rows behind.
        self.vector.purge_path(&entry.path).await?;
        self.regex.purge_path(&entry.path);

        let chunks = self
            .config
            .chunker
            .split_blob(&entry.path, &entry.blob_id, &bytes)?;

        let mut first = true;
        for batch in chunks.chunks(self.config.embedding_batch_size) {
            // Yield point between batches. A half-indexed file would pass
            // the next diff as current, so cancellation rolls the path
            // back out of both sources.
            if !first && cancel.is_cancelled() {
                self.vector.purge_path(&entry.path).await?;
                self.regex.purge_path(&entry.path);
                return Err(RetrieverError::Cancelled);
            }
            first = false;
            self.vector.upsert(batch).await?;
            self.regex.upsert(batch).await?;
            for chunk in batch {
                self.snapshot.analyzed.insert(chunk.id.clone());
            }
        }
        tracing::debug!("indexed {} ({} chunks)", entry.path, chunks.len());
        Ok(())
    }

    async fn hydrate_file(&mut self, entry: &FileEntry) -> Result<()> {
        let bytes = self.repository.read_blob(&entry.blob_id).await?;
        if bytes.contains(&0) {
            return Err(RetrieverError::UnreadableBlob {
                path: entry.path.clone(),
            });
        }
        let text = String::from_utf8_lossy(&bytes);
        let mut lines: Vec<String> = text.split('\n').map(String::from).collect();
        if text.ends_with('\n') {
            lines.pop();
        }
        self.corpus.set_file(&entry.path, lines);
        Ok(())
    }

    /// Fan a query out to both sources concurrently and merge the results.
    ///
    /// One failing source degrades the response to `partial` instead of
    /// failing the query; only both sources failing is an error.
    pub async fn query(&self, text: &str, opts: &QueryOptions) -> Result<SearchResult> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(RetrieverError::EmptyQuery);
        }

        let limit = self.config.source_limit;
        let (vector_out, regex_out) = tokio::join!(
            self.vector.query(trimmed, limit),
            self.regex.query(trimmed, limit)
        );

        let mut partial = false;
        let mut regex_error = None;
        let mut hits: Vec<Hit> = Vec::new();
        match (vector_out, regex_out) {
            (Ok(v), Ok(r)) => {
                hits.extend(v);
                hits.extend(r);
            }
            (Ok(v), Err(err)) => {
                tracing::warn!("regex source degraded: {err}");
                partial = true;
                regex_error = Some(err.code().to_string());
                hits.extend(v);
            }
            (Err(err), Ok(r)) => {
                tracing::warn!("vector source degraded: {err}");
                partial = true;
                hits.extend(r);
            }
            (Err(vector_err), Err(_)) => return Err(vector_err),
        }

        if let Some(include) = &opts.include {
            hits.retain(|h| include.is_match(&h.path));
        }
        if let Some(exclude) = &opts.exclude {
            hits.retain(|h| !exclude.is_match(&h.path));
        }

        let mut merge_config = self.config.merge.clone();
        if let Some(limit_lines) = opts.limit_lines {
            merge_config.limit_lines = limit_lines;
        }
        if let Some(above) = opts.context_above {
            merge_config.context_above = above;
        }
        if let Some(below) = opts.context_below {
            merge_config.context_below = below;
        }

        let mut result = merge_hits(&hits, &self.snapshot.frecency, &self.corpus, &merge_config);
        result.partial = partial;
        result.regex_error = regex_error;

        if let Some(max_results) = opts.max_results {
            let mut remaining = max_results;
            result.files.retain_mut(|file| {
                file.blocks.truncate(remaining);
                remaining -= file.blocks.len();
                !file.blocks.is_empty()
            });
        }
        Ok(result)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            chunks_analyzed: self.snapshot.analyzed.len(),
            total_files: self.corpus.file_count(),
            last_analyzed_at: self.snapshot.last_analyzed_at,
        }
    }

    /// Whether HEAD has moved since the last completed pass.
    pub async fn is_stale(&self) -> Result<bool> {
        let current = self.repository.state_hash().await?;
        Ok(self.snapshot.repo_state_hash.as_deref() != Some(&current) || !self.hydrated)
    }

    pub fn corpus(&self) -> &Arc<LineCorpus> {
        &self.corpus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

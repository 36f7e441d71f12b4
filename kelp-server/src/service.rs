//! Transport-independent query facade.
//!
//! `SearchService` is what a transport (HTTP here, anything else
//! elsewhere) talks to: it translates requests into enqueued tasks on the
//! engine's single worker and hands back completion handles. Reloading
//! configuration swaps in a freshly built engine and worker; the old
//! worker's handle is dropped, so it drains the tasks it already holds
//! without cancelling them and then exits.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use kelp_retriever::engine::QueryOptions;
use kelp_retriever::task_queue::TaskHandle;
use kelp_retriever::{
    spawn_worker, Engine, EngineConfig, QueueHandle, Result, RetrieverError, TaskQueueConfig,
    TaskRequest,
};
use parking_lot::RwLock;

use crate::config::KelpConfig;

/// Optional narrowing of a query.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub max_results: Option<usize>,
    pub limit_lines: Option<usize>,
    pub context_above: Option<u32>,
    pub context_below: Option<u32>,
    /// Deadline for the task; expired tasks resolve as `Cancelled`.
    pub timeout: Option<Duration>,
}

impl QueryFilters {
    fn to_options(&self) -> Result<QueryOptions> {
        Ok(QueryOptions {
            limit_lines: self.limit_lines,
            context_above: self.context_above,
            context_below: self.context_below,
            max_results: self.max_results,
            include: build_globset(&self.include_globs)?,
            exclude: build_globset(&self.exclude_globs)?,
        })
    }
}

/// The public request-handling surface consumed by the transport layer.
pub struct SearchService {
    repo_path: PathBuf,
    cache_root: Option<PathBuf>,
    queue: RwLock<QueueHandle>,
}

impl SearchService {
    /// Build the engine for `repo_path` and start its worker.
    pub async fn start(repo_path: PathBuf, config: &KelpConfig) -> Result<Self> {
        Self::start_with_cache_root(repo_path, config, None).await
    }

    /// As [`SearchService::start`], with an explicit cache root (tests use
    /// a scratch directory instead of the platform cache).
    pub async fn start_with_cache_root(
        repo_path: PathBuf,
        config: &KelpConfig,
        cache_root: Option<PathBuf>,
    ) -> Result<Self> {
        let queue = Self::spawn(&repo_path, config, cache_root.as_deref()).await?;
        Ok(Self {
            repo_path,
            cache_root,
            queue: RwLock::new(queue),
        })
    }

    async fn spawn(
        repo_path: &std::path::Path,
        config: &KelpConfig,
        cache_root: Option<&std::path::Path>,
    ) -> Result<QueueHandle> {
        let mut engine_config = EngineConfig::new(repo_path.to_path_buf())
            .with_ignore_patterns(config.server.ignore_patterns.clone())
            .with_read_max_commits(config.server.read_max_commits)
            .with_embedding_function(&config.embedding.function)
            .with_embedding_batch_size(config.embedding.batch_size);
        if let Some(root) = cache_root {
            engine_config = engine_config.with_cache_root(root.to_path_buf());
        }
        let engine = Engine::new(engine_config).await?;
        Ok(spawn_worker(engine, TaskQueueConfig::default()))
    }

    /// Enqueue a query; the handle resolves with ranked blocks or a typed
    /// error.
    pub fn submit_query(&self, text: String, filters: QueryFilters) -> Result<TaskHandle> {
        let opts = filters.to_options()?;
        let deadline = filters.timeout.map(|t| Instant::now() + t);
        self.queue
            .read()
            .submit(TaskRequest::Query { text, opts }, deadline)
    }

    /// Enqueue a status request: queue depth, chunks analyzed, staleness.
    pub fn get_status(&self) -> Result<TaskHandle> {
        self.queue.read().submit(TaskRequest::Stats, None)
    }

    /// Enqueue a full analyze pass.
    pub fn submit_analyze(&self) -> Result<TaskHandle> {
        self.queue.read().submit(TaskRequest::Analyze, None)
    }

    /// Re-read configuration and reconstruct the engine behind a fresh
    /// worker. In-flight tasks on the old worker drain to completion.
    pub async fn reload_config(&self) -> Result<()> {
        let config = KelpConfig::load(&self.repo_path);
        let fresh = Self::spawn(&self.repo_path, &config, self.cache_root.as_deref()).await?;
        let old = std::mem::replace(&mut *self.queue.write(), fresh);
        drop(old);
        tracing::info!("configuration reloaded, engine rebuilt");
        Ok(())
    }

    /// Tasks submitted to the current worker and not yet completed.
    pub fn queue_depth(&self) -> usize {
        self.queue.read().depth()
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            RetrieverError::internal(format!("bad path filter {pattern:?}: {e}"))
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| RetrieverError::internal(format!("path filters: {e}")))?;
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_translate_to_query_options() {
        let filters = QueryFilters {
            include_globs: vec!["src/**".to_string()],
            exclude_globs: vec!["**/*_test.rs".to_string()],
            max_results: Some(10),
            limit_lines: Some(100),
            context_above: Some(1),
            context_below: Some(2),
            timeout: None,
        };
        let opts = filters.to_options().unwrap();
        assert_eq!(opts.max_results, Some(10));
        assert_eq!(opts.limit_lines, Some(100));
        assert!(opts.include.unwrap().is_match("src/lib.rs"));
        assert!(opts.exclude.unwrap().is_match("src/lib_test.rs"));
    }

    #[test]
    fn bad_globs_surface_as_internal_errors() {
        let filters = QueryFilters {
            include_globs: vec!["src/{**".to_string()],
            ..QueryFilters::default()
        };
        assert!(filters.to_options().is_err());
    }
}

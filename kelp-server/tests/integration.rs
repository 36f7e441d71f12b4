//! End-to-end facade tests: scratch Git repo in, ranked blocks out.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kelp_retriever::merge::LineRole;
use kelp_retriever::task_queue::TaskOutput;
use kelp_server::config::KelpConfig;
use kelp_server::service::{QueryFilters, SearchService};
use tempfile::tempdir;

fn git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn commit_file(repo: &Path, path: &str, content: &str) {
    let full = repo.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, content).unwrap();
    git(repo, &["add", path]);
    git(repo, &["commit", "-q", "-m", "update"]);
}

async fn service_for(repo: &Path, cache: &Path) -> Arc<SearchService> {
    let config = KelpConfig::default();
    Arc::new(
        SearchService::start_with_cache_root(
            repo.to_path_buf(),
            &config,
            Some(cache.to_path_buf()),
        )
        .await
        .unwrap(),
    )
}

async fn analyze(service: &SearchService) {
    let output = service.submit_analyze().unwrap().wait().await.unwrap();
    assert!(matches!(output, TaskOutput::Analyze(_)));
}

#[tokio::test]
async fn query_returns_blocks_with_roles_and_scores() {
    let repo = tempdir().unwrap();
    let cache = tempdir().unwrap();
    git(repo.path(), &["init", "-q", "-b", "main"]);
    git(repo.path(), &["config", "user.email", "tests@example.com"]);
    git(repo.path(), &["config", "user.name", "Tests"]);
    commit_file(
        repo.path(),
        "src/session.rs",
        "use std::net::TcpStream;\n\
         \n\
         pub struct Session {\n\
             stream: TcpStream,\n\
         }\n\
         \n\
         pub fn open_session(addr: &str) -> Session {\n\
             todo!()\n\
         }\n",
    );

    let service = service_for(repo.path(), cache.path()).await;
    analyze(&service).await;

    let handle = service
        .submit_query("open_session".to_string(), QueryFilters::default())
        .unwrap();
    let TaskOutput::Query(result) = handle.wait().await.unwrap() else {
        panic!("expected query output");
    };

    assert!(!result.partial);
    assert_eq!(result.files[0].path, "src/session.rs");
    let block = &result.files[0].blocks[0];
    assert!(block.first_line <= 7 && 7 <= block.last_line);

    let hit = block.lines.iter().find(|l| l.line == 7).unwrap();
    assert!(hit.result_types.contains(&LineRole::Result));
    assert!(hit.line_text.contains("open_session"));
    assert!(hit.score > 0.0);

    // Neighbors arrive as context with smaller scores.
    let context = block.lines.iter().find(|l| l.line == 6).unwrap();
    assert!(context.result_types.contains(&LineRole::Context));
    assert!(context.score < hit.score);
}

#[tokio::test]
async fn status_reports_progress_and_queue_depth() {
    let repo = tempdir().unwrap();
    let cache = tempdir().unwrap();
    git(repo.path(), &["init", "-q", "-b", "main"]);
    git(repo.path(), &["config", "user.email", "tests@example.com"]);
    git(repo.path(), &["config", "user.name", "Tests"]);
    commit_file(repo.path(), "a.rs", "fn alpha() {}\n");

    let service = service_for(repo.path(), cache.path()).await;
    analyze(&service).await;

    let TaskOutput::Stats(report) = service.get_status().unwrap().wait().await.unwrap() else {
        panic!("expected stats output");
    };
    assert_eq!(report.total_files, 1);
    assert!(report.chunks_analyzed >= 1);
    assert!(!report.stale);
    assert!(report.last_analyzed_at.is_some());
}

#[tokio::test]
async fn empty_queries_are_rejected_with_a_typed_error() {
    let repo = tempdir().unwrap();
    let cache = tempdir().unwrap();
    git(repo.path(), &["init", "-q", "-b", "main"]);
    git(repo.path(), &["config", "user.email", "tests@example.com"]);
    git(repo.path(), &["config", "user.name", "Tests"]);
    commit_file(repo.path(), "a.rs", "fn alpha() {}\n");

    let service = service_for(repo.path(), cache.path()).await;
    let err = service
        .submit_query("   ".to_string(), QueryFilters::default())
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EmptyQuery");
}

#[tokio::test]
async fn reload_swaps_the_engine_and_keeps_serving() {
    let repo = tempdir().unwrap();
    let cache = tempdir().unwrap();
    git(repo.path(), &["init", "-q", "-b", "main"]);
    git(repo.path(), &["config", "user.email", "tests@example.com"]);
    git(repo.path(), &["config", "user.name", "Tests"]);
    commit_file(repo.path(), "a.rs", "fn reload_probe() {}\n");

    let service = service_for(repo.path(), cache.path()).await;
    analyze(&service).await;

    // Reload re-reads on-disk config (none here, so defaults) and swaps in
    // a fresh engine over the same pinned cache root.
    service.reload_config().await.unwrap();
    analyze(&service).await;

    let handle = service
        .submit_query("reload_probe".to_string(), QueryFilters::default())
        .unwrap();
    let TaskOutput::Query(result) = handle.wait().await.unwrap() else {
        panic!("expected query output");
    };
    assert_eq!(result.files[0].path, "a.rs");
}

#[tokio::test]
async fn expired_timeouts_surface_as_cancelled() {
    let repo = tempdir().unwrap();
    let cache = tempdir().unwrap();
    git(repo.path(), &["init", "-q", "-b", "main"]);
    git(repo.path(), &["config", "user.email", "tests@example.com"]);
    git(repo.path(), &["config", "user.name", "Tests"]);
    commit_file(repo.path(), "a.rs", "fn alpha() {}\n");

    let service = service_for(repo.path(), cache.path()).await;

    // A zero timeout has always expired by the time the worker gets to it.
    let started = Instant::now();
    let err = service
        .submit_query(
            "alpha".to_string(),
            QueryFilters {
                timeout: Some(Duration::ZERO),
                ..QueryFilters::default()
            },
        )
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.code(), "Cancelled");
    assert!(started.elapsed() < Duration::from_secs(10));
}

//! Scratch Git repositories for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

pub fn git(repo: &Path, args: &[&str]) {
    git_with_env(repo, args, &[]);
}

pub fn git_with_env(repo: &Path, args: &[&str], env: &[(&str, &str)]) {
    let mut command = Command::new("git");
    command.arg("-C").arg(repo).args(args);
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().expect("failed to run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.email", "tests@example.com"]);
    git(dir, &["config", "user.name", "Integration Tests"]);
}

pub fn commit_file(repo: &Path, path: &str, content: &str, message: &str) {
    write_and_add(repo, path, content);
    git(repo, &["commit", "-q", "-m", message]);
}

/// Commit with an explicit author/committer date (RFC 3339).
pub fn commit_file_at(repo: &Path, path: &str, content: &str, message: &str, date: &str) {
    write_and_add(repo, path, content);
    git_with_env(
        repo,
        &["commit", "-q", "-m", message],
        &[("GIT_AUTHOR_DATE", date), ("GIT_COMMITTER_DATE", date)],
    );
}

pub fn remove_file(repo: &Path, path: &str, message: &str) {
    git(repo, &["rm", "-q", path]);
    git(repo, &["commit", "-q", "-m", message]);
}

fn write_and_add(repo: &Path, path: &str, content: &str) {
    let full = repo.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, content).unwrap();
    git(repo, &["add", path]);
}

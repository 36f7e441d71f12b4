//! Regex source: line-addressed corpus with pattern matching.
//!
//! The corpus maps `(path, line number)` to the line's text. Upserts patch
//! it from chunk lines (chunks jointly cover their file, overlap included),
//! so after an analyze pass the corpus holds the full text of every indexed
//! file. Matching follows the grep contract: the corpus is flattened into
//! `<path>:<line>:<content>` records, the pattern runs against each record,
//! and matching records parse back into hits with score 1.0.
//!
//! Queries made of plain words are tokenized into a case-insensitive,
//! word-bounded alternation; anything else is passed through as a raw
//! regex. A pattern that does not compile fails only this source; the
//! engine still serves the vector side and flags the result partial.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use kelp_context::Chunk;
use regex::Regex;

use super::{Hit, SearchSource, SourceKind};
use crate::error::{Result, RetrieverError};

/// In-memory `(path, line) → text` store, 1-based line addressing.
///
/// Shared between the regex source (matching) and the result merger
/// (context and bridge line lookup).
#[derive(Default)]
pub struct LineCorpus {
    files: RwLock<HashMap<String, Vec<String>>>,
}

impl LineCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a file's lines wholesale.
    pub fn set_file(&self, path: &str, lines: Vec<String>) {
        self.files.write().unwrap().insert(path.to_string(), lines);
    }

    /// Patch a file with one chunk's lines, growing the file as needed.
    pub fn patch_chunk(&self, chunk: &Chunk) {
        let mut files = self.files.write().unwrap();
        let lines = files.entry(chunk.path.clone()).or_default();
        let start = (chunk.start_line - 1) as usize;
        for (offset, text) in chunk.text.split('\n').enumerate() {
            let index = start + offset;
            if index >= lines.len() {
                lines.resize(index + 1, String::new());
            }
            lines[index] = text.to_string();
        }
    }

    pub fn remove_file(&self, path: &str) {
        self.files.write().unwrap().remove(path);
    }

    /// Text of one line, or `None` past the end of the file.
    pub fn line_text(&self, path: &str, line: u32) -> Option<String> {
        if line == 0 {
            return None;
        }
        self.files
            .read()
            .unwrap()
            .get(path)
            .and_then(|lines| lines.get((line - 1) as usize).cloned())
    }

    pub fn file_count(&self) -> usize {
        self.files.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }

    /// Flatten the corpus into `<path>:<line>:<content>` records, paths in
    /// sorted order so matching is deterministic.
    fn records(&self) -> Vec<String> {
        let files = self.files.read().unwrap();
        let mut paths: Vec<&String> = files.keys().collect();
        paths.sort();
        let mut records = Vec::new();
        for path in paths {
            for (index, text) in files[path].iter().enumerate() {
                records.push(format!("{path}:{}:{text}", index + 1));
            }
        }
        records
    }
}

/// Regex-matching source over a [`LineCorpus`].
pub struct RegexSource {
    corpus: Arc<LineCorpus>,
    // chunk id → path, so `delete` can drop the owning file.
    chunk_paths: RwLock<HashMap<String, String>>,
}

impl RegexSource {
    pub fn new(corpus: Arc<LineCorpus>) -> Self {
        Self {
            corpus,
            chunk_paths: RwLock::new(HashMap::new()),
        }
    }

    pub fn corpus(&self) -> &Arc<LineCorpus> {
        &self.corpus
    }

    /// Drop a whole file from the corpus and forget its chunk ids.
    pub fn purge_path(&self, path: &str) {
        self.corpus.remove_file(path);
        self.chunk_paths.write().unwrap().retain(|_, p| p != path);
    }
}

#[async_trait]
impl SearchSource for RegexSource {
    async fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
        let mut chunk_paths = self.chunk_paths.write().unwrap();
        for chunk in chunks {
            self.corpus.patch_chunk(chunk);
            chunk_paths.insert(chunk.id.clone(), chunk.path.clone());
        }
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Hit>> {
        let pattern = build_pattern(text);
        let regex = Regex::new(&pattern).map_err(|e| RetrieverError::InvalidRegex {
            pattern: text.to_string(),
            message: e.to_string(),
        })?;

        let mut hits = Vec::new();
        for record in self.corpus.records() {
            if hits.len() >= limit {
                break;
            }
            if !regex.is_match(&record) {
                continue;
            }
            if let Some((path, line)) = parse_record(&record) {
                hits.push(Hit {
                    path,
                    line,
                    score: 1.0,
                    source: SourceKind::Regex,
                });
            }
        }
        Ok(hits)
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<()> {
        let paths: Vec<String> = {
            let chunk_paths = self.chunk_paths.read().unwrap();
            chunk_ids
                .iter()
                .filter_map(|id| chunk_paths.get(id).cloned())
                .collect()
        };
        for path in paths {
            self.purge_path(&path);
        }
        Ok(())
    }
}

/// Turn query text into the pattern handed to the matcher.
///
/// Word queries (alphanumerics, underscores and spaces only) become a
/// case-insensitive alternation with word boundaries; anything else is a
/// regex already and passes through untouched.
fn build_pattern(text: &str) -> String {
    let is_word_query = !text.trim().is_empty()
        && text
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == ' ');
    if !is_word_query {
        return text.to_string();
    }
    let alternation = text
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("|");
    format!("(?i)\\b(?:{alternation})\\b")
}

fn parse_record(record: &str) -> Option<(String, u32)> {
    let mut parts = record.splitn(3, ':');
    let path = parts.next()?.to_string();
    let line = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((path, line))
}

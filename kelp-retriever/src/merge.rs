//! Result merger: combines vector and regex hits into ranked blocks.
//!
//! Scoring is a weighted sum of source similarity and file frecency. Each
//! hit expands into a window of context lines whose scores decay with
//! distance, nearby regions within one file are joined by bridge lines,
//! and the contiguous runs that remain become blocks ranked by their best
//! line. A strong hit promotes its whole block; weak surroundings never
//! dilute it, which is why a block scores as the maximum of its lines
//! rather than the average.
//!
//! Line text is resolved by lookup against the corpus; blocks own their
//! lines as plain values and nothing holds a back-pointer.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::sources::{Hit, LineCorpus, SourceKind};

/// How a line ended up in a result block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineRole {
    /// The line itself matched a source.
    Result,
    /// Expansion around a matching line.
    Context,
    /// Synthetic filler joining two nearby regions.
    Bridge,
}

/// One line of output with its score and provenance.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultLine {
    pub line: u32,
    pub line_text: String,
    pub score: f32,
    pub result_types: BTreeSet<LineRole>,
    pub sources: BTreeSet<SourceKind>,
}

/// A maximal contiguous run of result lines from one file.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultBlock {
    pub first_line: u32,
    pub last_line: u32,
    pub score: f32,
    pub lines: Vec<ResultLine>,
}

/// All blocks for one file, in rank order.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileBlocks {
    pub path: String,
    pub blocks: Vec<ResultBlock>,
}

/// The merged, ranked answer to one query.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SearchResult {
    pub files: Vec<FileBlocks>,
    /// True when one source failed and the other's results were returned.
    pub partial: bool,
    /// Error code of the degraded source, when `partial` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_error: Option<String>,
}

impl SearchResult {
    pub fn line_count(&self) -> usize {
        self.files
            .iter()
            .flat_map(|f| &f.blocks)
            .map(|b| b.lines.len())
            .sum()
    }
}

/// Merge tuning knobs.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub similarity_weight: f32,
    pub frecency_weight: f32,
    pub context_above: u32,
    pub context_below: u32,
    pub context_decay: f32,
    pub bridge_gap: u32,
    pub bridge_penalty: f32,
    pub limit_lines: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.7,
            frecency_weight: 0.3,
            context_above: 3,
            context_below: 3,
            context_decay: 0.8,
            bridge_gap: 2,
            bridge_penalty: 0.5,
            limit_lines: 500,
        }
    }
}

#[derive(Debug, Clone)]
struct LineEntry {
    score: f32,
    roles: BTreeSet<LineRole>,
    sources: BTreeSet<SourceKind>,
}

/// Merge hits from both sources into a ranked result.
///
/// Merging is deterministic: the same hits, frecency map and corpus always
/// produce an identical result, ordering and scores included.
pub fn merge_hits(
    hits: &[Hit],
    frecency: &HashMap<String, f32>,
    corpus: &LineCorpus,
    config: &MergeConfig,
) -> SearchResult {
    // Fold hits into per-line best similarity with unioned source tags.
    let mut hit_lines: BTreeMap<(String, u32), (f32, BTreeSet<SourceKind>)> = BTreeMap::new();
    for hit in hits {
        let entry = hit_lines
            .entry((hit.path.clone(), hit.line))
            .or_insert_with(|| (0.0, BTreeSet::new()));
        entry.0 = entry.0.max(hit.score.clamp(0.0, 1.0));
        entry.1.insert(hit.source);
    }

    // Per-path line maps: hit lines first, then context expansion.
    let mut files: BTreeMap<String, BTreeMap<u32, LineEntry>> = BTreeMap::new();
    for ((path, line), (similarity, sources)) in &hit_lines {
        let base = config.similarity_weight * similarity
            + config.frecency_weight * frecency.get(path).copied().unwrap_or(0.0);
        let lines = files.entry(path.clone()).or_default();

        upsert_line(lines, *line, base, LineRole::Result, sources);

        for (direction, radius) in [(-1i64, config.context_above), (1i64, config.context_below)] {
            for distance in 1..=radius as i64 {
                let candidate = *line as i64 + direction * distance;
                if candidate < 1 {
                    break;
                }
                let candidate = candidate as u32;
                if corpus.line_text(path, candidate).is_none() {
                    break;
                }
                let decayed = base * config.context_decay.powi(distance as i32);
                upsert_line(lines, candidate, decayed, LineRole::Context, sources);
            }
        }
    }

    // Bridge small gaps within each file, then cut contiguous blocks.
    let mut blocks: Vec<(String, ResultBlock)> = Vec::new();
    for (path, mut lines) in files {
        bridge_gaps(&path, &mut lines, corpus, config);
        blocks.extend(
            cut_blocks(&path, &lines, corpus)
                .into_iter()
                .map(|block| (path.clone(), block)),
        );
    }

    // Rank: best block first; ties stay stable by path then first line.
    blocks.sort_by(|(path_a, a), (path_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| path_a.cmp(path_b))
            .then_with(|| a.first_line.cmp(&b.first_line))
    });

    // Truncate to the line budget; bridge lines count toward it.
    let mut result = SearchResult::default();
    let mut budget = config.limit_lines;
    for (path, mut block) in blocks {
        if budget == 0 {
            break;
        }
        if block.lines.len() > budget {
            block.lines.truncate(budget);
            block.last_line = block.lines.last().map(|l| l.line).unwrap_or(block.first_line);
        }
        budget -= block.lines.len();

        match result.files.iter_mut().find(|f| f.path == path) {
            Some(file) => file.blocks.push(block),
            None => result.files.push(FileBlocks {
                path,
                blocks: vec![block],
            }),
        }
    }
    result
}

fn upsert_line(
    lines: &mut BTreeMap<u32, LineEntry>,
    line: u32,
    score: f32,
    role: LineRole,
    sources: &BTreeSet<SourceKind>,
) {
    let entry = lines.entry(line).or_insert_with(|| LineEntry {
        score: 0.0,
        roles: BTreeSet::new(),
        sources: BTreeSet::new(),
    });
    entry.score = entry.score.max(score);
    // A matching line stays a result even when a neighbor's window reaches
    // it; context never demotes.
    if role != LineRole::Context || !entry.roles.contains(&LineRole::Result) {
        entry.roles.insert(role);
    }
    entry.sources.extend(sources.iter().copied());
}

fn bridge_gaps(
    path: &str,
    lines: &mut BTreeMap<u32, LineEntry>,
    corpus: &LineCorpus,
    config: &MergeConfig,
) {
    if config.bridge_gap == 0 {
        return;
    }
    let present: Vec<u32> = lines.keys().copied().collect();
    for window in present.windows(2) {
        let (prev, next) = (window[0], window[1]);
        let gap = next - prev - 1;
        if gap == 0 || gap > config.bridge_gap {
            continue;
        }
        // Bridging requires real lines; a hole in the corpus keeps the
        // blocks apart.
        if ((prev + 1)..next).any(|l| corpus.line_text(path, l).is_none()) {
            continue;
        }
        let score =
            lines[&prev].score.min(lines[&next].score) * config.bridge_penalty;
        for line in (prev + 1)..next {
            let entry = lines.entry(line).or_insert_with(|| LineEntry {
                score: 0.0,
                roles: BTreeSet::new(),
                sources: BTreeSet::new(),
            });
            entry.score = entry.score.max(score);
            entry.roles.insert(LineRole::Bridge);
        }
    }
}

fn cut_blocks(
    path: &str,
    lines: &BTreeMap<u32, LineEntry>,
    corpus: &LineCorpus,
) -> Vec<ResultBlock> {
    let mut blocks = Vec::new();
    let mut run: Vec<ResultLine> = Vec::new();

    for (&line, entry) in lines {
        let contiguous = run
            .last()
            .map(|prev: &ResultLine| prev.line + 1 == line)
            .unwrap_or(true);
        if !contiguous {
            blocks.push(finish_block(std::mem::take(&mut run)));
        }
        run.push(ResultLine {
            line,
            line_text: corpus.line_text(path, line).unwrap_or_default(),
            score: entry.score,
            result_types: entry.roles.clone(),
            sources: entry.sources.clone(),
        });
    }
    if !run.is_empty() {
        blocks.push(finish_block(run));
    }
    blocks
}

fn finish_block(lines: Vec<ResultLine>) -> ResultBlock {
    let score = lines.iter().map(|l| l.score).fold(0.0f32, f32::max);
    ResultBlock {
        first_line: lines.first().map(|l| l.line).unwrap_or(0),
        last_line: lines.last().map(|l| l.line).unwrap_or(0),
        score,
        lines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn corpus_with(path: &str, line_count: usize) -> Arc<LineCorpus> {
        let corpus = Arc::new(LineCorpus::new());
        corpus.set_file(
            path,
            (1..=line_count).map(|i| format!("content of line {i}")).collect(),
        );
        corpus
    }

    fn hit(path: &str, line: u32, score: f32, source: SourceKind) -> Hit {
        Hit {
            path: path.to_string(),
            line,
            score,
            source,
        }
    }

    fn no_context() -> MergeConfig {
        MergeConfig {
            context_above: 0,
            context_below: 0,
            ..MergeConfig::default()
        }
    }

    #[test]
    fn empty_hits_merge_to_an_empty_result() {
        let corpus = corpus_with("a.rs", 10);
        let result = merge_hits(&[], &HashMap::new(), &corpus, &MergeConfig::default());
        assert!(result.files.is_empty());
        assert!(!result.partial);
    }

    #[test]
    fn bridges_two_hits_across_small_gap() {
        // Hits at lines 10 and 12 with no context: a single block covering
        // 10..=12 where line 11 is a bridge scored min(10, 12) * 0.5.
        let corpus = corpus_with("a.rs", 20);
        let hits = vec![
            hit("a.rs", 10, 0.8, SourceKind::Vector),
            hit("a.rs", 12, 0.6, SourceKind::Vector),
        ];
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &no_context());

        assert_eq!(result.files.len(), 1);
        let blocks = &result.files[0].blocks;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].first_line, 10);
        assert_eq!(blocks[0].last_line, 12);

        let bridge = &blocks[0].lines[1];
        assert_eq!(bridge.line, 11);
        assert_eq!(bridge.result_types, BTreeSet::from([LineRole::Bridge]));
        let expected = (0.7f32 * 0.6).min(0.7 * 0.8) * 0.5;
        assert!((bridge.score - expected).abs() < 1e-6);
    }

    #[test]
    fn bridging_is_idempotent_and_maximal() {
        let corpus = corpus_with("a.rs", 20);
        let hits = vec![
            hit("a.rs", 5, 0.9, SourceKind::Vector),
            hit("a.rs", 7, 0.9, SourceKind::Vector),
            hit("a.rs", 9, 0.9, SourceKind::Vector),
        ];
        let first = merge_hits(&hits, &HashMap::new(), &corpus, &no_context());
        let second = merge_hits(&hits, &HashMap::new(), &corpus, &no_context());
        assert_eq!(first, second);
        assert_eq!(first.files[0].blocks.len(), 1);
        assert_eq!(first.files[0].blocks[0].first_line, 5);
        assert_eq!(first.files[0].blocks[0].last_line, 9);
    }

    #[test]
    fn wide_gaps_stay_separate_blocks() {
        let corpus = corpus_with("a.rs", 30);
        let hits = vec![
            hit("a.rs", 5, 0.9, SourceKind::Vector),
            hit("a.rs", 20, 0.9, SourceKind::Vector),
        ];
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &no_context());
        assert_eq!(result.files[0].blocks.len(), 2);
    }

    #[test]
    fn frecency_ranks_equal_similarity_hits() {
        // Equal similarity 0.5, file A fresh (frecency 1.0), file B old
        // (about 0.06): composites 0.65 vs about 0.368.
        let corpus = Arc::new(LineCorpus::new());
        corpus.set_file("a.rs", vec!["alpha".into(); 5]);
        corpus.set_file("b.rs", vec!["beta".into(); 5]);
        let frecency = HashMap::from([
            ("a.rs".to_string(), 1.0f32),
            ("b.rs".to_string(), 0.06f32),
        ]);
        let hits = vec![
            hit("b.rs", 1, 0.5, SourceKind::Vector),
            hit("a.rs", 1, 0.5, SourceKind::Vector),
        ];
        let result = merge_hits(&hits, &frecency, &corpus, &no_context());

        assert_eq!(result.files[0].path, "a.rs");
        let score_a = result.files[0].blocks[0].score;
        let score_b = result.files[1].blocks[0].score;
        assert!((score_a - 0.65).abs() < 1e-6);
        assert!((score_b - (0.7 * 0.5 + 0.3 * 0.06)).abs() < 1e-6);
    }

    #[test]
    fn context_lines_decay_with_distance() {
        let corpus = corpus_with("a.rs", 20);
        let hits = vec![hit("a.rs", 10, 1.0, SourceKind::Regex)];
        let config = MergeConfig::default();
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &config);

        let block = &result.files[0].blocks[0];
        assert_eq!(block.first_line, 7);
        assert_eq!(block.last_line, 13);

        let base = 0.7f32;
        let by_line: HashMap<u32, &ResultLine> =
            block.lines.iter().map(|l| (l.line, l)).collect();
        assert!((by_line[&10].score - base).abs() < 1e-6);
        assert!((by_line[&9].score - base * 0.8).abs() < 1e-6);
        assert!((by_line[&7].score - base * 0.8f32.powi(3)).abs() < 1e-6);
        assert!((by_line[&13].score - base * 0.8f32.powi(3)).abs() < 1e-6);
        assert_eq!(by_line[&9].result_types, BTreeSet::from([LineRole::Context]));
        assert_eq!(by_line[&10].result_types, BTreeSet::from([LineRole::Result]));
    }

    #[test]
    fn context_stops_at_file_boundaries() {
        let corpus = corpus_with("a.rs", 4);
        let hits = vec![hit("a.rs", 2, 1.0, SourceKind::Regex)];
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &MergeConfig::default());
        let block = &result.files[0].blocks[0];
        assert_eq!(block.first_line, 1);
        assert_eq!(block.last_line, 4);
    }

    #[test]
    fn dual_source_hits_keep_both_tags_and_the_higher_similarity() {
        let corpus = corpus_with("a.rs", 5);
        let hits = vec![
            hit("a.rs", 3, 0.4, SourceKind::Vector),
            hit("a.rs", 3, 1.0, SourceKind::Regex),
        ];
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &no_context());
        let line = &result.files[0].blocks[0].lines[0];
        assert_eq!(
            line.sources,
            BTreeSet::from([SourceKind::Vector, SourceKind::Regex])
        );
        assert!((line.score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn block_score_is_the_maximum_not_the_average() {
        let corpus = corpus_with("a.rs", 20);
        let hits = vec![
            hit("a.rs", 10, 1.0, SourceKind::Regex),
            hit("a.rs", 11, 0.1, SourceKind::Vector),
        ];
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &no_context());
        let block = &result.files[0].blocks[0];
        assert!((block.score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn truncation_counts_bridge_lines() {
        let corpus = corpus_with("a.rs", 20);
        let hits = vec![
            hit("a.rs", 10, 0.8, SourceKind::Vector),
            hit("a.rs", 12, 0.8, SourceKind::Vector),
        ];
        let config = MergeConfig {
            limit_lines: 2,
            ..no_context()
        };
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &config);
        assert_eq!(result.line_count(), 2);
        let block = &result.files[0].blocks[0];
        assert_eq!(block.first_line, 10);
        assert_eq!(block.last_line, 11);
    }

    #[test]
    fn blocks_are_contiguous_and_single_path() {
        let corpus = corpus_with("a.rs", 30);
        corpus.set_file(
            "b.rs",
            (1..=30).map(|i| format!("content of line {i}")).collect(),
        );
        let hits = vec![
            hit("a.rs", 3, 0.9, SourceKind::Vector),
            hit("b.rs", 4, 0.7, SourceKind::Vector),
            hit("a.rs", 20, 0.5, SourceKind::Regex),
        ];
        let result = merge_hits(&hits, &HashMap::new(), &corpus, &MergeConfig::default());
        for file in &result.files {
            for block in &file.blocks {
                let mut expected = block.first_line;
                for line in &block.lines {
                    assert_eq!(line.line, expected);
                    expected += 1;
                }
                assert_eq!(block.last_line, expected - 1);
            }
        }
    }
}

//! Durable analysis cache.
//!
//! Each repository gets its own directory under the cache root, named by a
//! digest of the cache format version and the canonical repository path.
//! Bumping [`CACHE_FORMAT_VERSION`] therefore routes to a brand-new
//! directory and implicitly invalidates every prior cache, including the
//! vector store's database which lives in the same directory.
//!
//! The payload is a single bincode file written via temp-file + rename, so
//! readers outside the engine either see the previous complete payload or
//! the new one, never a torn write. Absent or unreadable payloads load as
//! an empty cache; present but undecodable payloads surface as
//! `CacheCorrupt`, which the engine answers by discarding and rebuilding.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Result, RetrieverError};

/// Bumped whenever the payload layout or the chunking scheme changes in a
/// way that invalidates prior analysis.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const PAYLOAD_FILE: &str = "analysis.bin";
const VECTOR_DB_FILE: &str = "vectors.db";

/// Everything the engine persists between runs.
#[derive(Debug, Default, Clone, bincode::Encode, bincode::Decode)]
pub struct AnalysisSnapshot {
    /// Chunk ids known to be embedded and upserted into the vector source.
    pub analyzed: HashSet<String>,
    /// Last-observed frecency map.
    pub frecency: HashMap<String, f32>,
    /// Last-observed repo state hash.
    pub repo_state_hash: Option<String>,
    /// Unix timestamp of the last completed analyze pass.
    pub last_analyzed_at: Option<i64>,
}

/// Handle to one repository's cache directory.
pub struct AnalysisCache {
    dir: PathBuf,
}

impl AnalysisCache {
    /// Open (and create) the cache directory for a repository under an
    /// explicit cache root.
    pub fn open(cache_root: &Path, repo_path: &Path) -> Result<Self> {
        let dir = cache_root.join(repo_digest(repo_path));
        std::fs::create_dir_all(&dir)
            .map_err(|e| RetrieverError::backend(format!("creating {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// Open the cache under the platform cache root (`~/.cache/kelp`).
    pub fn open_default(repo_path: &Path) -> Result<Self> {
        Self::open(&default_cache_root(), repo_path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the vector source keeps its own on-disk state. Opaque here;
    /// colocated so a format-version bump sweeps it away too.
    pub fn vector_db_path(&self) -> PathBuf {
        self.dir.join(VECTOR_DB_FILE)
    }

    fn payload_path(&self) -> PathBuf {
        self.dir.join(PAYLOAD_FILE)
    }

    /// Load the persisted snapshot. A missing file is an empty cache; a
    /// present but undecodable file is `CacheCorrupt`.
    pub fn load(&self) -> Result<AnalysisSnapshot> {
        let bytes = match std::fs::read(self.payload_path()) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(AnalysisSnapshot::default()),
        };
        let config = bincode::config::standard();
        let (version, rest): (u32, _) = bincode::decode_from_slice(&bytes, config)
            .map(|(v, n)| (v, &bytes[n..]))
            .map_err(|e| RetrieverError::cache_corrupt(format!("version tag: {e}")))?;
        if version != CACHE_FORMAT_VERSION {
            return Err(RetrieverError::cache_corrupt(format!(
                "payload version {version}, expected {CACHE_FORMAT_VERSION}"
            )));
        }
        let (snapshot, _) = bincode::decode_from_slice(rest, config)
            .map_err(|e| RetrieverError::cache_corrupt(e.to_string()))?;
        Ok(snapshot)
    }

    /// Load, treating corruption as a fresh start.
    pub fn load_or_discard(&self) -> AnalysisSnapshot {
        match self.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!("discarding cache at {}: {err}", self.dir.display());
                AnalysisSnapshot::default()
            }
        }
    }

    /// Persist the snapshot atomically.
    pub fn store(&self, snapshot: &AnalysisSnapshot) -> Result<()> {
        let config = bincode::config::standard();
        let mut bytes = bincode::encode_to_vec(CACHE_FORMAT_VERSION, config)
            .map_err(|e| RetrieverError::internal(format!("encoding cache version: {e}")))?;
        bytes.extend(
            bincode::encode_to_vec(snapshot, config)
                .map_err(|e| RetrieverError::internal(format!("encoding cache payload: {e}")))?,
        );

        let target = self.payload_path();
        let tmp = target.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes)
            .map_err(|e| RetrieverError::backend(format!("writing {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &target)
            .map_err(|e| RetrieverError::backend(format!("renaming cache payload: {e}")))?;
        Ok(())
    }
}

/// Directory name for a repository: digest of the format version and the
/// canonical repository path.
pub fn repo_digest(repo_path: &Path) -> String {
    let canonical = repo_path
        .canonicalize()
        .unwrap_or_else(|_| repo_path.to_path_buf());
    let mut hasher = blake3::Hasher::new();
    hasher.update(&CACHE_FORMAT_VERSION.to_le_bytes());
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.finalize().to_hex().to_string()[..16].to_string()
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kelp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrips_a_snapshot() {
        let root = tempdir().unwrap();
        let repo = tempdir().unwrap();
        let cache = AnalysisCache::open(root.path(), repo.path()).unwrap();

        let mut snapshot = AnalysisSnapshot::default();
        snapshot.analyzed.insert("abc123".to_string());
        snapshot.frecency.insert("src/lib.rs".to_string(), 1.0);
        snapshot.repo_state_hash = Some("deadbeef".to_string());
        snapshot.last_analyzed_at = Some(1_700_000_000);

        cache.store(&snapshot).unwrap();
        let loaded = cache.load().unwrap();
        assert!(loaded.analyzed.contains("abc123"));
        assert_eq!(loaded.frecency["src/lib.rs"], 1.0);
        assert_eq!(loaded.repo_state_hash.as_deref(), Some("deadbeef"));
        assert_eq!(loaded.last_analyzed_at, Some(1_700_000_000));
    }

    #[test]
    fn missing_payload_loads_as_empty() {
        let root = tempdir().unwrap();
        let repo = tempdir().unwrap();
        let cache = AnalysisCache::open(root.path(), repo.path()).unwrap();
        let snapshot = cache.load().unwrap();
        assert!(snapshot.analyzed.is_empty());
        assert!(snapshot.repo_state_hash.is_none());
    }

    #[test]
    fn garbage_payload_is_reported_corrupt() {
        let root = tempdir().unwrap();
        let repo = tempdir().unwrap();
        let cache = AnalysisCache::open(root.path(), repo.path()).unwrap();
        std::fs::write(cache.dir().join(PAYLOAD_FILE), b"\xff\xff\xfftotally not bincode").unwrap();

        let err = cache.load().unwrap_err();
        assert_eq!(err.code(), "CacheCorrupt");
        // The discard path falls back to an empty snapshot.
        assert!(cache.load_or_discard().analyzed.is_empty());
    }

    #[test]
    fn store_leaves_no_temp_file_behind() {
        let root = tempdir().unwrap();
        let repo = tempdir().unwrap();
        let cache = AnalysisCache::open(root.path(), repo.path()).unwrap();
        cache.store(&AnalysisSnapshot::default()).unwrap();

        let names: Vec<String> = std::fs::read_dir(cache.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&PAYLOAD_FILE.to_string()));
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[test]
    fn version_bump_routes_to_fresh_dir() {
        // Distinct repos land in distinct directories under one root, and
        // the digest folds the format version in, so a bump would change
        // every directory name at once.
        let repo_a = tempdir().unwrap();
        let repo_b = tempdir().unwrap();
        let digest_a = repo_digest(repo_a.path());
        let digest_b = repo_digest(repo_b.path());
        assert_ne!(digest_a, digest_b);
        assert_eq!(digest_a, repo_digest(repo_a.path()));

        let mut hasher = blake3::Hasher::new();
        hasher.update(&(CACHE_FORMAT_VERSION + 1).to_le_bytes());
        hasher.update(
            repo_a
                .path()
                .canonicalize()
                .unwrap()
                .to_string_lossy()
                .as_bytes(),
        );
        let bumped = hasher.finalize().to_hex().to_string()[..16].to_string();
        assert_ne!(digest_a, bumped);
    }
}

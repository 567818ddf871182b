//! ISRC duplicate index.
//!
//! Maps uppercase ISRCs to file paths per output directory so duplicate
//! checks don't rescan the library on every download. Indexes expire after a
//! TTL and are rebuilt behind a per-directory build lock with a double-checked
//! cache read, so concurrent callers never race to walk the same tree. Stale
//! entries (file deleted or truncated to zero) are evicted on lookup.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::probe;

const INDEX_TTL: Duration = Duration::from_secs(5 * 60);

/// A built index for one output directory.
#[derive(Debug)]
pub struct IsrcIndex {
    entries: RwLock<HashMap<String, PathBuf>>,
    built_at: Instant,
}

impl IsrcIndex {
    fn build(output_dir: &Path) -> Self {
        let started = Instant::now();
        let mut entries = HashMap::new();

        for entry in WalkDir::new(output_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_flac = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("flac"));
            if !is_flac {
                continue;
            }
            if let Ok(Some(isrc)) = probe::read_isrc(path) {
                entries.insert(isrc.to_uppercase(), path.to_path_buf());
            }
        }

        info!(
            dir = %output_dir.display(),
            files = entries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ISRC index built"
        );

        Self {
            entries: RwLock::new(entries),
            built_at: Instant::now(),
        }
    }

    fn is_fresh(&self) -> bool {
        self.built_at.elapsed() < INDEX_TTL
    }

    /// Look up an ISRC (case-insensitive).
    pub fn lookup(&self, isrc: &str) -> Option<PathBuf> {
        if isrc.is_empty() {
            return None;
        }
        self.entries.read().get(&isrc.to_uppercase()).cloned()
    }

    /// Record a new file, e.g. after a successful download.
    pub fn add(&self, isrc: &str, path: PathBuf) {
        if isrc.is_empty() {
            return;
        }
        self.entries.write().insert(isrc.to_uppercase(), path);
    }

    fn remove(&self, isrc: &str) {
        self.entries.write().remove(&isrc.to_uppercase());
    }
}

/// Per-directory index cache with TTL and build locking.
#[derive(Debug, Default)]
pub struct IsrcIndexStore {
    cache: RwLock<HashMap<PathBuf, Arc<IsrcIndex>>>,
    build_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl IsrcIndexStore {
    /// Return the cached index for `output_dir`, building it when absent or
    /// older than the TTL.
    pub fn get(&self, output_dir: &Path) -> Arc<IsrcIndex> {
        if let Some(index) = self.fresh_from_cache(output_dir) {
            return index;
        }

        let build_lock = {
            let mut locks = self.build_locks.lock();
            Arc::clone(
                locks
                    .entry(output_dir.to_path_buf())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = build_lock.lock();

        // Another caller may have built it while we waited for the lock.
        if let Some(index) = self.fresh_from_cache(output_dir) {
            return index;
        }

        let index = Arc::new(IsrcIndex::build(output_dir));
        self.cache
            .write()
            .insert(output_dir.to_path_buf(), Arc::clone(&index));
        index
    }

    fn fresh_from_cache(&self, output_dir: &Path) -> Option<Arc<IsrcIndex>> {
        let cache = self.cache.read();
        let index = cache.get(output_dir)?;
        index.is_fresh().then(|| Arc::clone(index))
    }

    /// Eagerly build the index, e.g. on app start.
    pub fn pre_build(&self, output_dir: &Path) {
        let index = Arc::new(IsrcIndex::build(output_dir));
        self.cache
            .write()
            .insert(output_dir.to_path_buf(), index);
    }

    /// Drop the cached index for a directory.
    pub fn invalidate(&self, output_dir: &Path) {
        self.cache.write().remove(output_dir);
    }

    /// Record a freshly downloaded file in the cached index, if one exists.
    pub fn add(&self, output_dir: &Path, isrc: &str, path: PathBuf) {
        if isrc.is_empty() {
            return;
        }
        if let Some(index) = self.cache.read().get(output_dir) {
            index.add(isrc, path);
        }
    }

    /// Check whether a file carrying `isrc` exists under `output_dir`.
    ///
    /// Verifies the indexed file is still on disk and non-empty; stale
    /// entries are evicted and reported as absent.
    pub fn check_exists(&self, output_dir: &Path, isrc: &str) -> Option<PathBuf> {
        if isrc.is_empty() {
            return None;
        }
        let index = self.get(output_dir);
        let path = index.lookup(isrc)?;

        if !file_exists_non_empty(&path) {
            debug!(isrc = %isrc, path = %path.display(), "evicting stale ISRC entry");
            index.remove(isrc);
            return None;
        }
        Some(path)
    }

    /// Batch duplicate check for a list of tracks.
    pub fn check_tracks_exist(
        &self,
        output_dir: &Path,
        tracks: &[TrackQuery],
    ) -> Vec<TrackExistence> {
        let index = self.get(output_dir);
        tracks
            .iter()
            .map(|track| {
                let file_path = if track.isrc.is_empty() {
                    None
                } else {
                    index.lookup(&track.isrc)
                };
                TrackExistence {
                    isrc: track.isrc.clone(),
                    track_name: track.track_name.clone(),
                    artist_name: track.artist_name.clone(),
                    exists: file_path.is_some(),
                    file_path,
                }
            })
            .collect()
    }
}

/// Query row for [`IsrcIndexStore::check_tracks_exist`].
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TrackQuery {
    pub isrc: String,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artist_name: String,
}

/// Result row for [`IsrcIndexStore::check_tracks_exist`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackExistence {
    pub isrc: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub track_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artist_name: String,
}

fn file_exists_non_empty(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::test_support::flac_bytes;

    #[test]
    fn build_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let track = dir.path().join("song.flac");
        std::fs::write(&track, flac_bytes(Some("USUM71700001"))).unwrap();

        let store = IsrcIndexStore::default();
        // Lowercase lookups hit the uppercase key.
        let found = store.check_exists(dir.path(), "usum71700001").unwrap();
        assert_eq!(found, track);
    }

    #[test]
    fn build_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.flac"), flac_bytes(Some("AAXX12345678"))).unwrap();

        let store = IsrcIndexStore::default();
        store.pre_build(dir.path());
        store.pre_build(dir.path());
        assert!(store.check_exists(dir.path(), "AAXX12345678").is_some());
    }

    #[test]
    fn stale_entry_evicted_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let track = dir.path().join("gone.flac");
        std::fs::write(&track, flac_bytes(Some("USUM71700002"))).unwrap();

        let store = IsrcIndexStore::default();
        assert!(store.check_exists(dir.path(), "USUM71700002").is_some());

        std::fs::remove_file(&track).unwrap();
        assert!(store.check_exists(dir.path(), "USUM71700002").is_none());
        // Evicted for good, not just filtered.
        assert!(store.get(dir.path()).lookup("USUM71700002").is_none());
    }

    #[test]
    fn add_after_download_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = IsrcIndexStore::default();
        store.pre_build(dir.path());

        let fresh = dir.path().join("new.flac");
        std::fs::write(&fresh, flac_bytes(Some("GBAYE0601498"))).unwrap();
        store.add(dir.path(), "GBAYE0601498", fresh.clone());

        assert_eq!(store.check_exists(dir.path(), "gbaye0601498").unwrap(), fresh);
    }

    #[test]
    fn invalidate_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let store = IsrcIndexStore::default();
        store.pre_build(dir.path());

        // New file appears after the build: invisible until invalidation.
        std::fs::write(dir.path().join("late.flac"), flac_bytes(Some("FRLAT0000001"))).unwrap();
        assert!(store.check_exists(dir.path(), "FRLAT0000001").is_none());

        store.invalidate(dir.path());
        assert!(store.check_exists(dir.path(), "FRLAT0000001").is_some());
    }

    #[test]
    fn batch_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.flac"), flac_bytes(Some("USUM71700003"))).unwrap();

        let store = IsrcIndexStore::default();
        let results = store.check_tracks_exist(
            dir.path(),
            &[
                TrackQuery {
                    isrc: "USUM71700003".into(),
                    track_name: "Found".into(),
                    artist_name: "A".into(),
                },
                TrackQuery {
                    isrc: "ZZZZ99999999".into(),
                    track_name: "Missing".into(),
                    artist_name: "B".into(),
                },
                TrackQuery {
                    isrc: String::new(),
                    track_name: "No ISRC".into(),
                    artist_name: "C".into(),
                },
            ],
        );
        assert!(results[0].exists);
        assert!(!results[1].exists);
        assert!(!results[2].exists);
    }
}

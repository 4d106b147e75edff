//! Generation-based script artifact store.
//!
//! A generation is the immutable result of one config load. Readers grab an
//! `Arc` to the current generation and never observe a half-applied reload;
//! publishing a new generation is a single pointer swap. Derived data
//! (plaintext jar bytes, parsed option lines) is cached keyed by generation
//! sequence number, so entries from an old generation can never satisfy a
//! lookup against the new one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use scriptcast_protocol::ScriptMetadata;
use tracing::info;

use crate::cache::SharedLru;
use crate::config::{self, LoadedGeneration, ScriptEntry};
use crate::error::{ConfigError, StoreError};

/// Plaintext jar bytes kept resident at once.
pub const BYTES_CACHE_CAPACITY: usize = 5;

#[derive(Debug)]
struct Generation {
    seq: u64,
    loaded: LoadedGeneration,
}

/// Shared artifact store. Cheap to clone via `Arc` at the call sites.
#[derive(Debug)]
pub struct ScriptStore {
    current: RwLock<Arc<Generation>>,
    next_seq: Mutex<u64>,
    bytes_cache: SharedLru<(u64, i32), Bytes>,
    /// Unbounded within a generation; option files are a few lines each.
    options_cache: Mutex<HashMap<(u64, i32), Arc<Vec<String>>>>,
}

impl ScriptStore {
    /// Loads the initial generation from `config_dir`.
    pub fn open(config_dir: &Path) -> Result<Self, ConfigError> {
        let loaded = config::load_generation(config_dir)?;
        info!(scripts = loaded.scripts.len(), "loaded initial generation");
        Ok(Self {
            current: RwLock::new(Arc::new(Generation { seq: 0, loaded })),
            next_seq: Mutex::new(1),
            bytes_cache: SharedLru::new(BYTES_CACHE_CAPACITY),
            options_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Re-reads `config_dir` and publishes the result atomically. On any
    /// file-level error the current generation stays live and untouched.
    /// Returns the number of scripts in the new generation.
    pub fn reload(&self, config_dir: &Path) -> Result<usize, ConfigError> {
        let loaded = config::load_generation(config_dir)?;
        let count = loaded.scripts.len();

        let seq = {
            let mut next = self.next_seq.lock();
            let seq = *next;
            *next += 1;
            seq
        };
        *self.current.write() = Arc::new(Generation { seq, loaded });

        // Stale entries are unreachable already (keys carry the sequence);
        // clearing just releases their memory promptly.
        self.bytes_cache.clear();
        self.options_cache.lock().clear();

        info!(seq, scripts = count, "published new generation");
        Ok(count)
    }

    pub fn server_url(&self) -> String {
        self.current.read().loaded.server_url.clone()
    }

    pub fn revision_data(&self) -> String {
        self.current.read().loaded.revision_data.clone()
    }

    /// Metadata for every script, in id order.
    pub fn list_metadata(&self) -> Vec<ScriptMetadata> {
        self.current
            .read()
            .loaded
            .scripts
            .iter()
            .map(|s| s.metadata.clone())
            .collect()
    }

    pub fn metadata(&self, script_id: i32) -> Result<ScriptMetadata, StoreError> {
        let generation = self.current.read().clone();
        entry(&generation, script_id).map(|s| s.metadata.clone())
    }

    /// Script ids in the current generation, in id order.
    pub fn script_ids(&self) -> Vec<i32> {
        self.current
            .read()
            .loaded
            .scripts
            .iter()
            .map(|s| s.metadata.script_id)
            .collect()
    }

    /// Plaintext jar bytes, read lazily and kept in a small LRU.
    pub fn bytes(&self, script_id: i32) -> Result<Bytes, StoreError> {
        let generation = self.current.read().clone();
        let script = entry(&generation, script_id)?.clone();
        self.bytes_cache
            .get_or_try_insert_with((generation.seq, script_id), || {
                std::fs::read(&script.jar_path)
                    .map(Bytes::from)
                    .map_err(|e| StoreError::Io {
                        path: script.jar_path.clone(),
                        detail: e.to_string(),
                    })
            })
    }

    /// Raw option lines for a script, one `key=value` string per line.
    /// Blank lines are dropped; malformed lines are the caller's concern.
    /// Entries stay cached for the whole life of a generation.
    pub fn options(&self, script_id: i32) -> Result<Arc<Vec<String>>, StoreError> {
        let generation = self.current.read().clone();
        let script = entry(&generation, script_id)?.clone();
        let key = (generation.seq, script_id);
        if let Some(hit) = self.options_cache.lock().get(&key) {
            return Ok(hit.clone());
        }

        // File read happens outside the lock; a racing fill is harmless.
        let raw = std::fs::read_to_string(&script.option_path).map_err(|e| StoreError::Io {
            path: script.option_path.clone(),
            detail: e.to_string(),
        })?;
        let lines = Arc::new(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect::<Vec<String>>(),
        );
        self.options_cache.lock().insert(key, lines.clone());
        Ok(lines)
    }

    /// Sequence number of the current generation. Bumps on every reload.
    pub fn generation_seq(&self) -> u64 {
        self.current.read().seq
    }
}

fn entry(generation: &Generation, script_id: i32) -> Result<&ScriptEntry, StoreError> {
    generation
        .loaded
        .scripts
        .iter()
        .find(|s| s.metadata.script_id == script_id)
        .ok_or(StoreError::ArtifactNotFound(script_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testutil::{descriptor_json, seed_config, write};
    use tempfile::TempDir;

    #[test]
    fn serves_bytes_and_options() {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        let store = ScriptStore::open(dir.path()).unwrap();

        assert_eq!(store.list_metadata().len(), 1);
        assert_eq!(&store.bytes(0).unwrap()[..], b"jar-bytes-fisher");
        assert_eq!(
            store.options(0).unwrap().as_slice(),
            ["speed=3".to_string(), "mode=1".to_string()]
        );
    }

    #[test]
    fn unknown_id_is_a_typed_miss() {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        let store = ScriptStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.bytes(99),
            Err(StoreError::ArtifactNotFound(99))
        ));
        assert!(matches!(
            store.metadata(-1),
            Err(StoreError::ArtifactNotFound(-1))
        ));
    }

    #[test]
    fn reload_publishes_new_generation() {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        let store = ScriptStore::open(dir.path()).unwrap();
        assert_eq!(store.generation_seq(), 0);

        // Prime the cache, then change the jar on disk.
        assert_eq!(&store.bytes(0).unwrap()[..], b"jar-bytes-fisher");
        write(dir.path(), "artifacts/fisher.jar", "jar-bytes-v2");

        // Unreloaded, the cached bytes still serve.
        assert_eq!(&store.bytes(0).unwrap()[..], b"jar-bytes-fisher");

        store.reload(dir.path()).unwrap();
        assert_eq!(store.generation_seq(), 1);
        assert_eq!(&store.bytes(0).unwrap()[..], b"jar-bytes-v2");
    }

    #[test]
    fn failed_reload_keeps_previous_generation() {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        let store = ScriptStore::open(dir.path()).unwrap();

        std::fs::remove_file(dir.path().join("revision.txt")).unwrap();
        assert!(store.reload(dir.path()).is_err());

        assert_eq!(store.generation_seq(), 0);
        assert_eq!(store.revision_data(), "rev-blob-1");
        assert_eq!(&store.bytes(0).unwrap()[..], b"jar-bytes-fisher");
    }

    #[test]
    fn options_stay_cached_for_a_whole_generation() {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        for i in 0..70 {
            write(dir.path(), &format!("artifacts/s{i:03}.jar"), "j");
            write(dir.path(), &format!("artifacts/s{i:03}.opts"), &format!("v={i}\n"));
            write(
                dir.path(),
                &format!("scripts/s{i:03}.json"),
                &descriptor_json(
                    &format!("S{i}"),
                    &format!("artifacts/s{i:03}.jar"),
                    &format!("artifacts/s{i:03}.opts"),
                ),
            );
        }
        let store = ScriptStore::open(dir.path()).unwrap();
        let ids = store.script_ids();
        assert_eq!(ids.len(), 71);
        for &id in &ids {
            store.options(id).unwrap();
        }

        // Rewrite every option file on disk. A cache that evicted any entry
        // would now serve the new contents for it.
        for i in 0..70 {
            write(dir.path(), &format!("artifacts/s{i:03}.opts"), "changed=0\n");
        }
        for &id in &ids {
            let options = store.options(id).unwrap();
            assert_ne!(options.as_slice(), ["changed=0".to_string()]);
        }
    }

    #[test]
    fn reload_drops_scripts_that_went_bad() {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        write(dir.path(), "artifacts/alpha.jar", "jar-a");
        write(dir.path(), "artifacts/alpha.opts", "x=1\n");
        write(
            dir.path(),
            "scripts/alpha.json",
            &descriptor_json("Alpha", "artifacts/alpha.jar", "artifacts/alpha.opts"),
        );
        let store = ScriptStore::open(dir.path()).unwrap();
        assert_eq!(store.list_metadata().len(), 2);

        std::fs::remove_file(dir.path().join("artifacts/alpha.jar")).unwrap();
        store.reload(dir.path()).unwrap();

        let names: Vec<String> = store
            .list_metadata()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Fisher Pro".to_string()]);
    }
}

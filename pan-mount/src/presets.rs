//! Persistent preset storage.
//!
//! Presets live in a single JSON object mapping slot numbers to microstep
//! positions, e.g. `{"1": 1200, "2": -400}`. Keys are strings on disk (JSON
//! has no integer keys) but are parsed into integers on load, so iteration
//! order is numeric: slot 100 comes before slot 900 regardless of how the
//! file was written.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

/// Slot number to position in microsteps, ordered by slot.
pub type PresetMap = BTreeMap<u32, i32>;

#[derive(Error, Debug)]
pub enum PresetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed preset file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type PresetResult<T> = Result<T, PresetError>;

/// JSON-file backed preset map.
///
/// Every read goes to disk, so edits made to the file by hand are picked up
/// without a restart. Writes replace the file atomically through a temporary
/// file in the same directory. [`update`](Self::update) serializes
/// read-modify-write cycles so concurrent learns never drop each other's slot.
#[derive(Debug)]
pub struct PresetStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PresetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty preset file if none exists yet.
    pub fn ensure_exists(&self) -> PresetResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.path.exists() {
            self.write(&PresetMap::new())?;
            info!("Created empty preset file {}", self.path.display());
        }
        Ok(())
    }

    /// Load every preset. A missing or blank file is an empty map.
    pub fn load_all(&self) -> PresetResult<PresetMap> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PresetMap::new()),
            Err(e) => return Err(e.into()),
        };

        if contents.trim().is_empty() {
            return Ok(PresetMap::new());
        }

        serde_json::from_str(&contents).map_err(|source| PresetError::Format {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the whole preset file with `presets`.
    pub fn save_all(&self, presets: &PresetMap) -> PresetResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(presets)
    }

    /// Position stored in `slot`, if any.
    pub fn get(&self, slot: u32) -> PresetResult<Option<i32>> {
        Ok(self.load_all()?.get(&slot).copied())
    }

    /// Load, modify and save in one step, holding the write lock throughout.
    ///
    /// The file is only rewritten when `f` returns; an error while loading
    /// leaves it untouched.
    pub fn update<R>(&self, f: impl FnOnce(&mut PresetMap) -> R) -> PresetResult<R> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut presets = self.load_all()?;
        let result = f(&mut presets);
        self.write(&presets)?;
        Ok(result)
    }

    fn write(&self, presets: &PresetMap) -> PresetResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(presets).map_err(|source| PresetError::Format {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!("Wrote {} presets to {}", presets.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, PresetStore) {
        let dir = TempDir::new().unwrap();
        let store = PresetStore::new(dir.path().join("presets.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, store) = create_test_store();
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(store.get(1).unwrap(), None);
    }

    #[test]
    fn test_ensure_exists_creates_empty_object() {
        let (_dir, store) = create_test_store();
        store.ensure_exists().unwrap();

        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.trim(), "{}");
    }

    #[test]
    fn test_ensure_exists_keeps_existing_presets() {
        let (_dir, store) = create_test_store();
        store.update(|p| p.insert(3, 77)).unwrap();
        store.ensure_exists().unwrap();
        assert_eq!(store.get(3).unwrap(), Some(77));
    }

    #[test]
    fn test_keys_are_strings_on_disk() {
        let (_dir, store) = create_test_store();
        store.save_all(&PresetMap::from([(1, 1200), (2, -400)])).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["1"], 1200);
        assert_eq!(raw["2"], -400);
    }

    #[test]
    fn test_numeric_order_from_hand_written_file() {
        let (_dir, store) = create_test_store();
        std::fs::write(store.path(), r#"{"10": 900, "1": 100, "2": 500}"#).unwrap();

        let positions: Vec<i32> = store.load_all().unwrap().into_values().collect();
        assert_eq!(positions, vec![100, 500, 900]);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let (_dir, store) = create_test_store();
        std::fs::write(store.path(), "not json").unwrap();
        assert!(matches!(store.load_all(), Err(PresetError::Format { .. })));
    }

    #[test]
    fn test_update_returns_closure_result() {
        let (_dir, store) = create_test_store();
        assert_eq!(store.update(|p| p.insert(4, 10)).unwrap(), None);
        assert_eq!(store.update(|p| p.insert(4, 20)).unwrap(), Some(10));
        assert_eq!(store.update(|p| p.remove(&4)).unwrap(), Some(20));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_updates_keep_every_slot() {
        let (_dir, store) = create_test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16u32)
            .map(|slot| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.update(|p| p.insert(slot, slot as i32 * 10)).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let presets = store.load_all().unwrap();
        assert_eq!(presets.len(), 16);
        assert_eq!(presets[&7], 70);
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = PresetStore::new(dir.path().join("nested").join("presets.json"));
        store.save_all(&PresetMap::from([(1, 5)])).unwrap();
        assert_eq!(store.get(1).unwrap(), Some(5));
    }
}

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, Stage};
use crate::error::KiraError;
use crate::fs_util;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub dataset_id: DatasetId,
    pub stage: Stage,
}

impl CacheKey {
    pub fn new(dataset_id: &DatasetId, stage: Stage) -> Self {
        Self {
            dataset_id: dataset_id.clone(),
            stage,
        }
    }
}

/// Keyed persistence for stage artifacts.
///
/// `put` must be all-or-nothing: a reader never observes a partially
/// written artifact.
pub trait ArtifactStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, KiraError>;
    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), KiraError>;
    fn remove(&self, key: &CacheKey) -> Result<(), KiraError>;
}

/// On-disk layout rooted at the cache directory:
///
/// ```text
/// <root>/<dataset>/raw/         downloaded family and supplementary files
/// <root>/<dataset>/artifacts/   <stage>.json
/// <root>/<dataset>/output/      correlation tables
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, KiraError> {
        Ok(Self::new_with_root(default_cache_root()?))
    }

    pub fn new_with_root(cache_root: Utf8PathBuf) -> Self {
        Self { cache_root }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn dataset_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.cache_root.join(id.as_str())
    }

    pub fn raw_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.dataset_dir(id).join("raw")
    }

    pub fn raw_path(&self, id: &DatasetId, file: &str) -> Utf8PathBuf {
        self.raw_dir(id).join(file)
    }

    pub fn artifact_path(&self, key: &CacheKey) -> Utf8PathBuf {
        self.dataset_dir(&key.dataset_id)
            .join("artifacts")
            .join(format!("{}.json", key.stage))
    }

    pub fn output_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.dataset_dir(id).join("output")
    }

    pub fn correlation_table_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.output_dir(id).join(format!("{id}_correlation.csv"))
    }

    pub fn significant_table_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.output_dir(id).join(format!("{id}_significant.csv"))
    }

    pub fn marker_table_path(&self, id: &DatasetId) -> Utf8PathBuf {
        self.output_dir(id).join(format!("{id}_markers.csv"))
    }

    pub fn ensure_dataset_dirs(&self, id: &DatasetId) -> Result<(), KiraError> {
        for dir in [self.raw_dir(id), self.output_dir(id)] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Removes derived artifacts and outputs; downloads are kept unless
    /// `include_raw` is set.
    pub fn clear_dataset(&self, id: &DatasetId, include_raw: bool) -> Result<(), KiraError> {
        let dataset_dir = self.dataset_dir(id);
        let targets = if include_raw {
            vec![dataset_dir]
        } else {
            vec![dataset_dir.join("artifacts"), self.output_dir(id)]
        };
        for target in targets {
            match fs::remove_dir_all(target.as_std_path()) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(KiraError::Filesystem(err.to_string())),
            }
        }
        Ok(())
    }
}

impl ArtifactStore for Store {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, KiraError> {
        match fs::read(self.artifact_path(key).as_std_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(KiraError::Filesystem(err.to_string())),
        }
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), KiraError> {
        fs_util::write_atomic(self.artifact_path(key).as_std_path(), bytes)
    }

    fn remove(&self, key: &CacheKey) -> Result<(), KiraError> {
        fs_util::remove_if_exists(self.artifact_path(key).as_std_path())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.entries.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }
}

impl ArtifactStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, KiraError> {
        let map = self
            .entries
            .lock()
            .map_err(|_| KiraError::Filesystem("artifact store poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), KiraError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| KiraError::Filesystem("artifact store poisoned".to_string()))?;
        map.insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), KiraError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| KiraError::Filesystem("artifact store poisoned".to_string()))?;
        map.remove(key);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    dataset_id: String,
    stage: Stage,
    fingerprint: String,
    created_at: String,
    tool: String,
    payload: T,
}

#[derive(Debug)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    /// Present but unusable; carries a `CacheCorruption` error describing why.
    Invalid(KiraError),
}

/// Reads and validates a typed artifact. Decoding failures, key mismatches
/// and fingerprint changes all come back as [`Lookup::Invalid`].
pub fn load_artifact<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &CacheKey,
    fingerprint: &str,
) -> Result<Lookup<T>, KiraError> {
    let Some(bytes) = store.get(key)? else {
        return Ok(Lookup::Miss);
    };
    let invalid = |message: String| {
        Lookup::Invalid(KiraError::CacheCorruption {
            dataset_id: key.dataset_id.to_string(),
            stage: key.stage,
            message,
        })
    };
    let envelope: Envelope<T> = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(err) => return Ok(invalid(format!("undecodable: {err}"))),
    };
    if envelope.format_version != ARTIFACT_FORMAT_VERSION {
        return Ok(invalid(format!(
            "format version {} (expected {ARTIFACT_FORMAT_VERSION})",
            envelope.format_version
        )));
    }
    if envelope.dataset_id != key.dataset_id.as_str() || envelope.stage != key.stage {
        return Ok(invalid(format!(
            "entry belongs to {}/{}",
            envelope.dataset_id, envelope.stage
        )));
    }
    if envelope.fingerprint != fingerprint {
        return Ok(invalid("inputs changed since it was written".to_string()));
    }
    Ok(Lookup::Hit(envelope.payload))
}

pub fn save_artifact<T: Serialize>(
    store: &dyn ArtifactStore,
    key: &CacheKey,
    fingerprint: &str,
    payload: &T,
) -> Result<(), KiraError> {
    let envelope = Envelope {
        format_version: ARTIFACT_FORMAT_VERSION,
        dataset_id: key.dataset_id.to_string(),
        stage: key.stage,
        fingerprint: fingerprint.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        tool: format!("kira-cx/{}", env!("CARGO_PKG_VERSION")),
        payload,
    };
    let bytes =
        serde_json::to_vec(&envelope).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    store.put(key, &bytes)
}

pub fn default_cache_root() -> Result<Utf8PathBuf, KiraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-coexpression"))
                .ok()
        })
        .ok_or_else(|| KiraError::Filesystem("unable to resolve cache directory".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn key(stage: Stage) -> CacheKey {
        CacheKey::new(&"GSE100".parse().unwrap(), stage)
    }

    fn temp_store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, Store::new_with_root(root))
    }

    #[test]
    fn layout_paths() {
        let (_temp, store) = temp_store();
        let id: DatasetId = "GSE100".parse().unwrap();
        assert!(store.raw_path(&id, "x.txt.gz").ends_with("GSE100/raw/x.txt.gz"));
        assert!(
            store
                .artifact_path(&key(Stage::Align))
                .ends_with("GSE100/artifacts/align.json")
        );
        assert!(
            store
                .correlation_table_path(&id)
                .ends_with("GSE100/output/GSE100_correlation.csv")
        );
    }

    #[test]
    fn typed_round_trip_on_disk() {
        let (_temp, store) = temp_store();
        let key = key(Stage::Correlate);
        save_artifact(&store, &key, "fp", &vec![1u32, 2, 3]).unwrap();
        assert_matches!(
            load_artifact::<Vec<u32>>(&store, &key, "fp").unwrap(),
            Lookup::Hit(values) if values == vec![1, 2, 3]
        );
    }

    #[test]
    fn missing_artifact_is_a_miss() {
        let store = MemoryStore::default();
        assert_matches!(
            load_artifact::<Vec<u32>>(&store, &key(Stage::Load), "fp").unwrap(),
            Lookup::Miss
        );
    }

    #[test]
    fn truncated_artifact_is_invalid() {
        let (_temp, store) = temp_store();
        let key = key(Stage::Load);
        save_artifact(&store, &key, "fp", &vec![1u32, 2, 3]).unwrap();
        let path = store.artifact_path(&key);
        let bytes = fs::read(path.as_std_path()).unwrap();
        fs::write(path.as_std_path(), &bytes[..bytes.len() / 2]).unwrap();
        assert_matches!(
            load_artifact::<Vec<u32>>(&store, &key, "fp").unwrap(),
            Lookup::Invalid(KiraError::CacheCorruption { stage: Stage::Load, .. })
        );
    }

    #[test]
    fn fingerprint_change_invalidates() {
        let store = MemoryStore::default();
        let key = key(Stage::Correlate);
        save_artifact(&store, &key, "target=GeneA", &1u32).unwrap();
        assert_matches!(
            load_artifact::<u32>(&store, &key, "target=GeneB").unwrap(),
            Lookup::Invalid(_)
        );
    }

    #[test]
    fn artifact_under_wrong_key_is_invalid() {
        let store = MemoryStore::default();
        save_artifact(&store, &key(Stage::Align), "fp", &1u32).unwrap();
        let bytes = store.get(&key(Stage::Align)).unwrap().unwrap();
        store.put(&key(Stage::Correlate), &bytes).unwrap();
        assert_matches!(
            load_artifact::<u32>(&store, &key(Stage::Correlate), "fp").unwrap(),
            Lookup::Invalid(_)
        );
    }

    #[test]
    fn clear_keeps_raw_downloads() {
        let (_temp, store) = temp_store();
        let id: DatasetId = "GSE100".parse().unwrap();
        store.ensure_dataset_dirs(&id).unwrap();
        let raw = store.raw_path(&id, "GSE100_family.soft.gz");
        fs::write(raw.as_std_path(), b"x").unwrap();
        save_artifact(&store, &key(Stage::Fetch), "fp", &1u32).unwrap();

        store.clear_dataset(&id, false).unwrap();
        assert!(raw.as_std_path().exists());
        assert!(store.get(&key(Stage::Fetch)).unwrap().is_none());

        store.clear_dataset(&id, true).unwrap();
        assert!(!store.dataset_dir(&id).as_std_path().exists());
    }
}

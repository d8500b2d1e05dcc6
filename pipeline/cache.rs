//! Content-addressed cache of stage artifacts.
//!
//! A stage artifact (reference model, selection result, projected submodel) is
//! stored as TOML under a key that hashes everything the stage depends on: the
//! stage name and artifact format version, a fingerprint of the model data,
//! the stage's own configuration, the seed and the key of the upstream
//! artifact. A changed input therefore always misses, and a stale entry is
//! never returned. TOML writes every `f64` in its shortest round-trip form, so
//! a decoded artifact is bit-identical to the one that was stored.

use crate::data::ModelFrame;
use ahash::AHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Bumped whenever the layout of a cached artifact changes.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode an artifact as TOML: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    stage: &'static str,
    digest: String,
}

impl CacheKey {
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}.toml", self.stage, self.digest)
    }
}

/// Incrementally hashes the inputs of one stage.
pub struct CacheKeyBuilder {
    stage: &'static str,
    hasher: Sha256,
}

impl CacheKeyBuilder {
    pub fn new(stage: &'static str) -> Self {
        let mut builder = Self {
            stage,
            hasher: Sha256::new(),
        };
        builder.field("stage", stage.as_bytes());
        builder.field("format", &ARTIFACT_FORMAT_VERSION.to_le_bytes());
        builder
    }

    /// Length-prefixed so that adjacent fields cannot alias each other.
    fn field(&mut self, name: &str, bytes: &[u8]) {
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    pub fn with_bytes(mut self, name: &str, bytes: &[u8]) -> Self {
        self.field(name, bytes);
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.with_bytes("seed", &seed.to_le_bytes())
    }

    /// Hashes the TOML rendering of a configuration section.
    pub fn with_config<T: Serialize>(self, name: &str, config: &T) -> Result<Self, CacheError> {
        let rendered = toml::to_string(config)?;
        Ok(self.with_bytes(name, rendered.as_bytes()))
    }

    pub fn with_upstream(self, upstream: &CacheKey) -> Self {
        self.with_bytes(upstream.stage, upstream.digest.as_bytes())
    }

    pub fn finish(self) -> CacheKey {
        CacheKey {
            stage: self.stage,
            digest: hex::encode(self.hasher.finalize()),
        }
    }
}

/// Hex SHA-256 of the feature names, design matrix and outcome of a frame.
pub fn data_fingerprint(frame: &ModelFrame) -> String {
    let mut hasher = Sha256::new();
    for name in &frame.feature_names {
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
    }
    hasher.update((frame.x.nrows() as u64).to_le_bytes());
    hasher.update((frame.x.ncols() as u64).to_le_bytes());
    for value in frame.x.iter().chain(frame.y.iter()) {
        hasher.update(value.to_bits().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Storage backend for serialized artifacts.
pub trait ArtifactCache: Sync {
    fn get(&self, key: &CacheKey) -> Option<String>;
    fn put(&self, key: &CacheKey, payload: &str) -> Result<(), CacheError>;
}

/// One TOML file per key inside a directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl ArtifactCache for DiskCache {
    fn get(&self, key: &CacheKey) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn put(&self, key: &CacheKey, payload: &str) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let partial = path.with_extension("toml.partial");
        fs::write(&partial, payload)?;
        fs::rename(&partial, &path)?;
        Ok(())
    }
}

/// In-process cache, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<AHashMap<CacheKey, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn put(&self, key: &CacheKey, payload: &str) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone(), payload.to_string());
        Ok(())
    }
}

/// Never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ArtifactCache for NoCache {
    fn get(&self, _: &CacheKey) -> Option<String> {
        None
    }

    fn put(&self, _: &CacheKey, _: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Returns the cached artifact for `key`, or computes and stores it.
///
/// The flag is `true` on a cache hit. An entry that fails to decode is logged
/// and recomputed; a failed write is logged and the fresh value returned.
pub fn load_or_compute<T, C, E, F>(cache: &C, key: &CacheKey, compute: F) -> Result<(T, bool), E>
where
    T: Serialize + DeserializeOwned,
    C: ArtifactCache + ?Sized,
    E: From<CacheError>,
    F: FnOnce() -> Result<T, E>,
{
    if let Some(payload) = cache.get(key) {
        match toml::from_str::<T>(&payload) {
            Ok(value) => {
                log::info!("Cache hit for stage '{}' ({}).", key.stage, &key.digest[..12]);
                return Ok((value, true));
            }
            Err(e) => log::warn!(
                "Cached artifact for stage '{}' could not be decoded ({e}); recomputing.",
                key.stage
            ),
        }
    }
    let value = compute()?;
    let payload = toml::to_string(&value).map_err(CacheError::from)?;
    if let Err(e) = cache.put(key, &payload) {
        log::warn!("Could not store the '{}' artifact: {e}", key.stage);
    }
    Ok((value, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Artifact {
        label: String,
        values: Array2<f64>,
    }

    fn artifact() -> Artifact {
        Artifact {
            label: "draws".to_string(),
            values: array![[0.1, 1.0 / 3.0], [-2.5e-17, f64::INFINITY]],
        }
    }

    fn frame(shift: f64) -> ModelFrame {
        ModelFrame {
            feature_names: vec!["a".to_string()],
            x: array![[1.0], [2.0 + shift]],
            y: array![0.0, 1.0],
            rows: vec![0, 1],
            dropped: 0,
        }
    }

    #[test]
    fn keys_depend_on_every_input() {
        let base = || CacheKeyBuilder::new("fit").with_bytes("data", b"abc").with_seed(1);
        assert_eq!(base().finish(), base().finish());
        assert_ne!(base().finish(), base().with_seed(2).finish());
        assert_ne!(
            base().finish(),
            CacheKeyBuilder::new("fit").with_bytes("data", b"abd").with_seed(1).finish()
        );
        assert_ne!(
            base().finish().digest(),
            CacheKeyBuilder::new("select").with_bytes("data", b"abc").with_seed(1).finish().digest()
        );
        assert_ne!(data_fingerprint(&frame(0.0)), data_fingerprint(&frame(1e-12)));
    }

    #[test]
    fn memory_cache_round_trips_bit_identical_floats() {
        let cache = MemoryCache::new();
        let key = CacheKeyBuilder::new("fit").finish();
        let mut calls = 0;
        let (first, hit) = load_or_compute::<_, _, CacheError, _>(&cache, &key, || {
            calls += 1;
            Ok(artifact())
        })
        .unwrap();
        assert!(!hit);
        let (second, hit) =
            load_or_compute::<Artifact, _, CacheError, _>(&cache, &key, || Ok(artifact())).unwrap();
        assert!(hit);
        assert_eq!(calls, 1);
        assert_eq!(first, second);
        for (a, b) in first.values.iter().zip(second.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn disk_cache_persists_and_recovers_from_corruption() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).unwrap();
        let key = CacheKeyBuilder::new("project").with_seed(4).finish();
        load_or_compute::<_, _, CacheError, _>(&cache, &key, || Ok(artifact())).unwrap();
        assert!(cache.path_for(&key).exists());

        fs::write(cache.path_for(&key), "not = [valid").unwrap();
        let (value, hit) =
            load_or_compute::<Artifact, _, CacheError, _>(&cache, &key, || Ok(artifact())).unwrap();
        assert!(!hit);
        assert_eq!(value, artifact());
        let (_, hit) =
            load_or_compute::<Artifact, _, CacheError, _>(&cache, &key, || Ok(artifact())).unwrap();
        assert!(hit);
    }

    #[test]
    fn no_cache_always_recomputes() {
        let key = CacheKeyBuilder::new("fit").finish();
        for _ in 0..2 {
            let (_, hit) =
                load_or_compute::<Artifact, _, CacheError, _>(&NoCache, &key, || Ok(artifact()))
                    .unwrap();
            assert!(!hit);
        }
    }
}

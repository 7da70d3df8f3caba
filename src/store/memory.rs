// src/store/memory.rs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use super::{Artifact, ArtifactStore, Bucket, checksum, unavailable, validate_key};
use crate::errors::Result;

#[derive(Debug, Clone)]
struct StoredVersion {
    artifact: Artifact,
    bytes: Vec<u8>,
}

type Objects = BTreeMap<(Bucket, String), Vec<StoredVersion>>;

/// In-process versioned store.
///
/// Cloning shares the underlying objects, so one instance can be handed to
/// every node of a single-process pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<Objects>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every version of `key`, oldest first.
    pub fn versions(&self, bucket: Bucket, key: &str) -> Vec<Artifact> {
        self.lock()
            .get(&(bucket, key.to_string()))
            .map(|versions| versions.iter().map(|v| v.artifact.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ArtifactStore for MemoryStore {
    fn get(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>> {
        self.lock()
            .get(&(bucket, key.to_string()))
            .and_then(|versions| versions.last())
            .map(|v| v.bytes.clone())
            .ok_or_else(|| unavailable(bucket, key, "no such key"))
    }

    fn get_version(&self, bucket: Bucket, key: &str, version: u64) -> Result<Vec<u8>> {
        self.lock()
            .get(&(bucket, key.to_string()))
            .and_then(|versions| versions.iter().find(|v| v.artifact.version == version))
            .map(|v| v.bytes.clone())
            .ok_or_else(|| unavailable(bucket, key, format!("no version {version}")))
    }

    fn head(&self, bucket: Bucket, key: &str) -> Result<Option<Artifact>> {
        Ok(self
            .lock()
            .get(&(bucket, key.to_string()))
            .and_then(|versions| versions.last())
            .map(|v| v.artifact.clone()))
    }

    fn put(&self, bucket: Bucket, key: &str, bytes: &[u8], produced_by: &str) -> Result<Artifact> {
        validate_key(bucket, key)?;

        let mut objects = self.lock();
        let versions = objects.entry((bucket, key.to_string())).or_default();
        let artifact = Artifact {
            bucket,
            key: key.to_string(),
            version: versions.len() as u64 + 1,
            produced_by: produced_by.to_string(),
            checksum: checksum(bytes),
            written_at: Utc::now(),
        };
        versions.push(StoredVersion {
            artifact: artifact.clone(),
            bytes: bytes.to_vec(),
        });
        Ok(artifact)
    }

    fn list(&self, bucket: Bucket, prefix: &str) -> Result<Vec<Artifact>> {
        Ok(self
            .lock()
            .iter()
            .filter(|((b, key), _)| *b == bucket && key.starts_with(prefix))
            .filter_map(|(_, versions)| versions.last().map(|v| v.artifact.clone()))
            .collect())
    }
}

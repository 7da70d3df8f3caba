// src/store/mod.rs

//! Artifact store abstraction.
//!
//! Jobs fetch their code and inputs from, and persist their outputs to, a
//! versioned object store. The backing store is external; the crate only
//! depends on three properties of it:
//! - every write creates a new retrievable version,
//! - access is restricted to authorised principals (handled by the environment),
//! - reads after a write to the same key observe that write.
//!
//! - [`memory`] is an in-process versioned store used for single-process
//!   orchestration and tests.
//! - [`fs`] keeps versions in a local directory tree.
//! - [`layout`] derives the keys both stages agree on.

pub mod fs;
pub mod layout;
pub mod memory;

use std::fmt::{self, Debug};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{BatchrelayError, Result};

pub use fs::FsStore;
pub use layout::ArtifactLayout;
pub use memory::MemoryStore;

/// Logical bucket. Physical names come from `[store]` in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// Input configuration, collected raw data and the collect stage's code.
    Raw,
    /// Process stage code, result cache, final table and rendered report.
    Processed,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Raw => "raw",
            Bucket::Processed => "processed",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored version of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub bucket: Bucket,
    pub key: String,
    /// Monotonic per key, starting at 1.
    pub version: u64,
    /// Who wrote it, usually `<stage>:<correlation id>`.
    pub produced_by: String,
    /// blake3 digest of the content, hex encoded.
    pub checksum: String,
    pub written_at: DateTime<Utc>,
}

/// Read/write contract to a versioned object store.
pub trait ArtifactStore: Send + Sync + Debug {
    /// Latest version of `key`.
    fn get(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>>;

    /// A specific version of `key`.
    fn get_version(&self, bucket: Bucket, key: &str, version: u64) -> Result<Vec<u8>>;

    /// Metadata of the latest version, if the key exists.
    fn head(&self, bucket: Bucket, key: &str) -> Result<Option<Artifact>>;

    /// Write a new version of `key`.
    fn put(&self, bucket: Bucket, key: &str, bytes: &[u8], produced_by: &str) -> Result<Artifact>;

    /// Latest version of every key starting with `prefix`, sorted by key.
    fn list(&self, bucket: Bucket, prefix: &str) -> Result<Vec<Artifact>>;

    /// Materialise every object under `prefix` into `dest`, keeping the key
    /// path below the prefix. Returns the written local paths.
    fn sync(&self, bucket: Bucket, prefix: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        let mut materialized = Vec::new();

        let prefix = prefix.trim_end_matches('/');
        for artifact in self.list(bucket, prefix)? {
            // `jobs/collect` covers `jobs/collect/run.sh`, not `jobs/collect-old/...`.
            let Some(relative) = key_below(&artifact.key, prefix) else {
                continue;
            };

            if relative.is_empty() || !is_plain_relative(relative) {
                warn!(
                    bucket = %bucket,
                    key = %artifact.key,
                    "skipping object whose key cannot be materialised below the destination"
                );
                continue;
            }

            let bytes = self.get_version(bucket, &artifact.key, artifact.version)?;
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &bytes)?;
            debug!(
                bucket = %bucket,
                key = %artifact.key,
                version = artifact.version,
                path = %target.display(),
                "materialised object"
            );
            materialized.push(target);
        }

        Ok(materialized)
    }
}

/// Path of `key` relative to the directory-like `prefix`, or `None` when the
/// key is not below it.
fn key_below<'k>(key: &'k str, prefix: &str) -> Option<&'k str> {
    if prefix.is_empty() {
        return Some(key);
    }
    key.strip_prefix(prefix)?.strip_prefix('/')
}

/// blake3 hex digest used as the artifact checksum.
pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub(crate) fn unavailable(bucket: Bucket, key: &str, reason: impl Into<String>) -> BatchrelayError {
    BatchrelayError::ArtifactUnavailable {
        bucket: bucket.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Keys are `/`-separated, relative, and never contain `.`/`..` or empty
/// segments.
pub(crate) fn validate_key(bucket: Bucket, key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(unavailable(bucket, key, "invalid object key"));
    }
    if key
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg == fs::VERSIONS_DIR)
    {
        return Err(unavailable(bucket, key, "invalid object key segment"));
    }
    Ok(())
}

fn is_plain_relative(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

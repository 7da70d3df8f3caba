// src/store/fs.rs

//! Versioned store on the local filesystem.
//!
//! Layout: `<root>/<bucket name>/<key>/.versions/<n>` holds the bytes of
//! version `n` and `<n>.meta` its JSON metadata. The metadata file is written
//! last, so a version only becomes visible once its content is complete.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use super::{Artifact, ArtifactStore, Bucket, checksum, unavailable, validate_key};
use crate::config::ConfigFile;
use crate::errors::Result;

pub(crate) const VERSIONS_DIR: &str = ".versions";

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    raw_name: String,
    processed_name: String,
}

impl FsStore {
    pub fn new(
        root: impl Into<PathBuf>,
        raw_name: impl Into<String>,
        processed_name: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            raw_name: raw_name.into(),
            processed_name: processed_name.into(),
        }
    }

    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self::new(
            cfg.store.root.clone(),
            cfg.store.raw_bucket.clone(),
            cfg.store.processed_bucket.clone(),
        )
    }

    fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        match bucket {
            Bucket::Raw => self.root.join(&self.raw_name),
            Bucket::Processed => self.root.join(&self.processed_name),
        }
    }

    fn versions_dir(&self, bucket: Bucket, key: &str) -> PathBuf {
        let mut dir = self.bucket_dir(bucket);
        for seg in key.split('/') {
            dir.push(seg);
        }
        dir.join(VERSIONS_DIR)
    }

    fn latest_version(&self, bucket: Bucket, key: &str) -> Result<Option<u64>> {
        let dir = self.versions_dir(bucket, key);
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut latest = None;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(n) = name.strip_suffix(".meta").and_then(|n| n.parse::<u64>().ok()) {
                latest = latest.max(Some(n));
            }
        }
        Ok(latest)
    }

    fn read_meta(&self, bucket: Bucket, key: &str, version: u64) -> Result<Artifact> {
        let path = self.versions_dir(bucket, key).join(format!("{version}.meta"));
        let contents = fs::read_to_string(&path)
            .map_err(|e| unavailable(bucket, key, format!("reading metadata: {e}")))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || entry.file_name() == VERSIONS_DIR {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            if entry.path().join(VERSIONS_DIR).is_dir() {
                out.push(key.clone());
            }
            self.collect_keys(&entry.path(), &key, out)?;
        }
        Ok(())
    }
}

impl ArtifactStore for FsStore {
    fn get(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>> {
        validate_key(bucket, key)?;
        match self.latest_version(bucket, key)? {
            Some(version) => self.get_version(bucket, key, version),
            None => Err(unavailable(bucket, key, "no such key")),
        }
    }

    fn get_version(&self, bucket: Bucket, key: &str, version: u64) -> Result<Vec<u8>> {
        validate_key(bucket, key)?;
        let path = self.versions_dir(bucket, key).join(version.to_string());
        fs::read(&path).map_err(|e| unavailable(bucket, key, format!("version {version}: {e}")))
    }

    fn head(&self, bucket: Bucket, key: &str) -> Result<Option<Artifact>> {
        validate_key(bucket, key)?;
        match self.latest_version(bucket, key)? {
            Some(version) => self.read_meta(bucket, key, version).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, bucket: Bucket, key: &str, bytes: &[u8], produced_by: &str) -> Result<Artifact> {
        validate_key(bucket, key)?;

        let dir = self.versions_dir(bucket, key);
        fs::create_dir_all(&dir)?;

        let version = self.latest_version(bucket, key)?.unwrap_or(0) + 1;
        let artifact = Artifact {
            bucket,
            key: key.to_string(),
            version,
            produced_by: produced_by.to_string(),
            checksum: checksum(bytes),
            written_at: Utc::now(),
        };

        fs::write(dir.join(version.to_string()), bytes)?;
        fs::write(
            dir.join(format!("{version}.meta")),
            serde_json::to_vec_pretty(&artifact)?,
        )?;

        debug!(bucket = %bucket, key, version, "stored new object version");
        Ok(artifact)
    }

    fn list(&self, bucket: Bucket, prefix: &str) -> Result<Vec<Artifact>> {
        let root = self.bucket_dir(bucket);
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        self.collect_keys(&root, "", &mut keys)?;
        keys.sort();

        let mut artifacts = Vec::new();
        for key in keys.into_iter().filter(|k| k.starts_with(prefix)) {
            if let Some(artifact) = self.head(bucket, &key)? {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }
}

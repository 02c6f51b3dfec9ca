//! Local-directory object store.
//!
//! Maps keys onto files under a root directory. This is the copy-file
//! transfer mode (network drives) and the backend engine tests run
//! against. ETags are MD5 digests, matching what S3 reports for
//! single-part objects.

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use tracing::debug;

use studiosync_common::{Error, ObjectKey, Result};

use crate::provider::{read_with_backoff, ObjectStore, RemoteObject};

/// Object store over a plain directory tree.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for component in key.split('/') {
            path.push(component);
        }
        path
    }

    fn collect(&self, dir: &Path, base: &str, out: &mut Vec<RemoteObject>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_key = if base.is_empty() { name.clone() } else { format!("{}/{}", base, name) };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &child_key, out)?;
            } else {
                let data = std::fs::read(entry.path())?;
                out.push(RemoteObject {
                    key: ObjectKey::new(&child_key)?,
                    etag: hex::encode(Md5::digest(&data)),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    fn name(&self) -> &str {
        "dir"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let prefix_dir = self.path_for(prefix.trim_end_matches('/'));
        if !prefix_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        self.collect(&prefix_dir, prefix.trim_end_matches('/'), &mut objects)?;
        debug!(prefix, count = objects.len(), "listed directory objects");
        Ok(objects)
    }

    async fn upload(&self, local: &Path, key: &ObjectKey) -> Result<()> {
        let data = read_with_backoff(local).await?;
        let target = self.path_for(key.as_str());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, data).await?;
        Ok(())
    }

    async fn download(&self, key: &ObjectKey, local: &Path) -> Result<()> {
        let source = self.path_for(key.as_str());
        let data = tokio::fs::read(&source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("no object at {}", key))
            } else {
                e.into()
            }
        })?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    async fn copy(&self, src: &ObjectKey, dst: &ObjectKey) -> Result<()> {
        let target = self.path_for(dst.as_str());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.path_for(src.as_str()), target).await?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        tokio::fs::remove_file(self.path_for(key.as_str())).await?;
        Ok(())
    }
}

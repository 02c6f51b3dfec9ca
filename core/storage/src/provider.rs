//! Object-store trait definition.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use studiosync_common::{ObjectKey, Result};

/// One object in a bucket listing.
///
/// The ETag doubles as the remote content hash: for single-part uploads it
/// equals the MD5 digest the local hasher produces, which is what makes the
/// manifest diff work without downloading anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: ObjectKey,
    pub etag: String,
}

/// Keyed-blob storage under a bucket.
///
/// Pagination is handled inside `list`; callers always see the full set for
/// a prefix. Transient remote errors are the caller's problem; local
/// permission hiccups on reads are retried here (see [`read_with_backoff`]).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name for logs (e.g. "s3", "dir", "noop").
    fn name(&self) -> &str;

    /// List every object under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Upload a local file to `key`.
    ///
    /// # Postconditions
    /// - The object exists remotely before this returns; the local file is
    ///   never deleted or moved by this call.
    async fn upload(&self, local: &Path, key: &ObjectKey) -> Result<()>;

    /// Download `key` to a local path, creating parent directories.
    async fn download(&self, key: &ObjectKey, local: &Path) -> Result<()>;

    /// Server-side copy.
    async fn copy(&self, src: &ObjectKey, dst: &ObjectKey) -> Result<()>;

    /// Delete one object.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Read a local file, retrying permission errors with linear backoff.
///
/// DAWs briefly hold exclusive handles on session files while saving; a
/// permission failure usually clears within a few hundred milliseconds.
/// Six attempts, 250 ms apart.
pub async fn read_with_backoff(path: &Path) -> Result<Vec<u8>> {
    const ATTEMPTS: u32 = 6;
    const STEP: Duration = Duration::from_millis(250);

    let mut attempt = 1;
    loop {
        match tokio::fs::read(path).await {
            Ok(data) => return Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && attempt < ATTEMPTS => {
                warn!(path = %path.display(), attempt, "read denied, backing off");
                tokio::time::sleep(STEP * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

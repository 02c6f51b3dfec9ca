//! No-op object store for `TEST=1` runs.
//!
//! Records every call and moves no bytes. Listings come back empty and
//! ETags are produced from a seeded generator so repeated runs are
//! reproducible.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use studiosync_common::{ObjectKey, Result};

use crate::provider::{ObjectStore, RemoteObject};

/// Object store that pretends everything worked.
pub struct NoopStore {
    calls: Mutex<Vec<String>>,
    seed: Mutex<u64>,
}

impl NoopStore {
    pub fn new() -> Self {
        Self { calls: Mutex::new(Vec::new()), seed: Mutex::new(0x5353_594e_4353_0001) }
    }

    /// Calls recorded so far, for assertions.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("noop store mutex poisoned").clone()
    }

    fn record(&self, call: String) {
        info!(%call, "noop store");
        self.calls.lock().expect("noop store mutex poisoned").push(call);
    }

    fn next_etag(&self) -> String {
        // Small LCG; no need for real randomness, just distinct values.
        let mut seed = self.seed.lock().expect("noop store mutex poisoned");
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        format!("{:032x}", *seed)
    }
}

impl Default for NoopStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for NoopStore {
    fn name(&self) -> &str {
        "noop"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        self.record(format!("list {}", prefix));
        Ok(Vec::new())
    }

    async fn upload(&self, local: &Path, key: &ObjectKey) -> Result<()> {
        self.record(format!("upload {} -> {}", local.display(), key));
        let _ = self.next_etag();
        Ok(())
    }

    async fn download(&self, key: &ObjectKey, local: &Path) -> Result<()> {
        self.record(format!("download {} -> {}", key, local.display()));
        Ok(())
    }

    async fn copy(&self, src: &ObjectKey, dst: &ObjectKey) -> Result<()> {
        self.record(format!("copy {} -> {}", src, dst));
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.record(format!("delete {}", key));
        Ok(())
    }
}

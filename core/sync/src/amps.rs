//! Shared amp-sim preset sync.
//!
//! Each project carries an `Amp Settings` subtree in the bucket, one
//! directory per amp, one subdirectory per user. We push our own presets
//! up and pull everyone else's down. Failures here never fail a sync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use studiosync_common::keys::{amp_prefix, strip_prefix};
use studiosync_common::{ObjectKey, Result};
use studiosync_storage::ObjectStore;

use crate::scan::{Manifest, ManifestScanner};

/// The one directory under the preset root that is not an amp.
const IMPULSE_RESPONSES: &str = "Impulse Responses";

/// Local amp directories under the preset root.
fn local_amps(neural_dsp_path: &Path) -> Result<Vec<String>> {
    let mut amps = Vec::new();
    if !neural_dsp_path.is_dir() {
        return Ok(amps);
    }
    for entry in std::fs::read_dir(neural_dsp_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && name != IMPULSE_RESPONSES {
            amps.push(name);
        }
    }
    Ok(amps)
}

fn join_rel(dir: &Path, rel: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    for component in rel.split('/') {
        path.push(component);
    }
    path
}

/// Push local presets and pull the other users' for every local amp.
pub async fn sync_amps(
    store: &Arc<dyn ObjectStore>,
    scanner: &Arc<dyn ManifestScanner>,
    project_id: i64,
    neural_dsp_path: &Path,
    username: &str,
) -> Result<()> {
    for amp in local_amps(neural_dsp_path)? {
        if let Err(e) =
            push_amp(store, scanner, project_id, neural_dsp_path, &amp, username).await
        {
            warn!(%amp, error = %e, "amp preset push failed");
        }
        if let Err(e) =
            pull_amp(store, scanner, project_id, neural_dsp_path, &amp, username).await
        {
            warn!(%amp, error = %e, "amp preset pull failed");
        }
    }
    Ok(())
}

/// Upload `<amp>/User` into our per-user slot of the shared subtree.
async fn push_amp(
    store: &Arc<dyn ObjectStore>,
    scanner: &Arc<dyn ManifestScanner>,
    project_id: i64,
    neural_dsp_path: &Path,
    amp: &str,
    username: &str,
) -> Result<()> {
    let user_dir = neural_dsp_path.join(amp).join("User");
    let mut local = {
        let scanner = scanner.clone();
        let dir = user_dir.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&dir))
            .await
            .expect("scan task panicked")?
    };
    // Single depth: nested directories under User are other users' pulled
    // presets, not ours to push.
    local.retain(|rel, _| !rel.contains('/'));
    if local.is_empty() {
        return Ok(());
    }

    let prefix = format!("{}{}/", amp_prefix(project_id, amp), username);
    let remote = remote_manifest(store, &prefix).await?;

    for rel in scanner.diff(&local, &remote) {
        let key = ObjectKey::new(format!("{}{}", prefix, rel))?;
        store.upload(&join_rel(&user_dir, &rel), &key).await?;
    }
    Ok(())
}

/// Download the other users' preset subtrees into `<amp>/User/<user>`.
async fn pull_amp(
    store: &Arc<dyn ObjectStore>,
    scanner: &Arc<dyn ManifestScanner>,
    project_id: i64,
    neural_dsp_path: &Path,
    amp: &str,
    username: &str,
) -> Result<()> {
    let prefix = amp_prefix(project_id, amp);
    let remote = remote_manifest(store, &prefix).await?;

    let user_root = neural_dsp_path.join(amp).join("User");
    let local = {
        let scanner = scanner.clone();
        let dir = user_root.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&dir))
            .await
            .expect("scan task panicked")?
    };

    for (rel, etag) in &remote {
        // First key component is the owning user.
        let Some((owner, _)) = rel.split_once('/') else { continue };
        if owner == username {
            continue;
        }
        if local.get(rel) == Some(etag) {
            continue;
        }
        debug!(amp, %rel, "pulling preset");
        let key = ObjectKey::new(format!("{}{}", prefix, rel))?;
        store.download(&key, &join_rel(&user_root, rel)).await?;
    }
    Ok(())
}

async fn remote_manifest(store: &Arc<dyn ObjectStore>, prefix: &str) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    for object in store.list(prefix).await? {
        if let Some(rel) = strip_prefix(object.key.as_str(), prefix) {
            manifest.insert(rel.to_string(), object.etag);
        }
    }
    Ok(manifest)
}

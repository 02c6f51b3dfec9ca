//! File hashing and directory manifests.
//!
//! A manifest maps song-relative paths to content hashes. The hash is MD5
//! so that local entries compare equal to the ETag the object store reports
//! for unmodified single-part uploads.

use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use studiosync_common::Result;

/// Read granularity for streaming hashes.
const HASH_BLOCK: usize = 4096;

/// Glob suffix of DAW session files considered "the session itself".
const SESSION_EXT: &str = "cpr";

/// Ordered mapping of relative path to content hash over a song directory.
pub type Manifest = BTreeMap<String, String>;

/// Stream one file through MD5.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Md5::new();
    hash_file_into(path, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn hash_file_into(path: &Path, hasher: &mut Md5) -> Result<()> {
    let mut file = File::open(path)?;
    let mut block = [0u8; HASH_BLOCK];
    loop {
        let read = file.read(&mut block)?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read]);
    }
    Ok(())
}

/// Cheap "did the session itself change?" digest: the top-level session
/// files of a song directory, streamed through one hasher in name order.
///
/// Returns `None` when the directory does not exist (no local copy).
pub fn hash_project_root(root: &Path) -> Result<Option<String>> {
    if !root.is_dir() {
        return Ok(None);
    }

    let mut sessions: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case(SESSION_EXT))
                    .unwrap_or(false)
        })
        .collect();
    sessions.sort();

    let mut hasher = Md5::new();
    for session in &sessions {
        debug!(path = %session.display(), "hashing session file");
        hash_file_into(session, &mut hasher)?;
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Whether a directory entry participates in manifests.
///
/// `.peak` files are rebuildable waveform caches; backslash-bearing names
/// are leftovers of the legacy separator bug and never synced again.
fn wanted(name: &str) -> bool {
    !name.ends_with(".peak") && !name.contains('\\')
}

fn walk(root: &Path, base: &str, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !wanted(&name) {
            continue;
        }
        let rel = if base.is_empty() { name.clone() } else { format!("{}/{}", base, name) };
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), &rel, out)?;
        } else {
            out.push((rel, entry.path()));
        }
    }
    Ok(())
}

/// Directory scanner and manifest differ.
///
/// Two implementations exist; the daemon picks one at startup
/// (`THREADS_OFF=1` selects the serial one).
pub trait ManifestScanner: Send + Sync {
    /// Hash every wanted file under `root` into a manifest. A missing root
    /// yields an empty manifest.
    fn scan(&self, root: &Path) -> Result<Manifest>;

    /// Keys that must move from `src` to `dst`: present in `src` with a
    /// hash `dst` does not already have.
    fn diff(&self, src: &Manifest, dst: &Manifest) -> Vec<String> {
        src.iter()
            .filter(|(key, hash)| dst.get(*key) != Some(*hash))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Single-threaded scanner.
pub struct SerialScanner;

impl ManifestScanner for SerialScanner {
    fn scan(&self, root: &Path) -> Result<Manifest> {
        if !root.is_dir() {
            return Ok(Manifest::new());
        }
        let mut files = Vec::new();
        walk(root, "", &mut files)?;

        let mut manifest = Manifest::new();
        for (rel, path) in files {
            manifest.insert(rel, hash_file(&path)?);
        }
        Ok(manifest)
    }
}

/// Scanner that fans file hashing out over a fixed set of threads.
pub struct ParallelScanner {
    workers: usize,
}

impl ParallelScanner {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }
}

impl ManifestScanner for ParallelScanner {
    fn scan(&self, root: &Path) -> Result<Manifest> {
        if !root.is_dir() {
            return Ok(Manifest::new());
        }
        let mut files = Vec::new();
        walk(root, "", &mut files)?;

        let chunk = files.len().div_ceil(self.workers).max(1);
        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = files
                .chunks(chunk)
                .map(|slice| {
                    scope.spawn(move || {
                        slice
                            .iter()
                            .map(|(rel, path)| Ok((rel.clone(), hash_file(path)?)))
                            .collect::<Result<Vec<_>>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("hash worker panicked"))
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(results.into_iter().flatten().collect())
    }
}

//! Filesystem-event loop and upload handling.

use chrono::Utc;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use studiosync_api::MetadataClient;
use studiosync_common::keys::audio_key;
use studiosync_common::{Error, ObjectKey, Result};
use studiosync_storage::ObjectStore;
use studiosync_store::{AppStore, AudioFileRecord};
use studiosync_sync::hash_file;

/// Tuning for the watcher; defaults match production behavior.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory tree to observe.
    pub root: PathBuf,
    /// A file's size must be unchanged for this long before upload.
    pub settle: Duration,
    /// Minimum spacing between uploads of the same path.
    pub min_upload_interval: Duration,
}

impl WatcherConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            settle: Duration::from_secs(1),
            min_upload_interval: Duration::from_secs(10),
        }
    }
}

/// Event-driven uploader for the audio bucket.
pub struct AudioWatcher {
    store: Arc<dyn ObjectStore>,
    state: Arc<AppStore>,
    api: Arc<MetadataClient>,
    config: WatcherConfig,
}

impl AudioWatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        state: Arc<AppStore>,
        api: Arc<MetadataClient>,
        config: WatcherConfig,
    ) -> Self {
        Self { store, state, api, config }
    }

    /// Run supervised: the event loop is restarted if it ever dies.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.run_once().await {
                    Ok(()) => {
                        warn!("watcher event loop ended, restarting");
                    }
                    Err(e) => {
                        error!(error = %e, "watcher event loop died, restarting");
                    }
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
    }

    /// One life of the event loop: register the OS watcher and drain
    /// events until the channel closes.
    async fn run_once(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |event: notify::Result<notify::Event>| {
                let _ = tx.send(event);
            },
        )
        .map_err(|e| Error::Config(format!("watcher init: {}", e)))?;
        watcher
            .watch(&self.config.root, RecursiveMode::Recursive)
            .map_err(|e| Error::Config(format!("cannot watch {}: {}", self.config.root.display(), e)))?;

        info!(root = %self.config.root.display(), "audio watcher running");
        while let Some(event) = rx.recv().await {
            match event {
                Ok(event) => self.dispatch(event).await,
                Err(e) => warn!(error = %e, "watch event error"),
            }
        }
        Ok(())
    }

    async fn dispatch(&self, event: notify::Event) {
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = event.paths.as_slice() {
                    if let Err(e) = self.handle_rename(from, to).await {
                        error!(from = %from.display(), error = %e, "rename handling failed");
                    }
                }
            }
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    // Directories and already-vanished paths are not ours.
                    if !path.is_file() {
                        continue;
                    }
                    if let Err(e) = self.handle_change(path).await {
                        error!(path = %path.display(), error = %e, "upload handling failed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Block until the file's size has been stable for the settle window.
    async fn settle(&self, path: &Path) -> Result<u64> {
        let mut size = tokio::fs::metadata(path).await?.len();
        loop {
            tokio::time::sleep(self.config.settle).await;
            let next = tokio::fs::metadata(path).await?.len();
            if next == size {
                return Ok(next);
            }
            debug!(path = %path.display(), size = next, "still being written");
            size = next;
        }
    }

    /// Upload a created/modified file if its content actually changed and
    /// the per-path rate limit allows it.
    pub async fn handle_change(&self, path: &Path) -> Result<()> {
        self.settle(path).await?;

        let hash = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || hash_file(&path))
                .await
                .expect("hash task panicked")?
        };

        let path_key = path.to_string_lossy().into_owned();
        if let Some(record) = self.state.audio_file(&path_key)? {
            if record.hash == hash {
                debug!(path = %path.display(), "content unchanged");
                return Ok(());
            }
            let elapsed = Utc::now() - record.last_upload;
            if elapsed.to_std().unwrap_or_default() < self.config.min_upload_interval {
                debug!(path = %path.display(), "rate limited");
                return Ok(());
            }
        }

        let key = self.key_for(path)?;
        info!(path = %path.display(), key = %key, "uploading audio render");
        self.store.upload(path, &key).await?;
        self.state.set_audio_file(&AudioFileRecord {
            path: path_key,
            hash,
            last_upload: Utc::now(),
        })?;

        self.notify_audio_sync(&key).await;
        Ok(())
    }

    /// A rename becomes a server-side copy plus delete, with bookkeeping
    /// moved to the new path.
    pub async fn handle_rename(&self, from: &Path, to: &Path) -> Result<()> {
        let old_key = self.key_for(from)?;
        let new_key = self.key_for(to)?;
        info!(from = %old_key, to = %new_key, "renaming audio render");

        self.store.copy(&old_key, &new_key).await?;
        self.store.delete(&old_key).await?;

        self.state
            .move_audio_file(&from.to_string_lossy(), &to.to_string_lossy())?;
        self.notify_audio_sync(&new_key).await;
        Ok(())
    }

    /// `<project_name>/<basename>`: the project is the parent directory.
    fn key_for(&self, path: &Path) -> Result<ObjectKey> {
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("no file name in {}", path.display())))?
            .to_string_lossy();
        let project = path
            .parent()
            .and_then(Path::file_name)
            .ok_or_else(|| Error::InvalidInput(format!("no parent dir for {}", path.display())))?
            .to_string_lossy();
        audio_key(&project, &file_name)
    }

    async fn notify_audio_sync(&self, key: &ObjectKey) {
        let (project, file) = key
            .as_str()
            .split_once('/')
            .unwrap_or((key.as_str(), ""));
        if let Err(e) = self.api.record_audio_sync(project, file).await {
            // Notification is best-effort; the upload already happened.
            warn!(key = %key, error = %e, "audio sync notification failed");
        }
    }
}

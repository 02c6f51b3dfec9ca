//! Transfer orchestration and state commit.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use studiosync_common::keys::{song_prefix, strip_prefix};
use studiosync_common::{ObjectKey, Project, Result, Song, SongState, Verdict};
use studiosync_storage::ObjectStore;
use studiosync_store::AppStore;

use crate::prompt::{ConflictChoice, UserPrompt};
use crate::scan::{hash_project_root, Manifest, ManifestScanner};
use crate::verdict::verdict;

/// Engine knobs resolved at startup from settings and environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the local project tree.
    pub source: PathBuf,
    /// `<source>/<project>/<song>` layout instead of `<source>/<song>`.
    pub nested_folders: bool,
    /// Transfer worker-pool width.
    pub workers: usize,
    /// `THREADS_OFF=1`: run transfers one at a time.
    pub serial: bool,
    /// Root of the locally-installed amp-sim presets, when configured.
    pub neural_dsp_path: Option<PathBuf>,
}

impl EngineConfig {
    fn width(&self) -> usize {
        if self.serial {
            1
        } else {
            self.workers.max(1)
        }
    }
}

/// Where a pushed song's changelog entry comes from.
///
/// Only interactive flows may block on the user; a headless sync either
/// got the entry in the command payload or records none at all.
#[derive(Debug, Clone)]
pub enum ChangelogMode {
    /// Ask the user per song (interactive console flow).
    Ask,
    /// Entry supplied with the command.
    Entry(String),
    /// Headless, nothing supplied: skip the entry.
    Skip,
}

/// Result of reconciling one song.
#[derive(Debug, Clone, Serialize)]
pub struct SongOutcome {
    pub song: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl SongOutcome {
    fn success(song: &Song, action: Option<&str>, revision: Option<i64>) -> Self {
        Self {
            song: song.name.clone(),
            id: Some(song.id),
            result: "success",
            action: action.map(String::from),
            msg: None,
            revision,
        }
    }

    fn skipped(song: &Song, action: &str) -> Self {
        Self {
            song: song.name.clone(),
            id: Some(song.id),
            result: "success",
            action: Some(action.to_string()),
            msg: None,
            revision: None,
        }
    }

    fn locked(song: &Song) -> Self {
        Self {
            song: song.name.clone(),
            id: Some(song.id),
            result: "error",
            action: Some("locked".to_string()),
            msg: None,
            revision: None,
        }
    }

    fn failed(song: &Song, msg: String) -> Self {
        Self {
            song: song.name.clone(),
            id: Some(song.id),
            result: "error",
            action: None,
            msg: Some(msg),
            revision: None,
        }
    }
}

/// Result of reconciling one project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSyncReport {
    pub status: &'static str,
    pub songs: Vec<SongOutcome>,
    /// Files moved across all songs in this run.
    pub transferred: usize,
    /// Per-file transfer failures (counted, not fatal).
    pub failed_transfers: usize,
}

impl ProjectSyncReport {
    /// Songs whose local state was pushed; these get a sync receipt.
    pub fn pushed_song_ids(&self) -> Vec<i64> {
        self.songs
            .iter()
            .filter(|outcome| {
                outcome.result == "success" && outcome.action.as_deref() == Some("local")
            })
            .filter_map(|outcome| outcome.id)
            .collect()
    }
}

/// Per-song reconciliation and transfer orchestration.
///
/// One engine lives for one command; the hash cache is a field so that a
/// run never observes another run's hashes.
pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    state: Arc<AppStore>,
    scanner: Arc<dyn ManifestScanner>,
    prompt: Arc<dyn UserPrompt>,
    config: EngineConfig,
    /// song id -> project-root hash, primed once per run.
    local_hashes: HashMap<i64, Option<String>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        state: Arc<AppStore>,
        scanner: Arc<dyn ManifestScanner>,
        prompt: Arc<dyn UserPrompt>,
        config: EngineConfig,
    ) -> Self {
        Self { store, state, scanner, prompt, config, local_hashes: HashMap::new() }
    }

    fn song_dir(&self, project: &Project, song: &Song) -> PathBuf {
        let project_name = self.config.nested_folders.then_some(project.name.as_str());
        song.local_dir(&self.config.source, project_name)
    }

    /// Hash every song's project root up front, fanned out over the pool.
    async fn prime_local_hashes(&mut self, project: &Project, songs: &[&Song]) -> Result<()> {
        info!(project = %project.name, "checking local files for changes");
        let jobs = songs.iter().map(|song| {
            let dir = self.song_dir(project, song);
            let id = song.id;
            async move {
                let hash = tokio::task::spawn_blocking(move || hash_project_root(&dir))
                    .await
                    .expect("hash task panicked")?;
                Ok::<_, studiosync_common::Error>((id, hash))
            }
        });

        let results: Vec<_> =
            stream::iter(jobs).buffer_unordered(self.config.width()).collect().await;
        for result in results {
            let (id, hash) = result?;
            self.local_hashes.insert(id, hash);
        }
        Ok(())
    }

    async fn local_hash(&mut self, project: &Project, song: &Song) -> Result<Option<String>> {
        if let Some(hash) = self.local_hashes.get(&song.id) {
            return Ok(hash.clone());
        }
        let dir = self.song_dir(project, song);
        let hash = tokio::task::spawn_blocking(move || hash_project_root(&dir))
            .await
            .expect("hash task panicked")?;
        self.local_hashes.insert(song.id, hash.clone());
        Ok(hash)
    }

    async fn scan_local(&self, dir: PathBuf) -> Result<Manifest> {
        let scanner = self.scanner.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&dir))
            .await
            .expect("scan task panicked")
    }

    async fn remote_manifest(&self, prefix: &str) -> Result<Manifest> {
        let listing = self.store.list(prefix).await?;
        let mut manifest = Manifest::new();
        for object in listing {
            if let Some(rel) = strip_prefix(object.key.as_str(), prefix) {
                // Waveform caches may linger in old buckets; they are
                // skipped locally, so skip them here or every run would
                // re-download them.
                if rel.ends_with(".peak") {
                    continue;
                }
                manifest.insert(rel.to_string(), object.etag);
            }
        }
        Ok(manifest)
    }

    /// Reconcile every syncable song of one project.
    ///
    /// `force` pins the verdict for every song (the `workdone --undo`
    /// path); gates for disabled and remotely-locked songs still apply.
    pub async fn sync_project(
        &mut self,
        project: &Project,
        force: Option<Verdict>,
        changelog: ChangelogMode,
    ) -> ProjectSyncReport {
        info!(project = %project.name, "syncing project");
        self.local_hashes.clear();

        let mut report = ProjectSyncReport {
            status: "done",
            songs: Vec::new(),
            transferred: 0,
            failed_transfers: 0,
        };

        let mut songs = Vec::new();
        for song in &project.songs {
            if !song.sync_enabled {
                report.songs.push(SongOutcome::skipped(song, "disabled"));
            } else if song.is_locked {
                report.songs.push(SongOutcome::locked(song));
            } else {
                songs.push(song);
            }
        }
        if songs.is_empty() {
            warn!(project = %project.name, "no songs to sync");
            return report;
        }

        if let Err(e) = self.prime_local_hashes(project, &songs).await {
            warn!(project = %project.name, error = %e, "local hash pass failed");
        }

        for song in songs {
            match self.sync_song(project, song, force, &changelog).await {
                Ok((outcome, transferred, failed)) => {
                    report.transferred += transferred;
                    report.failed_transfers += failed;
                    report.songs.push(outcome);
                }
                Err(e) => {
                    error!(song = %song.name, error = %e, "sync failed");
                    report.songs.push(SongOutcome::failed(song, e.to_string()));
                }
            }
        }
        report
    }

    /// Reconcile one song. Returns the outcome plus transfer counters.
    async fn sync_song(
        &mut self,
        project: &Project,
        song: &Song,
        force: Option<Verdict>,
        changelog: &ChangelogMode,
    ) -> Result<(SongOutcome, usize, usize)> {
        debug!(song = %song.name, "working on song");
        let state = self.state.song_state(project.id, song.id)?;
        let local_hash = self.local_hash(project, song).await?;

        let mut decision = match force {
            Some(forced) => {
                debug!(song = %song.name, verdict = %forced, "using pre-specified verdict");
                forced
            }
            None => verdict(&state, song, local_hash.as_deref()),
        };

        // Archived songs never accept pushes.
        if decision == Verdict::Local && song.archived {
            decision = if self.prompt.archived_pull(&song.name).await {
                Verdict::Remote
            } else {
                Verdict::None
            };
        }

        if decision == Verdict::None {
            info!(song = %song.name, "no action");
            return Ok((SongOutcome::success(song, None, Some(state.revision)), 0, 0));
        }

        let dir = self.song_dir(project, song);
        let prefix = song_prefix(project.id, song.id);
        let remote = self.remote_manifest(&prefix).await?;
        let mut local = self.scan_local(dir.clone()).await?;

        if local.is_empty() && remote.is_empty() {
            info!(song = %song.name, "nothing on either side");
            return Ok((SongOutcome::success(song, None, Some(state.revision)), 0, 0));
        }
        if local.is_empty() {
            debug!(song = %song.name, "local manifest empty, pulling");
            decision = Verdict::Remote;
        }

        if decision == Verdict::Conflict {
            decision = match self.prompt.conflict(&song.name).await {
                ConflictChoice::KeepLocal => Verdict::Local,
                ConflictChoice::KeepRemote => Verdict::Remote,
                ConflictChoice::Skip => {
                    info!(song = %song.name, "conflict skipped");
                    return Ok((SongOutcome::success(song, None, Some(state.revision)), 0, 0));
                }
            };
        }

        if decision == Verdict::Local {
            let entry = match changelog {
                ChangelogMode::Ask => self.prompt.changelog(&song.name).await,
                ChangelogMode::Entry(text) => Some(text.clone()),
                ChangelogMode::Skip => None,
            };
            if let Some(entry) = entry {
                if let Err(e) = write_changelog(&dir, &song.name, &entry) {
                    warn!(song = %song.name, error = %e, "changelog update failed");
                }
                // Pick up the fresh changelog entry.
                local = self.scan_local(dir.clone()).await?;
            }
        }

        let keys = match decision {
            Verdict::Local => self.scanner.diff(&local, &remote),
            Verdict::Remote => self.scanner.diff(&remote, &local),
            _ => unreachable!("conflicts were resolved above"),
        };

        info!(song = %song.name, files = keys.len(), verdict = %decision, "starting transfer");
        let started = Instant::now();
        let (transferred, failed) = self.transfer(decision, &dir, &prefix, keys).await;
        info!(
            song = %song.name,
            transferred,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transfer finished"
        );

        let new_state = match decision {
            Verdict::Local => SongState {
                song_id: song.id,
                revision: song.revision + 1,
                known_hash: match local_hash {
                    Some(hash) => hash,
                    None => self.rehash_root(song, &dir).await?.unwrap_or_default(),
                },
            },
            Verdict::Remote => SongState {
                song_id: song.id,
                revision: song.revision,
                known_hash: self.rehash_root(song, &dir).await?.unwrap_or_default(),
            },
            _ => unreachable!(),
        };
        self.state.set_song_state(project.id, &new_state)?;

        info!(song = %song.name, "successfully synced");
        let action = decision.to_string();
        Ok((
            SongOutcome::success(song, Some(&action), Some(new_state.revision)),
            transferred,
            failed,
        ))
    }

    /// Re-hash a song's project root, replacing the cached value.
    async fn rehash_root(&mut self, song: &Song, dir: &Path) -> Result<Option<String>> {
        let dir = dir.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || hash_project_root(&dir))
            .await
            .expect("hash task panicked")?;
        self.local_hashes.insert(song.id, hash.clone());
        Ok(hash)
    }

    /// Move one key set through the pool. Failures are counted, not fatal.
    async fn transfer(
        &self,
        direction: Verdict,
        dir: &Path,
        prefix: &str,
        keys: Vec<String>,
    ) -> (usize, usize) {
        let results: Vec<bool> = stream::iter(keys)
            .map(|rel| {
                let store = self.store.clone();
                let local = join_rel(dir, &rel);
                let key = ObjectKey::new(format!("{}{}", prefix, rel));
                async move {
                    let key = match key {
                        Ok(key) => key,
                        Err(e) => {
                            error!(%rel, error = %e, "bad transfer key");
                            return false;
                        }
                    };
                    let result = match direction {
                        Verdict::Local => store.upload(&local, &key).await,
                        Verdict::Remote => store.download(&key, &local).await,
                        _ => unreachable!("only local/remote transfer"),
                    };
                    match result {
                        Ok(()) => true,
                        Err(e) => {
                            error!(key = %key, error = %e, "transfer failed");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.config.width())
            .collect()
            .await;

        let transferred = results.iter().filter(|ok| **ok).count();
        (transferred, results.len() - transferred)
    }
}

/// Resolve a `/`-separated manifest key under a local directory.
fn join_rel(dir: &Path, rel: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    for component in rel.split('/') {
        path.push(component);
    }
    path
}

/// Prepend a stamped entry to the song's changelog file.
fn write_changelog(dir: &Path, song: &str, entry: &str) -> Result<()> {
    const HEADER_WIDTH: usize = 50;
    let path = dir.join("changelog.txt");

    let existing = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let divider = "*".repeat(HEADER_WIDTH);
            format!("{}\n*{:^width$}*\n{}\n", divider, format!("CHANGELOG: {}", song), divider, width = HEADER_WIDTH - 2)
        }
        Err(e) => return Err(e.into()),
    };

    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M");
    let mut lines: Vec<&str> = existing.lines().collect();
    let block = format!("\n-- {} --\n{}\n", stamp, entry);
    // Entries go right below the three header lines.
    let insert_at = lines.len().min(3);
    lines.insert(insert_at, &block);
    std::fs::write(&path, lines.join("\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::StaticPrompt;
    use crate::scan::SerialScanner;
    use studiosync_storage::DirStore;

    struct Fixture {
        _source_guard: tempfile::TempDir,
        _remote_guard: tempfile::TempDir,
        source: PathBuf,
        remote_root: PathBuf,
        state: Arc<AppStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let source_guard = tempfile::tempdir().unwrap();
            let remote_guard = tempfile::tempdir().unwrap();
            let source = source_guard.path().to_path_buf();
            let remote_root = remote_guard.path().to_path_buf();
            Self {
                _source_guard: source_guard,
                _remote_guard: remote_guard,
                source,
                remote_root,
                state: Arc::new(AppStore::in_memory().unwrap()),
            }
        }

        fn engine(&self, prompt: StaticPrompt) -> SyncEngine {
            SyncEngine::new(
                Arc::new(DirStore::new(&self.remote_root)),
                self.state.clone(),
                Arc::new(SerialScanner),
                Arc::new(prompt),
                EngineConfig {
                    source: self.source.clone(),
                    nested_folders: false,
                    workers: 4,
                    serial: false,
                    neural_dsp_path: None,
                },
            )
        }

        fn write_local(&self, song: &str, rel: &str, data: &[u8]) {
            let path = join_rel(&self.source.join(song), rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }

        fn write_remote(&self, project: i64, song: i64, rel: &str, data: &[u8]) {
            let path = join_rel(&self.remote_root, &format!("{}/{}/{}", project, song, rel));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }

        fn root_hash(&self, song: &str) -> String {
            hash_project_root(&self.source.join(song)).unwrap().unwrap()
        }
    }

    fn project(songs: Vec<Song>) -> Project {
        Project { id: 3, name: "Album".into(), songs, sync_enabled: true }
    }

    fn song(revision: i64) -> Song {
        Song {
            id: 14,
            project: 3,
            name: "Intro".into(),
            directory_name: None,
            revision,
            is_locked: false,
            sync_enabled: true,
            archived: false,
        }
    }

    #[tokio::test]
    async fn test_fresh_clone_downloads_everything() {
        let fixture = Fixture::new();
        fixture.write_remote(3, 14, "mix.cpr", b"session v3");
        fixture.write_remote(3, 14, "Audio/kick.wav", b"pcm");

        let project = project(vec![song(3)]);
        let mut engine = fixture.engine(StaticPrompt::default());
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;

        assert_eq!(report.songs.len(), 1);
        assert_eq!(report.songs[0].action.as_deref(), Some("remote"));
        assert_eq!(report.transferred, 2);
        assert_eq!(report.failed_transfers, 0);
        assert!(report.pushed_song_ids().is_empty());

        let state = fixture.state.song_state(3, 14).unwrap();
        assert_eq!(state.revision, 3);
        assert_eq!(state.known_hash, fixture.root_hash("Intro"));
        assert_eq!(
            std::fs::read(fixture.source.join("Intro/mix.cpr")).unwrap(),
            b"session v3"
        );
    }

    #[tokio::test]
    async fn test_local_edit_pushes_diff() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"session v3");
        fixture.write_remote(3, 14, "mix.cpr", b"session v3");
        let known = fixture.root_hash("Intro");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: known })
            .unwrap();

        // Local edit after the last sync.
        fixture.write_local("Intro", "mix.cpr", b"session v4 wip");

        let project = project(vec![song(3)]);
        let mut engine = fixture.engine(StaticPrompt::default());
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;

        assert_eq!(report.songs[0].action.as_deref(), Some("local"));
        assert_eq!(report.pushed_song_ids(), vec![14]);

        let state = fixture.state.song_state(3, 14).unwrap();
        assert_eq!(state.revision, 4);
        assert_eq!(state.known_hash, fixture.root_hash("Intro"));
        assert_eq!(
            std::fs::read(fixture.remote_root.join("3/14/mix.cpr")).unwrap(),
            b"session v4 wip"
        );
    }

    #[tokio::test]
    async fn test_remote_edit_pulls_diff() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"session v3");
        let known = fixture.root_hash("Intro");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: known })
            .unwrap();
        fixture.write_remote(3, 14, "mix.cpr", b"session v4");

        let project = project(vec![song(4)]);
        let mut engine = fixture.engine(StaticPrompt::default());
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;

        assert_eq!(report.songs[0].action.as_deref(), Some("remote"));
        let state = fixture.state.song_state(3, 14).unwrap();
        assert_eq!(state.revision, 4);
        assert_eq!(state.known_hash, fixture.root_hash("Intro"));
        assert_eq!(
            std::fs::read(fixture.source.join("Intro/mix.cpr")).unwrap(),
            b"session v4"
        );
    }

    #[tokio::test]
    async fn test_conflict_keep_local() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"local edit");
        fixture.write_remote(3, 14, "mix.cpr", b"remote edit");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "a".into() })
            .unwrap();

        let project = project(vec![song(4)]);
        let mut engine = fixture.engine(StaticPrompt {
            conflict: ConflictChoice::KeepLocal,
            ..StaticPrompt::default()
        });
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;

        assert_eq!(report.songs[0].action.as_deref(), Some("local"));
        let state = fixture.state.song_state(3, 14).unwrap();
        assert_eq!(state.revision, 5);
        assert_eq!(
            std::fs::read(fixture.remote_root.join("3/14/mix.cpr")).unwrap(),
            b"local edit"
        );
    }

    #[tokio::test]
    async fn test_conflict_skip_mutates_nothing() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"local edit");
        fixture.write_remote(3, 14, "mix.cpr", b"remote edit");
        let before = SongState { song_id: 14, revision: 3, known_hash: "a".into() };
        fixture.state.set_song_state(3, &before).unwrap();

        let project = project(vec![song(4)]);
        let mut engine = fixture.engine(StaticPrompt::default()); // conflict -> Skip
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;

        assert_eq!(report.songs[0].action, None);
        assert_eq!(report.transferred, 0);
        assert_eq!(fixture.state.song_state(3, 14).unwrap(), before);
        assert_eq!(
            std::fs::read(fixture.source.join("Intro/mix.cpr")).unwrap(),
            b"local edit"
        );
    }

    #[tokio::test]
    async fn test_forced_remote_discards_local_edits() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"abandoned edit");
        fixture.write_remote(3, 14, "mix.cpr", b"server copy");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "a".into() })
            .unwrap();

        let project = project(vec![song(4)]);
        let mut engine = fixture.engine(StaticPrompt::default());
        let report = engine.sync_project(&project, Some(Verdict::Remote), ChangelogMode::Skip).await;

        assert_eq!(report.songs[0].action.as_deref(), Some("remote"));
        let state = fixture.state.song_state(3, 14).unwrap();
        assert_eq!(state.revision, 4);
        assert_eq!(
            std::fs::read(fixture.source.join("Intro/mix.cpr")).unwrap(),
            b"server copy"
        );
    }

    #[tokio::test]
    async fn test_reconciliation_is_idempotent() {
        let fixture = Fixture::new();
        fixture.write_remote(3, 14, "mix.cpr", b"session v3");
        fixture.write_remote(3, 14, "Audio/kick.wav", b"pcm");

        let project = project(vec![song(3)]);
        let mut engine = fixture.engine(StaticPrompt::default());
        let first = engine.sync_project(&project, None, ChangelogMode::Skip).await;
        assert_eq!(first.transferred, 2);

        let second = engine.sync_project(&project, None, ChangelogMode::Skip).await;
        assert_eq!(second.transferred, 0);
        assert_eq!(second.songs[0].action, None);
    }

    #[tokio::test]
    async fn test_disabled_and_locked_songs_are_gated() {
        let fixture = Fixture::new();
        let mut disabled = song(3);
        disabled.id = 20;
        disabled.name = "Disabled".into();
        disabled.sync_enabled = false;
        let mut locked = song(3);
        locked.id = 21;
        locked.name = "Locked".into();
        locked.is_locked = true;

        let project = project(vec![disabled, locked]);
        let mut engine = fixture.engine(StaticPrompt::default());
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;

        assert_eq!(report.songs[0].action.as_deref(), Some("disabled"));
        assert_eq!(report.songs[0].result, "success");
        assert_eq!(report.songs[1].action.as_deref(), Some("locked"));
        assert_eq!(report.songs[1].result, "error");
        assert_eq!(report.transferred, 0);
    }

    #[tokio::test]
    async fn test_archived_song_refuses_push() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"local edit");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "a".into() })
            .unwrap();

        let mut archived = song(3);
        archived.archived = true;
        let project = project(vec![archived]);

        // Default prompt declines the pull: nothing happens.
        let mut engine = fixture.engine(StaticPrompt::default());
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;
        assert_eq!(report.songs[0].action, None);
        assert_eq!(fixture.state.song_state(3, 14).unwrap().revision, 3);
    }

    #[tokio::test]
    async fn test_both_sides_empty_is_noop() {
        let fixture = Fixture::new();
        // Local dir exists but holds nothing syncable.
        std::fs::create_dir_all(fixture.source.join("Intro")).unwrap();

        let project = project(vec![song(3)]);
        let mut engine = fixture.engine(StaticPrompt::default());
        let report = engine.sync_project(&project, None, ChangelogMode::Skip).await;

        assert_eq!(report.songs[0].action, None);
        assert_eq!(report.transferred, 0);
    }

    #[tokio::test]
    async fn test_payload_changelog_entry_is_recorded_headless() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"session v4 wip");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "stale".into() })
            .unwrap();

        // The prompt would block a headless sync; prove it is never asked.
        let mut engine = fixture.engine(StaticPrompt {
            changelog: Some("from the prompt".into()),
            ..StaticPrompt::default()
        });
        let report = engine
            .sync_project(
                &project(vec![song(3)]),
                None,
                ChangelogMode::Entry("re-tracked vocals".into()),
            )
            .await;

        assert_eq!(report.songs[0].action.as_deref(), Some("local"));
        let content =
            std::fs::read_to_string(fixture.source.join("Intro/changelog.txt")).unwrap();
        assert!(content.contains("re-tracked vocals"));
        assert!(!content.contains("from the prompt"));
        // The entry itself ships with the push.
        assert!(fixture.remote_root.join("3/14/changelog.txt").is_file());
    }

    #[tokio::test]
    async fn test_skip_mode_never_touches_the_prompt() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"session v4 wip");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "stale".into() })
            .unwrap();

        let mut engine = fixture.engine(StaticPrompt {
            changelog: Some("from the prompt".into()),
            ..StaticPrompt::default()
        });
        let report = engine
            .sync_project(&project(vec![song(3)]), None, ChangelogMode::Skip)
            .await;

        assert_eq!(report.songs[0].action.as_deref(), Some("local"));
        assert!(!fixture.source.join("Intro/changelog.txt").exists());
    }

    #[tokio::test]
    async fn test_ask_mode_takes_entry_from_prompt() {
        let fixture = Fixture::new();
        fixture.write_local("Intro", "mix.cpr", b"session v4 wip");
        fixture
            .state
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "stale".into() })
            .unwrap();

        let mut engine = fixture.engine(StaticPrompt {
            changelog: Some("tightened the outro".into()),
            ..StaticPrompt::default()
        });
        engine.sync_project(&project(vec![song(3)]), None, ChangelogMode::Ask).await;

        let content =
            std::fs::read_to_string(fixture.source.join("Intro/changelog.txt")).unwrap();
        assert!(content.contains("tightened the outro"));
    }

    #[test]
    fn test_changelog_created_with_header() {
        let dir = tempfile::tempdir().unwrap();
        write_changelog(dir.path(), "Intro", "re-tracked the bridge").unwrap();

        let content = std::fs::read_to_string(dir.path().join("changelog.txt")).unwrap();
        assert!(content.contains("CHANGELOG: Intro"));
        assert!(content.contains("re-tracked the bridge"));

        write_changelog(dir.path(), "Intro", "tightened the outro").unwrap();
        let content = std::fs::read_to_string(dir.path().join("changelog.txt")).unwrap();
        let bridge = content.find("re-tracked the bridge").unwrap();
        let outro = content.find("tightened the outro").unwrap();
        // Newest entry sits above the older one.
        assert!(outro < bridge);
    }
}

//! The serial command dispatcher.
//!
//! One task consumes the command queue; handler N fully runs before
//! handler N+1 begins. Errors never cross the dispatcher boundary: they
//! become `error` status events, the task id is dropped from the in-flight
//! set, and the sync-lock guard is released with the handler scope.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use studiosync_api::{LockTarget, MetadataClient};
use studiosync_common::{
    Command, CommandRequest, Error, Project, Result, Song, SongRef, StatusEvent, SyncTarget,
    Verdict,
};
use studiosync_storage::ObjectStore;
use studiosync_store::AppStore;
use studiosync_sync::{
    acquire, acquire_song, release, sync_amps, ChangelogMode, EngineConfig, LockIntent,
    ManifestScanner, SyncEngine, UserPrompt,
};

use crate::logs::zip_log;
use crate::shell::Shell;
use crate::update::{host_tag, newest_applicable};

/// Everything a handler needs, injected once at startup.
pub struct AppContext {
    pub api: Arc<MetadataClient>,
    pub store: Arc<AppStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub scanner: Arc<dyn ManifestScanner>,
    pub prompt: Arc<dyn UserPrompt>,
    pub shell: Arc<dyn Shell>,
    pub engine: EngineConfig,
    /// Live log file, shipped by the `logs` command.
    pub log_path: PathBuf,
    /// Running daemon version, compared against the update feed.
    pub version: String,
    /// Debug mode: errors are not forwarded to the error reporter.
    pub debug: bool,
    /// Service mode: never block on console prompts for changelog text.
    pub headless: bool,
}

/// The queue ends the HTTP endpoint and TUI talk to.
#[derive(Clone)]
pub struct DispatcherHandles {
    /// Enqueue side of the command queue.
    pub requests: mpsc::UnboundedSender<CommandRequest>,
    /// Drain side of the status-event queue (`/api/results`).
    pub events: Arc<StdMutex<mpsc::UnboundedReceiver<StatusEvent>>>,
    /// In-flight task ids.
    pub tasks: Arc<StdMutex<HashSet<Uuid>>>,
}

impl DispatcherHandles {
    /// Pop every pending status event without blocking.
    pub fn drain_events(&self) -> Vec<StatusEvent> {
        let mut receiver = self.events.lock().expect("event queue mutex poisoned");
        let mut drained = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Single consumer of the command queue.
pub struct Dispatcher {
    ctx: AppContext,
    requests: mpsc::UnboundedReceiver<CommandRequest>,
    events: mpsc::UnboundedSender<StatusEvent>,
    tasks: Arc<StdMutex<HashSet<Uuid>>>,
    /// Guards the whole reconciliation critical section.
    sync_lock: AsyncMutex<()>,
}

impl Dispatcher {
    pub fn new(ctx: AppContext) -> (Self, DispatcherHandles) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tasks = Arc::new(StdMutex::new(HashSet::new()));

        let handles = DispatcherHandles {
            requests: request_tx,
            events: Arc::new(StdMutex::new(event_rx)),
            tasks: tasks.clone(),
        };
        let dispatcher = Self {
            ctx,
            requests: request_rx,
            events: event_tx,
            tasks,
            sync_lock: AsyncMutex::new(()),
        };
        (dispatcher, handles)
    }

    /// Run until the queue closes or a `shutdown` command arrives.
    pub fn run(self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.run_inner())
    }

    async fn run_inner(mut self) {
        info!("dispatcher started");
        while let Some(request) = self.requests.recv().await {
            let task_id = request.task_id;
            let kind = request.command.kind();
            debug!(%task_id, kind, "received command");

            self.tasks.lock().expect("task set mutex poisoned").insert(task_id);
            let flow: Result<ControlFlow<()>> =
                Box::pin(self.handle(task_id, request.command)).await;
            self.tasks.lock().expect("task set mutex poisoned").remove(&task_id);

            match flow {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    error!(%task_id, kind, error = %e, "handler failed");
                    self.emit(StatusEvent::error(task_id, e.to_string()));
                    // Transport failures are environmental noise; only
                    // unexpected errors go to the error reporter.
                    if !self.ctx.debug && !e.is_transport() {
                        self.ctx.shell.report_error(&e);
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    fn emit(&self, event: StatusEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            self.ctx.objects.clone(),
            self.ctx.store.clone(),
            self.ctx.scanner.clone(),
            self.ctx.prompt.clone(),
            self.ctx.engine.clone(),
        )
    }

    /// Changelog text comes from the command payload when present; without
    /// it, only an interactive run may fall back to asking the user.
    fn changelog_mode(&self, supplied: Option<String>) -> ChangelogMode {
        match supplied {
            Some(text) => ChangelogMode::Entry(text),
            None if self.ctx.headless => ChangelogMode::Skip,
            None => ChangelogMode::Ask,
        }
    }

    async fn handle(&mut self, task_id: Uuid, command: Command) -> Result<ControlFlow<()>> {
        match command {
            Command::Auth { access, refresh, username } => {
                self.handle_auth(task_id, access, refresh, username).await?
            }
            Command::Sync { target, changelog } => {
                self.handle_sync(task_id, target, changelog).await?
            }
            Command::WorkOn { song } => self.handle_workon(task_id, song).await?,
            Command::WorkDone { song, undo, changelog } => {
                self.handle_workdone(task_id, song, undo, changelog).await?
            }
            Command::Tasks => self.handle_tasks(task_id),
            Command::Update => return self.handle_update(task_id).await,
            Command::Logs => self.handle_logs(task_id).await?,
            Command::Settings => {
                self.ctx.shell.open_settings()?;
                self.emit(StatusEvent::complete(task_id));
            }
            Command::Shutdown => {
                info!("shutdown requested");
                self.emit(StatusEvent::complete(task_id));
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn handle_auth(
        &self,
        task_id: Uuid,
        access: String,
        refresh: String,
        username: Option<String>,
    ) -> Result<()> {
        self.ctx.api.set_tokens(access.clone(), refresh.clone()).await;
        self.ctx.store.set_tokens(&access, &refresh)?;

        // Refresh the cached identity; a failure here is not worth failing
        // the login handoff over.
        let username = match username {
            Some(name) => Some(name),
            None => self.ctx.api.who_am_i().await.ok(),
        };
        if let Some(name) = username {
            self.ctx.store.set_username(&name)?;
        }

        self.emit(StatusEvent::complete(task_id));
        Ok(())
    }

    async fn handle_sync(
        &self,
        task_id: Uuid,
        target: SyncTarget,
        changelog: Option<String>,
    ) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        let changelog = self.changelog_mode(changelog);
        match target {
            SyncTarget::Projects { projects } => {
                debug!("got request to sync projects");
                for project_ref in projects {
                    let project = self.hydrate(project_ref).await?;
                    if !project.sync_enabled {
                        debug!(project = %project.name, "sync disabled, skipping");
                        continue;
                    }
                    self.sync_one_project(task_id, &project, &changelog).await?;
                }
            }
            SyncTarget::Songs { songs } => {
                debug!("got request to sync songs");
                for song_ref in songs {
                    self.sync_one_song(task_id, &song_ref, &changelog).await?;
                }
            }
        }
        self.emit(StatusEvent::complete(task_id));
        Ok(())
    }

    async fn hydrate(&self, project_ref: studiosync_common::ProjectRef) -> Result<Project> {
        match project_ref {
            studiosync_common::ProjectRef::Full(project) if !project.songs.is_empty() => {
                Ok(*project)
            }
            other => self.ctx.api.get_project(other.id()).await,
        }
    }

    /// Lock, reconcile, sync presets, unlock, emit progress. A denied lock
    /// is a `warn` and the batch continues.
    async fn sync_one_project(
        &self,
        task_id: Uuid,
        project: &Project,
        changelog: &ChangelogMode,
    ) -> Result<()> {
        let api: &MetadataClient = self.ctx.api.as_ref();
        let target = LockTarget::Project(project.id);

        match acquire(api, self.ctx.prompt.as_ref(), target, &project.name, LockIntent::Sync)
            .await
        {
            Ok(_) => {}
            Err(Error::LockDenied(lock)) => {
                debug!(project = %project.name, "project is locked, returning warn");
                self.emit(StatusEvent::warn_locked(task_id, *lock, "project"));
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let mut engine = self.engine();
        let report = engine.sync_project(project, None, changelog.clone()).await;

        if let Some(presets) = &self.ctx.engine.neural_dsp_path {
            if let Ok(username) = api.who_am_i().await {
                let result = sync_amps(
                    &self.ctx.objects,
                    &self.ctx.scanner,
                    project.id,
                    presets,
                    &username,
                )
                .await;
                if let Err(e) = result {
                    warn!(project = %project.name, error = %e, "amp preset sync failed");
                }
            }
        }

        release(api, target, &project.name).await?;

        let pushed = report.pushed_song_ids();
        if !pushed.is_empty() {
            api.record_sync(project.id, &pushed).await?;
        }
        self.report_failures(&report).await;

        self.emit(StatusEvent::progress(task_id, serde_json::to_value(&report)?));
        Ok(())
    }

    /// Per-file failures are counted, not fatal, but they trigger an
    /// automatic log report so support sees them.
    async fn report_failures(&self, report: &studiosync_sync::ProjectSyncReport) {
        if report.failed_transfers == 0 {
            return;
        }
        warn!(failed = report.failed_transfers, "transfers failed, shipping logs");
        if let Err(e) = self.ship_logs().await {
            warn!(error = %e, "automatic log report failed");
        }
    }

    /// The workon-without-keep variant: project lock, song lock, project
    /// unlock, reconcile, song unlock. A denied lock is an `error` here.
    async fn sync_one_song(
        &self,
        task_id: Uuid,
        song_ref: &SongRef,
        changelog: &ChangelogMode,
    ) -> Result<()> {
        let api: &MetadataClient = self.ctx.api.as_ref();
        let prompt = self.ctx.prompt.as_ref();
        let project = api.get_project(song_ref.project).await?;
        let song = find_song(&project, song_ref)?.clone();

        let project_target = LockTarget::Project(project.id);
        match acquire(api, prompt, project_target, &project.name, LockIntent::Sync).await {
            Ok(_) => {}
            Err(Error::LockDenied(lock)) => {
                self.emit(StatusEvent::error_locked(task_id, *lock, "project"));
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let song_target = LockTarget::Song { project: project.id, song: song.id };
        match acquire(api, prompt, song_target, &song.name, LockIntent::WorkOn).await {
            Ok(_) => {}
            Err(Error::LockDenied(lock)) => {
                release(api, project_target, &project.name).await?;
                self.emit(StatusEvent::error_locked(task_id, *lock, "song"));
                return Ok(());
            }
            Err(e) => {
                release(api, project_target, &project.name).await?;
                return Err(e);
            }
        }
        release(api, project_target, &project.name).await?;

        let single = single_song_project(&project, &song);
        let mut engine = self.engine();
        let report = engine.sync_project(&single, None, changelog.clone()).await;

        release(api, song_target, &song.name).await?;

        let pushed = report.pushed_song_ids();
        if !pushed.is_empty() {
            api.record_sync(project.id, &pushed).await?;
        }
        self.report_failures(&report).await;
        self.emit(StatusEvent::progress(task_id, serde_json::to_value(&report)?));
        Ok(())
    }

    /// Check a song out: reconcile under a kept song lock, then open the
    /// newest session file with the platform's default application.
    async fn handle_workon(&self, task_id: Uuid, song_ref: SongRef) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        let api: &MetadataClient = self.ctx.api.as_ref();
        let project = api.get_project(song_ref.project).await?;
        let song = find_song(&project, &song_ref)?.clone();

        match acquire_song(api, self.ctx.prompt.as_ref(), &project.name, &song).await {
            Ok(_) => {}
            Err(Error::LockDenied(lock)) => {
                self.emit(StatusEvent::error_locked(task_id, *lock, "song"));
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let single = single_song_project(&project, &song);
        let mut engine = self.engine();
        let report = engine.sync_project(&single, None, self.changelog_mode(None)).await;

        let pushed = report.pushed_song_ids();
        if !pushed.is_empty() {
            api.record_sync(project.id, &pushed).await?;
        }
        self.report_failures(&report).await;

        // Song lock stays held until workdone.
        let project_name = self.ctx.engine.nested_folders.then_some(project.name.as_str());
        let song_dir = song.local_dir(&self.ctx.engine.source, project_name);
        match newest_session_file(&song_dir)? {
            Some(session) => {
                info!(path = %session.display(), "opening session file");
                open::that_detached(&session)
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            }
            None => warn!(song = %song.name, "no session file to open"),
        }

        self.emit(StatusEvent::complete_with(
            task_id,
            serde_json::to_value(&report)?,
        ));
        Ok(())
    }

    /// Finish a checkout: reconcile (optionally discarding local edits)
    /// and release the held song lock.
    async fn handle_workdone(
        &self,
        task_id: Uuid,
        song_ref: SongRef,
        undo: bool,
        changelog: Option<String>,
    ) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        let api: &MetadataClient = self.ctx.api.as_ref();
        let project = api.get_project(song_ref.project).await?;
        let song = find_song(&project, &song_ref)?.clone();

        let force = undo.then_some(Verdict::Remote);
        let single = single_song_project(&project, &song);
        let mut engine = self.engine();
        let report = engine.sync_project(&single, force, self.changelog_mode(changelog)).await;

        let song_target = LockTarget::Song { project: project.id, song: song.id };
        release(api, song_target, &song.name).await?;

        let pushed = report.pushed_song_ids();
        if !pushed.is_empty() {
            api.record_sync(project.id, &pushed).await?;
        }
        self.report_failures(&report).await;
        self.emit(StatusEvent::complete_with(
            task_id,
            serde_json::to_value(&report)?,
        ));
        Ok(())
    }

    fn handle_tasks(&self, task_id: Uuid) {
        let others: Vec<Uuid> = self
            .tasks
            .lock()
            .expect("task set mutex poisoned")
            .iter()
            .copied()
            .filter(|id| *id != task_id)
            .collect();
        self.emit(StatusEvent::tasks(task_id, others));
    }

    async fn handle_update(&self, task_id: Uuid) -> Result<ControlFlow<()>> {
        let updates = self.ctx.api.list_client_updates(&host_tag()).await?;
        match newest_applicable(&updates, &self.ctx.version) {
            Some(update) => {
                info!(version = %update.version, "update available, handing off");
                self.ctx.shell.apply_update(&update)?;
                self.emit(StatusEvent::complete(task_id));
                // The updater relaunches us; stop processing commands.
                Ok(ControlFlow::Break(()))
            }
            None => {
                debug!("client is up to date");
                self.emit(StatusEvent::complete(task_id));
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn handle_logs(&self, task_id: Uuid) -> Result<()> {
        self.ship_logs().await?;
        self.emit(StatusEvent::complete(task_id));
        Ok(())
    }

    async fn ship_logs(&self) -> Result<()> {
        let archive = zip_log(&self.ctx.log_path)?;
        self.ctx.api.upload_logs("studiosync-log.zip", archive).await
    }
}

fn find_song<'a>(project: &'a Project, song_ref: &SongRef) -> Result<&'a Song> {
    project
        .songs
        .iter()
        .find(|song| song.id == song_ref.id)
        .ok_or_else(|| {
            Error::NotFound(format!("song {} in project {}", song_ref.id, project.name))
        })
}

fn single_song_project(project: &Project, song: &Song) -> Project {
    Project {
        id: project.id,
        name: project.name.clone(),
        songs: vec![song.clone()],
        sync_enabled: project.sync_enabled,
    }
}

/// The most recently modified session file under a song directory.
fn newest_session_file(dir: &Path) -> Result<Option<PathBuf>> {
    fn visit(dir: &Path, newest: &mut Option<(std::time::SystemTime, PathBuf)>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                visit(&path, newest)?;
            } else if path.extension().map(|ext| ext.eq_ignore_ascii_case("cpr")).unwrap_or(false)
            {
                let modified = entry.metadata()?.modified()?;
                if newest.as_ref().map(|(when, _)| modified > *when).unwrap_or(true) {
                    *newest = Some((modified, path));
                }
            }
        }
        Ok(())
    }

    if !dir.is_dir() {
        return Ok(None);
    }
    let mut newest = None;
    visit(dir, &mut newest)?;
    Ok(newest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::time::Duration;
    use studiosync_common::{StatusBody, SongState};
    use studiosync_storage::DirStore;
    use studiosync_sync::{SerialScanner, StaticPrompt};
    use crate::shell::NoopShell;

    struct Harness {
        handles: DispatcherHandles,
        _dirs: Vec<tempfile::TempDir>,
        source: PathBuf,
        remote_root: PathBuf,
        store: Arc<AppStore>,
        task: tokio::task::JoinHandle<()>,
    }

    /// Shell that remembers every reported error.
    struct RecordingShell {
        reports: Arc<StdMutex<Vec<String>>>,
    }

    impl crate::shell::Shell for RecordingShell {
        fn apply_update(&self, _update: &studiosync_common::ClientUpdate) -> Result<()> {
            Ok(())
        }

        fn open_settings(&self) -> Result<()> {
            Ok(())
        }

        fn report_error(&self, error: &Error) {
            self.reports.lock().unwrap().push(error.to_string());
        }
    }

    impl Harness {
        fn start(server: &Server) -> Self {
            Self::start_with(server, Arc::new(NoopShell), true)
        }

        fn start_with(server: &Server, shell: Arc<dyn crate::shell::Shell>, debug: bool) -> Self {
            let source_dir = tempfile::tempdir().unwrap();
            let remote_dir = tempfile::tempdir().unwrap();
            let log_dir = tempfile::tempdir().unwrap();
            let log_path = log_dir.path().join("studiosync.log");
            std::fs::write(&log_path, "log line\n").unwrap();

            let store = Arc::new(AppStore::in_memory().unwrap());
            let ctx = AppContext {
                api: Arc::new(MetadataClient::new(
                    format!("{}/", server.url()),
                    Some("acc".into()),
                    Some("ref".into()),
                )),
                store: store.clone(),
                objects: Arc::new(DirStore::new(remote_dir.path())),
                scanner: Arc::new(SerialScanner),
                prompt: Arc::new(StaticPrompt::default()),
                shell,
                engine: EngineConfig {
                    source: source_dir.path().to_path_buf(),
                    nested_folders: false,
                    workers: 4,
                    serial: false,
                    neural_dsp_path: None,
                },
                log_path,
                version: "0.1.0".into(),
                debug,
                headless: true,
            };

            let (dispatcher, handles) = Dispatcher::new(ctx);
            let task = tokio::spawn(dispatcher.run());
            Self {
                handles,
                source: source_dir.path().to_path_buf(),
                remote_root: remote_dir.path().to_path_buf(),
                _dirs: vec![source_dir, remote_dir, log_dir],
                store,
                task,
            }
        }

        fn send(&self, command: Command) -> Uuid {
            let request = CommandRequest::new(command);
            let task_id = request.task_id;
            self.handles.requests.send(request).unwrap();
            task_id
        }

        async fn wait_events(&self, count: usize) -> Vec<StatusEvent> {
            let mut events = Vec::new();
            for _ in 0..200 {
                events.extend(self.handles.drain_events());
                if events.len() >= count {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {} events, got {:?}", count, events);
        }

        async fn shutdown(self) {
            self.send(Command::Shutdown);
            let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        }
    }

    fn project_body(revision: i64, is_locked: bool) -> String {
        format!(
            r#"{{"id": 3, "name": "Album", "sync_enabled": true,
                "songs": [{{"id": 14, "project": 3, "name": "Intro",
                            "revision": {}, "is_locked": {},
                            "sync_enabled": true, "archived": false}}]}}"#,
            revision, is_locked
        )
    }

    fn granted_lock() -> &'static str {
        r#"{"id": "c2d9e7de-35e1-4b7c-97cf-5f16352363ea", "status": "locked", "locked_by": "self"}"#
    }

    fn unlocked() -> &'static str {
        r#"{"status": "unlocked"}"#
    }

    #[tokio::test]
    async fn test_auth_persists_tokens_and_username() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/users/me/")
            .with_status(200)
            .with_body(r#"{"username": "frets"}"#)
            .create_async()
            .await;

        let harness = Harness::start(&server);
        let task_id = harness.send(Command::Auth {
            access: "new-acc".into(),
            refresh: "new-ref".into(),
            username: None,
        });

        let events = harness.wait_events(1).await;
        assert_eq!(events[0].task_id, task_id);
        assert!(matches!(events[0].body, StatusBody::Complete { .. }));
        assert_eq!(
            harness.store.tokens().unwrap(),
            Some(("new-acc".into(), "new-ref".into()))
        );
        assert_eq!(harness.store.username().unwrap().as_deref(), Some("frets"));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_tasks_reports_other_inflight_ids() {
        let server = Server::new_async().await;
        let harness = Harness::start(&server);

        let first = harness.send(Command::Tasks);
        let second = harness.send(Command::Tasks);

        let events = harness.wait_events(2).await;
        // Serialized dispatch: responses arrive in enqueue order, and each
        // task only ever sees itself in flight.
        assert_eq!(events[0].task_id, first);
        assert_eq!(events[1].task_id, second);
        for event in &events {
            match &event.body {
                StatusBody::Tasks { tasks } => assert!(tasks.is_empty()),
                other => panic!("unexpected event {:?}", other),
            }
        }
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_locked_project_warns_and_continues() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/projects/3/")
            .with_status(200)
            .with_body(project_body(3, false))
            .create_async()
            .await;
        server
            .mock("PUT", "/projects/3/lock/")
            .with_status(200)
            .with_body(
                r#"{"status": "locked", "locked_by": "alice",
                    "since": "2026-08-01T10:00:00Z", "until": "2999-01-01T00:00:00Z"}"#,
            )
            .create_async()
            .await;

        let harness = Harness::start(&server);
        let task_id = harness.send(Command::Sync {
            target: SyncTarget::Projects {
                projects: vec![studiosync_common::ProjectRef::Id(3)],
            },
            changelog: None,
        });

        let events = harness.wait_events(2).await;
        match &events[0].body {
            StatusBody::Warn { locked, component, .. } => {
                assert_eq!(component.as_deref(), Some("project"));
                assert_eq!(locked.as_ref().unwrap().holder(), "alice");
            }
            other => panic!("expected warn, got {:?}", other),
        }
        assert_eq!(events[1].task_id, task_id);
        assert!(matches!(events[1].body, StatusBody::Complete { .. }));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_project_end_to_end() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/projects/3/")
            .with_status(200)
            .with_body(project_body(3, false))
            .create_async()
            .await;
        server
            .mock("PUT", "/projects/3/lock/")
            .with_status(200)
            .with_body(granted_lock())
            .create_async()
            .await;
        let unlock = server
            .mock("DELETE", "/projects/3/lock/")
            .with_status(200)
            .with_body(unlocked())
            .create_async()
            .await;
        let receipt = server
            .mock("POST", "/syncs/")
            .match_body(mockito::Matcher::JsonString(
                r#"{"project": 3, "songs": [14]}"#.to_string(),
            ))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;

        let harness = Harness::start(&server);
        // A local edit on top of the synced baseline: a push.
        let song_dir = harness.source.join("Intro");
        std::fs::create_dir_all(&song_dir).unwrap();
        std::fs::write(song_dir.join("mix.cpr"), b"session v4 wip").unwrap();
        harness
            .store
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "stale".into() })
            .unwrap();

        let task_id = harness.send(Command::Sync {
            target: SyncTarget::Projects {
                projects: vec![studiosync_common::ProjectRef::Id(3)],
            },
            changelog: Some("re-tracked vocals".into()),
        });

        let events = harness.wait_events(2).await;
        match &events[0].body {
            StatusBody::Progress { completed } => {
                assert_eq!(completed["songs"][0]["action"], "local");
            }
            other => panic!("expected progress, got {:?}", other),
        }
        assert_eq!(events[1].task_id, task_id);

        // The push landed in the bucket and bumped local state.
        assert!(harness.remote_root.join("3/14/mix.cpr").is_file());
        // Headless sync took the changelog entry from the payload.
        let changelog =
            std::fs::read_to_string(harness.remote_root.join("3/14/changelog.txt")).unwrap();
        assert!(changelog.contains("re-tracked vocals"));
        assert_eq!(harness.store.song_state(3, 14).unwrap().revision, 4);
        unlock.assert_async().await;
        receipt.assert_async().await;
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_workdone_undo_discards_local_edits() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/projects/3/")
            .with_status(200)
            .with_body(project_body(4, false))
            .create_async()
            .await;
        let unlock = server
            .mock("DELETE", "/projects/3/lock/")
            .match_body(mockito::Matcher::PartialJsonString(r#"{"song": 14}"#.to_string()))
            .with_status(200)
            .with_body(unlocked())
            .create_async()
            .await;

        let harness = Harness::start(&server);
        let song_dir = harness.source.join("Intro");
        std::fs::create_dir_all(&song_dir).unwrap();
        std::fs::write(song_dir.join("mix.cpr"), b"abandoned edit").unwrap();
        let remote_song = harness.remote_root.join("3/14");
        std::fs::create_dir_all(&remote_song).unwrap();
        std::fs::write(remote_song.join("mix.cpr"), b"server copy").unwrap();
        harness
            .store
            .set_song_state(3, &SongState { song_id: 14, revision: 3, known_hash: "a".into() })
            .unwrap();

        harness.send(Command::WorkDone {
            song: SongRef { id: 14, project: 3, name: None },
            undo: true,
            changelog: None,
        });

        let events = harness.wait_events(1).await;
        match &events[0].body {
            StatusBody::Complete { result } => {
                let report = result.as_ref().unwrap();
                assert_eq!(report["songs"][0]["action"], "remote");
            }
            other => panic!("expected complete, got {:?}", other),
        }

        assert_eq!(
            std::fs::read(harness.source.join("Intro/mix.cpr")).unwrap(),
            b"server copy"
        );
        assert_eq!(harness.store.song_state(3, 14).unwrap().revision, 4);
        unlock.assert_async().await;
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_error_keeps_dispatcher_alive() {
        let server = Server::new_async().await;
        let harness = Harness::start(&server);

        // No route mocked: project fetch 501s, the handler errors out.
        let failing = harness.send(Command::Sync {
            target: SyncTarget::Projects {
                projects: vec![studiosync_common::ProjectRef::Id(3)],
            },
            changelog: None,
        });
        let events = harness.wait_events(1).await;
        assert_eq!(events[0].task_id, failing);
        assert!(matches!(events[0].body, StatusBody::Error { .. }));

        // The queue keeps draining afterwards.
        let after = harness.send(Command::Tasks);
        let events = harness.wait_events(1).await;
        assert_eq!(events[0].task_id, after);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_unexpected_errors_reach_the_reporter() {
        let mut server = Server::new_async().await;
        // A project with no songs: workdone on song 99 is a NotFound.
        server
            .mock("GET", "/projects/3/")
            .with_status(200)
            .with_body(r#"{"id": 3, "name": "Album", "sync_enabled": true, "songs": []}"#)
            .create_async()
            .await;

        let reports = Arc::new(StdMutex::new(Vec::new()));
        let shell = Arc::new(RecordingShell { reports: reports.clone() });
        let harness = Harness::start_with(&server, shell, false);

        // 501 from the unmocked sync route: a transport-class failure,
        // kept away from the reporter.
        harness.send(Command::Sync {
            target: SyncTarget::Projects {
                projects: vec![studiosync_common::ProjectRef::Id(9)],
            },
            changelog: None,
        });
        harness.wait_events(1).await;
        assert!(reports.lock().unwrap().is_empty());

        // A missing song is not environmental; it gets reported.
        harness.send(Command::WorkDone {
            song: SongRef { id: 99, project: 3, name: None },
            undo: false,
            changelog: None,
        });
        harness.wait_events(1).await;
        assert_eq!(reports.lock().unwrap().len(), 1);
        harness.shutdown().await;
    }

    #[test]
    fn test_newest_session_file_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.cpr");
        let new = dir.path().join("sub").join("new.cpr");
        std::fs::write(&old, b"old").unwrap();
        std::fs::create_dir_all(new.parent().unwrap()).unwrap();
        std::fs::write(&new, b"new").unwrap();

        let stale = std::time::SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::File::options().write(true).open(&old).unwrap();
        file.set_modified(stale).unwrap();

        assert_eq!(newest_session_file(dir.path()).unwrap(), Some(new));
        assert_eq!(newest_session_file(&dir.path().join("absent")).unwrap(), None);
    }
}

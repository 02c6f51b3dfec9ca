//! StudioSync daemon.
//!
//! One long-running binary: it keeps the local project tree coherent with
//! the metadata service and the object-store buckets, answers signed
//! commands from the companion web UI on a loopback port, and streams
//! ad-hoc audio renders to the audio bucket.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use studiosync_api::MetadataClient;
use studiosync_app::{
    spawn_update_checker, AppContext, Dispatcher, DispatcherHandles, NoopShell,
};
use studiosync_common::{Command, CommandRequest, Error, ProjectRef, StatusBody, SyncTarget};
use studiosync_server::{probe_running_instance, ServerConfig};
use studiosync_storage::{NoopStore, ObjectStore, S3Store};
use studiosync_store::AppStore;
use studiosync_sync::{
    checkout, EngineConfig, ManifestScanner, ParallelScanner, SerialScanner, UserPrompt,
};
use studiosync_watcher::{AudioWatcher, WatcherConfig};

mod prompts;
use prompts::ConsolePrompt;

/// Control-API base; override with `STUDIOSYNC_API`.
const API_BASE: &str = "https://api.studiosync.app/api/v1/";

/// Companion web UI origin; the endpoint pins `Referer` to this.
const COMPANION_ORIGIN: &str = "https://app.studiosync.app/";

/// Loopback port the companion expects.
const LOCAL_PORT: u16 = 5000;

/// RS256 public key the companion web UI signs commands with.
const COMPANION_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA8KKAnDkM28Dcz+wfJc+Q
BaMvzZthMGyllYRXizWaJ/B5DsAgnGDSzCMsNfOwXFdBgCDffwipfd+isvgq8dTa
wOL207xtx0b23HF92yZdNrCEdjqvY9UyS+Slxb3vc8eIFc7frnN+w95TUr/Mic2H
y9GdTAYTUef3eCUfTvGxyZ2xKP139NJL6K4C6GC2783FdUYsaxLDNC1Ub7bfe9MG
r4kTmVaAbqhchDeK+/iAOdUs+PGj7wEEhAYbxe55iY3+upMzeev7gbIJM8ya5CNT
QZ8jG0gv/4IMMPNl3W/mrxopfsQMZ5Zq4pYlK35KeTsnz7fxAToSv+LrNz3O2MOn
DwIDAQAB
-----END PUBLIC KEY-----";

#[derive(Parser)]
#[command(name = "studiosync")]
#[command(about = "Synchronization daemon for collaborative DAW projects")]
#[command(version)]
struct Cli {
    /// Run the interactive console flow instead of the service loop.
    #[arg(long)]
    tui: bool,

    /// Verbose logging; handler errors are raised instead of reported.
    #[arg(long)]
    debug: bool,

    /// Run one full sync and exit.
    #[arg(long)]
    sync: bool,
}

fn main() {
    let args = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("failed to start runtime");
    let code = runtime.block_on(run(args));
    std::process::exit(code);
}

async fn run(args: Cli) -> i32 {
    // Fatal configuration problems before logging is even up.
    let store = match AppStore::open_default() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error! Could not open the local state store: {}", e);
            return -1;
        }
    };
    let settings = match store.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error! Could not read settings: {}", e);
            return -1;
        }
    };

    let log_path = settings
        .telemetry_file
        .clone()
        .unwrap_or_else(default_log_path);
    let _log_guard = match init_logging(&log_path, args.debug) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error! Could not set up logging: {}", e);
            return -1;
        }
    };
    info!(version = env!("CARGO_PKG_VERSION"), "studiosync starting");

    // Another instance already answering locally? Hand over to the web UI.
    if probe_running_instance(LOCAL_PORT).await {
        info!("another instance is running, opening the companion UI");
        let _ = open::that_detached(COMPANION_ORIGIN);
        return 0;
    }

    match run_daemon(args, store, settings, log_path).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            eprintln!("Fatal error: {:#}", e);
            -1
        }
    }
}

async fn run_daemon(
    args: Cli,
    store: Arc<AppStore>,
    settings: studiosync_store::Settings,
    log_path: PathBuf,
) -> Result<i32> {
    let test_mode = std::env::var("TEST").map(|value| value == "1").unwrap_or(false);
    let threads_off = std::env::var("THREADS_OFF").map(|value| value == "1").unwrap_or(false);

    let Some(source) = settings.source.clone() else {
        error!("source directory not configured, run setup from the companion UI");
        return Ok(-1);
    };
    if !source.is_dir() && !args.debug {
        error!(path = %source.display(), "source path not found");
        return Ok(-1);
    }

    let api_base = std::env::var("STUDIOSYNC_API").unwrap_or_else(|_| API_BASE.to_string());
    let (access, refresh) = match store.tokens()? {
        Some((access, refresh)) => (Some(access), Some(refresh)),
        None => (None, None),
    };
    let api = Arc::new(MetadataClient::new(api_base, access, refresh));

    if !ensure_login(&api, &store).await? {
        error!("couldn't log in with the provided credentials");
        return Ok(1);
    }
    let username = api.who_am_i().await.context("fetching identity")?;
    store.set_username(&username)?;
    info!(%username, "logged in");

    // Object-store backends for the two buckets.
    let (objects, audio_objects): (Arc<dyn ObjectStore>, Arc<dyn ObjectStore>) = if test_mode {
        info!("TEST=1, using the no-op storage backend");
        (Arc::new(NoopStore::new()), Arc::new(NoopStore::new()))
    } else {
        let creds = api
            .get_object_store_credentials()
            .await
            .context("fetching object-store credentials")?;
        (
            Arc::new(S3Store::new(&creds.access, &creds.secret, None, &creds.bucket)),
            Arc::new(S3Store::new(&creds.access, &creds.secret, None, &creds.audio_bucket)),
        )
    };

    let scanner: Arc<dyn ManifestScanner> = if threads_off {
        info!("THREADS_OFF=1, scanning and transferring serially");
        Arc::new(SerialScanner)
    } else {
        Arc::new(ParallelScanner::new(settings.workers))
    };

    let prompt: Arc<dyn UserPrompt> = Arc::new(ConsolePrompt);
    let ctx = AppContext {
        api: api.clone(),
        store: store.clone(),
        objects,
        scanner,
        prompt: prompt.clone(),
        shell: Arc::new(NoopShell),
        engine: EngineConfig {
            source,
            nested_folders: settings.nested_folders,
            workers: settings.workers,
            serial: threads_off,
            neural_dsp_path: settings.neural_dsp_path.clone(),
        },
        log_path,
        version: env!("CARGO_PKG_VERSION").to_string(),
        debug: args.debug,
        // Only the interactive console flow may block on changelog
        // prompts; the service loop and one-shot sync never do.
        headless: !args.tui,
    };
    let (dispatcher, handles) = Dispatcher::new(ctx);

    // Local command endpoint.
    let server_config = ServerConfig {
        port: LOCAL_PORT,
        companion_origin: COMPANION_ORIGIN.to_string(),
        public_key_pem: COMPANION_PUBLIC_KEY.to_string(),
    };
    let server_handles = handles.clone();
    let server_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = studiosync_server::serve(&server_config, server_handles, server_store).await
        {
            error!(error = %e, "command endpoint failed");
        }
    });

    // Audio watcher, when a directory is configured.
    if let Some(audio_dir) = settings.audio_sync_dir.clone() {
        let watcher = AudioWatcher::new(
            audio_objects,
            store.clone(),
            api.clone(),
            WatcherConfig::new(audio_dir),
        );
        watcher.spawn();
    }

    // Update feed: once at startup, then every 12 hours.
    let _ = handles.requests.send(CommandRequest::new(Command::Update));
    spawn_update_checker(handles.requests.clone());

    if args.sync {
        one_shot_sync(&api, &handles).await?;
        dispatcher.run().await;
        return Ok(0);
    }

    if args.tui {
        let dispatcher_task = tokio::spawn(dispatcher.run());
        run_tui(&api, prompt.as_ref(), &handles).await?;
        let _ = handles.requests.send(CommandRequest::new(Command::Shutdown));
        let _ = dispatcher_task.await;
        return Ok(0);
    }

    debug!("starting service loop");
    dispatcher.run().await;
    Ok(0)
}

/// Default daemon log location, next to the state store.
fn default_log_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("studiosync")
        .join("studiosync.log")
}

fn init_logging(
    log_path: &std::path::Path,
    debug: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::options().create(true).append(true).open(log_path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let default_filter = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(guard)
}

/// Make sure the client holds working tokens, prompting up to three times.
async fn ensure_login(api: &MetadataClient, store: &AppStore) -> Result<bool> {
    if api.has_tokens().await {
        match api.who_am_i().await {
            Ok(_) => return Ok(true),
            Err(Error::Unauthenticated(_)) => {
                info!("stored tokens rejected, asking for credentials");
            }
            Err(e) => return Err(e.into()),
        }
    }

    for attempt in 1..=3 {
        let Some((username, password)) = read_credentials().await else {
            return Ok(false);
        };
        match api.login(&username, &password).await {
            Ok(()) => {
                if let Some((access, refresh)) = api.token_pair().await {
                    store.set_tokens(&access, &refresh)?;
                }
                return Ok(true);
            }
            Err(Error::Unauthenticated(_)) => {
                error!(attempt, "login rejected");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

async fn read_credentials() -> Option<(String, String)> {
    tokio::task::spawn_blocking(|| {
        let stdin = std::io::stdin();
        let mut line = String::new();

        print!("Username: ");
        std::io::stdout().flush().ok()?;
        stdin.lock().read_line(&mut line).ok()?;
        let username = line.trim().to_string();

        line.clear();
        print!("Password: ");
        std::io::stdout().flush().ok()?;
        stdin.lock().read_line(&mut line).ok()?;
        let password = line.trim().to_string();

        (!username.is_empty()).then_some((username, password))
    })
    .await
    .ok()
    .flatten()
}

/// Enqueue a sync of every project followed by a shutdown.
async fn one_shot_sync(api: &MetadataClient, handles: &DispatcherHandles) -> Result<()> {
    let projects = api.list_projects().await.context("listing projects")?;
    info!(count = projects.len(), "running one-shot sync");
    let request = CommandRequest::new(Command::Sync {
        target: SyncTarget::Projects {
            projects: projects
                .into_iter()
                .map(|project| ProjectRef::Full(Box::new(project)))
                .collect(),
        },
        changelog: None,
    });
    let _ = handles.requests.send(request);
    let _ = handles.requests.send(CommandRequest::new(Command::Shutdown));
    Ok(())
}

/// Interactive console flow: sync everything, then offer a studio checkout.
async fn run_tui(
    api: &MetadataClient,
    prompt: &dyn UserPrompt,
    handles: &DispatcherHandles,
) -> Result<()> {
    let projects = api.list_projects().await.context("listing projects")?;
    sync_and_wait(handles, &projects).await;
    println!("All projects up-to-date.");

    let answer = tokio::task::spawn_blocking(|| {
        print!("Check out the studio for up to 8 hours? This prevents other users from making edits. [y/N] ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).ok();
        line.trim().to_lowercase()
    })
    .await
    .unwrap_or_default();

    if answer == "y" || answer == "yes" {
        for project in &projects {
            if let Err(e) = checkout(api, prompt, project.id, &project.name).await {
                error!(project = %project.name, error = %e, "checkout failed");
            }
        }
        println!("Alright, it's all yours. Remember to check in when you are done.");
        tokio::task::spawn_blocking(|| {
            print!("[enter] to check in ");
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).ok();
        })
        .await
        .ok();

        let projects = api.list_projects().await.context("re-listing projects")?;
        sync_and_wait(handles, &projects).await;
    }
    Ok(())
}

/// Enqueue a full sync and poll the event queue until it completes.
async fn sync_and_wait(handles: &DispatcherHandles, projects: &[studiosync_common::Project]) {
    let request = CommandRequest::new(Command::Sync {
        target: SyncTarget::Projects {
            projects: projects
                .iter()
                .map(|project| ProjectRef::Full(Box::new(project.clone())))
                .collect(),
        },
        changelog: None,
    });
    let task_id = request.task_id;
    let _ = handles.requests.send(request);

    loop {
        for event in handles.drain_events() {
            match &event.body {
                StatusBody::Progress { completed } if event.task_id == task_id => {
                    println!("{}", serde_json::to_string_pretty(completed).unwrap_or_default());
                }
                StatusBody::Warn { locked, .. } if event.task_id == task_id => {
                    if let Some(lock) = locked {
                        println!(
                            "Locked by {} since {:?}; skipping.",
                            lock.holder(),
                            lock.since
                        );
                    }
                }
                StatusBody::Complete { .. } | StatusBody::Error { .. }
                    if event.task_id == task_id =>
                {
                    return;
                }
                _ => {}
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

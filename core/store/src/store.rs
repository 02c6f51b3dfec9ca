//! SQLite-backed key/value and song-state store.
//!
//! Schema is created on open. Settings are stored as JSON values in a KV
//! table; song state and audio bookkeeping get typed tables. The store is
//! shared behind an internal mutex: the dispatcher is the only writer of
//! song state, the watcher only touches the audio table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use studiosync_common::{Error, Result, SongState};

/// Database filename under the data directory.
const DB_FILENAME: &str = "studiosync.sqlite";

/// Typed view of the settings table.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Directory holding the local project tree.
    pub source: Option<PathBuf>,
    /// Directory watched for ad-hoc audio renders.
    pub audio_sync_dir: Option<PathBuf>,
    /// `<source>/<project>/<song>` layout instead of `<source>/<song>`.
    pub nested_folders: bool,
    /// Transfer worker-pool width.
    pub workers: usize,
    /// Extra debug log file, if configured.
    pub telemetry_file: Option<PathBuf>,
    /// Root of the locally-installed amp-sim presets.
    pub neural_dsp_path: Option<PathBuf>,
}

/// Bookkeeping for one watched audio file.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFileRecord {
    pub path: String,
    pub hash: String,
    pub last_upload: DateTime<Utc>,
}

/// Handle to the local database.
pub struct AppStore {
    conn: Mutex<Connection>,
}

impl AppStore {
    /// Open (or create) the database at the default per-OS location.
    ///
    /// # Errors
    /// - Data directory cannot be resolved or created
    /// - Database open or schema creation failure
    pub fn open_default() -> Result<Self> {
        let dir = dirs::data_dir()
            .ok_or_else(|| Error::Config("no application-data directory on this platform".into()))?
            .join("studiosync");
        std::fs::create_dir_all(&dir)?;
        Self::open(dir.join(DB_FILENAME))
    }

    /// Open (or create) the database at an explicit path.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| Error::Store(format!("failed to open state store: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS song_state (
                project_id INTEGER NOT NULL,
                song_id INTEGER PRIMARY KEY,
                revision INTEGER NOT NULL,
                known_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audio_files (
                path TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                last_upload TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| Error::Store(format!("schema creation failed: {}", e)))?;

        info!(path = %db_path.as_ref().display(), "state store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("state store mutex poisoned");
        f(&conn).map_err(|e| Error::Store(e.to_string()))
    }

    // ---- settings -------------------------------------------------------

    /// Read one setting, JSON-decoded into the requested type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self.with_conn(|conn| {
            conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                .optional()
        })?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Write one setting as JSON.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, json],
            )
        })?;
        Ok(())
    }

    /// Remove one setting.
    pub fn unset(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM settings WHERE key = ?1", [key]))?;
        Ok(())
    }

    /// Load the typed settings view.
    pub fn settings(&self) -> Result<Settings> {
        Ok(Settings {
            source: self.get("source")?,
            audio_sync_dir: self.get("audio_sync_dir")?,
            nested_folders: self.get("nested_folders")?.unwrap_or(false),
            workers: self.get("workers")?.unwrap_or(DEFAULT_WORKERS),
            telemetry_file: self.get("telemetry_file")?,
            neural_dsp_path: self.get("neural_dsp_path")?,
        })
    }

    // ---- auth tokens ----------------------------------------------------

    pub fn tokens(&self) -> Result<Option<(String, String)>> {
        let access: Option<String> = self.get("access")?;
        let refresh: Option<String> = self.get("refresh")?;
        Ok(access.zip(refresh))
    }

    pub fn set_tokens(&self, access: &str, refresh: &str) -> Result<()> {
        self.set("access", &access)?;
        self.set("refresh", &refresh)
    }

    pub fn username(&self) -> Result<Option<String>> {
        self.get("username")
    }

    pub fn set_username(&self, username: &str) -> Result<()> {
        self.set("username", &username)
    }

    pub fn last_version(&self) -> Result<Option<String>> {
        self.get("last_version")
    }

    pub fn set_last_version(&self, version: &str) -> Result<()> {
        self.set("last_version", &version)
    }

    // ---- song state -----------------------------------------------------

    /// Fetch the stored state for a song, creating the zero baseline on
    /// first sight.
    pub fn song_state(&self, project_id: i64, song_id: i64) -> Result<SongState> {
        let existing = self.with_conn(|conn| {
            conn.query_row(
                "SELECT revision, known_hash FROM song_state WHERE song_id = ?1",
                [song_id],
                |row| {
                    Ok(SongState {
                        song_id,
                        revision: row.get(0)?,
                        known_hash: row.get(1)?,
                    })
                },
            )
            .optional()
        })?;

        match existing {
            Some(state) => Ok(state),
            None => {
                debug!(song_id, "song not in local db, adding baseline");
                let state = SongState::new(song_id);
                self.set_song_state(project_id, &state)?;
                Ok(state)
            }
        }
    }

    /// Atomically replace the stored state for a song.
    pub fn set_song_state(&self, project_id: i64, state: &SongState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO song_state (project_id, song_id, revision, known_hash)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![project_id, state.song_id, state.revision, state.known_hash],
            )
        })?;
        Ok(())
    }

    // ---- audio watcher bookkeeping --------------------------------------

    pub fn audio_file(&self, path: &str) -> Result<Option<AudioFileRecord>> {
        let record = self.with_conn(|conn| {
            conn.query_row(
                "SELECT hash, last_upload FROM audio_files WHERE path = ?1",
                [path],
                |row| {
                    let hash: String = row.get(0)?;
                    let stamp: String = row.get(1)?;
                    Ok((hash, stamp))
                },
            )
            .optional()
        })?;

        match record {
            Some((hash, stamp)) => {
                let last_upload = stamp
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| Error::Store(format!("bad timestamp for {}: {}", path, e)))?;
                Ok(Some(AudioFileRecord { path: path.to_string(), hash, last_upload }))
            }
            None => Ok(None),
        }
    }

    pub fn set_audio_file(&self, record: &AudioFileRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO audio_files (path, hash, last_upload) VALUES (?1, ?2, ?3)",
                params![record.path, record.hash, record.last_upload.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Move bookkeeping from an old path to a new one (rename handling).
    pub fn move_audio_file(&self, from: &str, to: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE audio_files SET path = ?2 WHERE path = ?1", params![from, to])
        })?;
        Ok(())
    }

    pub fn remove_audio_file(&self, path: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM audio_files WHERE path = ?1", [path]))?;
        Ok(())
    }
}

/// Default transfer worker-pool width.
pub const DEFAULT_WORKERS: usize = 25;

//! Domain entities mirrored from the metadata service.
//!
//! `Project` and `Song` are read-through copies fetched per command; only
//! `SongState` is owned locally and persisted for the life of the install.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Sentinel the metadata service uses when the lock holder is this client.
pub const SELF_HOLDER: &str = "self";

/// A collection of songs sharing locks and sync policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub songs: Vec<Song>,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

/// A directory holding one DAW session and its media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: i64,
    /// Id of the containing project.
    pub project: i64,
    pub name: String,
    /// Overrides `name` for on-disk resolution when set.
    #[serde(default)]
    pub directory_name: Option<String>,
    /// Monotonic counter the service bumps on each accepted push.
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
    #[serde(default)]
    pub archived: bool,
}

fn default_true() -> bool {
    true
}

impl Song {
    /// On-disk directory name: `directory_name` wins over `name`.
    pub fn folder_name(&self) -> &str {
        self.directory_name.as_deref().unwrap_or(&self.name)
    }

    /// Resolve the song directory under `source`.
    ///
    /// With `project_name` set the nested-folders layout
    /// (`<source>/<project>/<song>`) is used, otherwise the flat layout
    /// (`<source>/<song>`).
    pub fn local_dir(&self, source: &Path, project_name: Option<&str>) -> PathBuf {
        match project_name {
            Some(project) => source.join(project).join(self.folder_name()),
            None => source.join(self.folder_name()),
        }
    }
}

/// Reference to a project in a sync request: either a bare id (the data is
/// fetched on demand) or an already-hydrated project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProjectRef {
    Id(i64),
    Full(Box<Project>),
}

impl ProjectRef {
    pub fn id(&self) -> i64 {
        match self {
            ProjectRef::Id(id) => *id,
            ProjectRef::Full(project) => project.id,
        }
    }
}

/// Reference to a song in a command payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongRef {
    pub id: i64,
    /// Id of the containing project.
    pub project: i64,
    #[serde(default)]
    pub name: Option<String>,
}

/// Locally-durable per-song sync state.
///
/// `known_hash` is the project-root hash as of the last successful sync in
/// either direction; `revision` is the server revision observed then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongState {
    pub song_id: i64,
    pub revision: i64,
    pub known_hash: String,
}

impl SongState {
    /// State for a song seen for the first time: no baseline on either side.
    pub fn new(song_id: i64) -> Self {
        Self { song_id, revision: 0, known_hash: String::new() }
    }
}

/// Lock state as reported by the metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Locked,
    Unlocked,
}

/// Cooperative exclusion record held on a project or song.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    /// Present when the lock was just granted to us.
    #[serde(default)]
    pub id: Option<uuid::Uuid>,
    pub status: LockStatus,
    /// Opaque user identity, or [`SELF_HOLDER`].
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Checkout expiry; absent for sync-duration locks.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Lock {
    /// Whether the lock was granted to this client.
    pub fn granted(&self) -> bool {
        self.id.is_some()
    }

    /// Whether the current holder is this client.
    pub fn held_by_self(&self) -> bool {
        self.locked_by.as_deref() == Some(SELF_HOLDER)
    }

    /// Whether the lock carries an `until` that has already passed.
    ///
    /// Expired checkouts are overridable silently; the server should have
    /// cleaned them up.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.until.map(|until| until <= now).unwrap_or(false)
    }

    /// Display name of the holder for logs and error messages.
    pub fn holder(&self) -> &str {
        self.locked_by.as_deref().unwrap_or("unknown")
    }
}

/// Reconciliation decision for one song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Push local changes to the bucket.
    Local,
    /// Pull the bucket down over local.
    Remote,
    /// Both sides changed; the user decides.
    Conflict,
    /// Nothing to do.
    None,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Local => "local",
            Verdict::Remote => "remote",
            Verdict::Conflict => "conflict",
            Verdict::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// One entry of the client-update feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub version: String,
    /// Download URL of the packaged build for the requested host tag.
    pub package: String,
    #[serde(default)]
    pub target: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn song(directory_name: Option<&str>) -> Song {
        Song {
            id: 7,
            project: 3,
            name: "Intro".into(),
            directory_name: directory_name.map(String::from),
            revision: 2,
            is_locked: false,
            sync_enabled: true,
            archived: false,
        }
    }

    #[test]
    fn test_folder_name_override() {
        assert_eq!(song(None).folder_name(), "Intro");
        assert_eq!(song(Some("intro_v2")).folder_name(), "intro_v2");
    }

    #[test]
    fn test_local_dir_layouts() {
        let s = song(Some("intro_v2"));
        let flat = s.local_dir(Path::new("/music"), None);
        assert_eq!(flat, PathBuf::from("/music/intro_v2"));

        let nested = s.local_dir(Path::new("/music"), Some("Album"));
        assert_eq!(nested, PathBuf::from("/music/Album/intro_v2"));
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let lock = Lock {
            id: None,
            status: LockStatus::Locked,
            locked_by: Some("alice".into()),
            since: Some(now - Duration::hours(9)),
            until: Some(now - Duration::hours(1)),
            reason: None,
        };
        assert!(lock.expired(now));
        assert!(!lock.held_by_self());
        assert_eq!(lock.holder(), "alice");
    }

    #[test]
    fn test_project_ref_deserializes_both_shapes() {
        let bare: ProjectRef = serde_json::from_str("12").unwrap();
        assert_eq!(bare.id(), 12);

        let full: ProjectRef = serde_json::from_str(
            r#"{"id": 4, "name": "Album", "songs": [], "sync_enabled": true}"#,
        )
        .unwrap();
        assert_eq!(full.id(), 4);
    }

    #[test]
    fn test_verdict_wire_form() {
        assert_eq!(serde_json::to_string(&Verdict::Local).unwrap(), "\"local\"");
        assert_eq!(serde_json::to_string(&Verdict::None).unwrap(), "\"none\"");
    }
}

//! Command and status message types.
//!
//! The local HTTP endpoint enqueues [`CommandRequest`]s; the dispatcher
//! answers with [`StatusEvent`]s that the endpoint drains on
//! `/api/results`. Every event carries the task id it belongs to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Lock, ProjectRef, SongRef};

/// What a `sync` command should operate on.
///
/// The web UI sends either a list of projects (ids or full objects) or a
/// list of song references; the two shapes are distinguished by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncTarget {
    Projects { projects: Vec<ProjectRef> },
    Songs { songs: Vec<SongRef> },
}

/// One queued command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Command {
    /// Ingest fresh tokens from the web login flow.
    Auth {
        access: String,
        refresh: String,
        #[serde(default)]
        username: Option<String>,
    },
    /// Reconcile projects or songs. `changelog` is the entry to record for
    /// pushed songs; headless syncs skip the entry when it is absent.
    Sync {
        target: SyncTarget,
        #[serde(default)]
        changelog: Option<String>,
    },
    /// Check a song out and open its session file.
    WorkOn { song: SongRef },
    /// Sync a checked-out song and release it. `undo` discards local edits.
    WorkDone {
        song: SongRef,
        #[serde(default)]
        undo: bool,
        #[serde(default)]
        changelog: Option<String>,
    },
    /// Report other in-flight task ids.
    Tasks,
    /// Check the update feed and hand off to the updater.
    Update,
    /// Zip and upload the daemon log.
    Logs,
    /// Open the settings surface.
    Settings,
    /// Terminate the daemon.
    Shutdown,
}

impl Command {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Auth { .. } => "auth",
            Command::Sync { .. } => "sync",
            Command::WorkOn { .. } => "workon",
            Command::WorkDone { .. } => "workdone",
            Command::Tasks => "tasks",
            Command::Update => "update",
            Command::Logs => "logs",
            Command::Settings => "settings",
            Command::Shutdown => "shutdown",
        }
    }
}

/// A command paired with its task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub task_id: Uuid,
    pub command: Command,
}

impl CommandRequest {
    /// Wrap a command with a fresh task id.
    pub fn new(command: Command) -> Self {
        Self { task_id: Uuid::new_v4(), command }
    }
}

/// Body of a status event; `status` is the wire discriminant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusBody {
    /// A unit of work inside a batch finished.
    Progress { completed: serde_json::Value },
    /// Non-fatal problem; the batch continues.
    Warn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked: Option<Box<Lock>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    /// The task failed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked: Option<Box<Lock>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    /// Terminal success.
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// Answer to the `tasks` command.
    Tasks { tasks: Vec<Uuid> },
}

/// One status event on the result queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub task_id: Uuid,
    #[serde(flatten)]
    pub body: StatusBody,
}

impl StatusEvent {
    pub fn progress(task_id: Uuid, completed: serde_json::Value) -> Self {
        Self { task_id, body: StatusBody::Progress { completed } }
    }

    pub fn warn_locked(task_id: Uuid, lock: Lock, component: &str) -> Self {
        Self {
            task_id,
            body: StatusBody::Warn {
                locked: Some(Box::new(lock)),
                component: Some(component.to_string()),
                msg: None,
            },
        }
    }

    pub fn error(task_id: Uuid, msg: impl Into<String>) -> Self {
        Self {
            task_id,
            body: StatusBody::Error { locked: None, component: None, msg: Some(msg.into()) },
        }
    }

    pub fn error_locked(task_id: Uuid, lock: Lock, component: &str) -> Self {
        Self {
            task_id,
            body: StatusBody::Error {
                locked: Some(Box::new(lock)),
                component: Some(component.to_string()),
                msg: None,
            },
        }
    }

    pub fn complete(task_id: Uuid) -> Self {
        Self { task_id, body: StatusBody::Complete { result: None } }
    }

    pub fn complete_with(task_id: Uuid, result: serde_json::Value) -> Self {
        Self { task_id, body: StatusBody::Complete { result: Some(result) } }
    }

    pub fn tasks(task_id: Uuid, tasks: Vec<Uuid>) -> Self {
        Self { task_id, body: StatusBody::Tasks { tasks } }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_target_shapes() {
        let projects: SyncTarget = serde_json::from_str(r#"{"projects": [1, 2]}"#).unwrap();
        assert!(matches!(projects, SyncTarget::Projects { .. }));

        let songs: SyncTarget =
            serde_json::from_str(r#"{"songs": [{"id": 5, "project": 1}]}"#).unwrap();
        match songs {
            SyncTarget::Songs { songs } => assert_eq!(songs[0].id, 5),
            _ => panic!("expected songs variant"),
        }
    }

    #[test]
    fn test_status_event_wire_shape() {
        let event = StatusEvent::complete(Uuid::nil());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["task_id"], "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_workdone_undo_defaults_false() {
        let cmd: Command = serde_json::from_str(
            r#"{"cmd": "workdone", "song": {"id": 1, "project": 2}}"#,
        )
        .unwrap();
        match cmd {
            Command::WorkDone { undo, changelog, .. } => {
                assert!(!undo);
                assert!(changelog.is_none());
            }
            _ => panic!("expected workdone"),
        }
    }

    #[test]
    fn test_sync_carries_optional_changelog() {
        let cmd: Command = serde_json::from_str(
            r#"{"cmd": "sync", "target": {"projects": [3]}, "changelog": "re-tracked vocals"}"#,
        )
        .unwrap();
        match cmd {
            Command::Sync { changelog, .. } => {
                assert_eq!(changelog.as_deref(), Some("re-tracked vocals"));
            }
            _ => panic!("expected sync"),
        }
    }
}

//! User-prompt capability.
//!
//! Conflicts, stale self-locks, and changelog entries need a human. The
//! dialogs themselves live outside the core (tray/console/web); handlers
//! block on whatever implementation was injected. Tests stub it.

use async_trait::async_trait;

/// Outcome of a sync-conflict dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Overwrite the server with local files.
    KeepLocal,
    /// Overwrite local files with the server copy.
    KeepRemote,
    /// Leave both sides alone.
    Skip,
}

/// Outcome of the "a previous sync left a lock behind" dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfLockChoice {
    /// Continue under the existing lock.
    Proceed,
    /// Steal the lock and continue.
    Override,
    /// Bail out of the operation.
    Abort,
}

/// Blocking questions the sync flow can ask the user.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// Both sides changed; which one survives?
    async fn conflict(&self, song: &str) -> ConflictChoice;

    /// A song is archived and cannot be pushed; pull the server copy
    /// instead? `false` skips the song.
    async fn archived_pull(&self, song: &str) -> bool;

    /// A lock we supposedly hold already exists (crashed sync?).
    async fn self_lock(&self, target: &str) -> SelfLockChoice;

    /// One-line summary of local changes for the changelog; `None` skips
    /// the entry.
    async fn changelog(&self, song: &str) -> Option<String>;
}

/// Fixed-answer prompt for tests and headless defaults.
pub struct StaticPrompt {
    pub conflict: ConflictChoice,
    pub archived_pull: bool,
    pub self_lock: SelfLockChoice,
    pub changelog: Option<String>,
}

impl Default for StaticPrompt {
    fn default() -> Self {
        Self {
            conflict: ConflictChoice::Skip,
            archived_pull: false,
            self_lock: SelfLockChoice::Abort,
            changelog: None,
        }
    }
}

#[async_trait]
impl UserPrompt for StaticPrompt {
    async fn conflict(&self, _song: &str) -> ConflictChoice {
        self.conflict
    }

    async fn archived_pull(&self, _song: &str) -> bool {
        self.archived_pull
    }

    async fn self_lock(&self, _target: &str) -> SelfLockChoice {
        self.self_lock
    }

    async fn changelog(&self, _song: &str) -> Option<String> {
        self.changelog.clone()
    }
}

//! Cooperative locking protocol.
//!
//! Locks are owned by the metadata service; this module wraps the
//! request/hold/release choreography: crash-recovery when a stale "self"
//! lock is found, silent override of expired checkouts, and the
//! project-then-song dance that serializes single-song work against whole
//! project syncs.

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use studiosync_api::{LockOptions, LockTarget, MetadataClient};
use studiosync_common::{Error, Lock, LockStatus, Result, Song};

use crate::prompt::{SelfLockChoice, UserPrompt};

/// Checkout duration offered by the TUI flow.
const CHECKOUT_HOURS: i64 = 8;

/// Why a lock is being taken; determines reason and expiry.
#[derive(Debug, Clone, Copy)]
pub enum LockIntent {
    /// Held for the duration of one sync.
    Sync,
    /// Long-held studio checkout with an expiry.
    Checkout,
    /// Long-held song checkout taken by `workon`, no expiry.
    WorkOn,
}

impl LockIntent {
    fn options(&self) -> LockOptions {
        match self {
            LockIntent::Sync => LockOptions::reason("sync"),
            LockIntent::Checkout => LockOptions {
                reason: Some("checkout".to_string()),
                until: Some(Utc::now() + Duration::hours(CHECKOUT_HOURS)),
                force: false,
            },
            LockIntent::WorkOn => LockOptions::reason("Checked out"),
        }
    }
}

/// Acquire a lock, handling stale-self and expired holders.
///
/// # Errors
/// - `LockDenied` carrying the server's lock payload when another user
///   holds the target (or the user aborted recovery)
pub async fn acquire(
    api: &MetadataClient,
    prompt: &dyn UserPrompt,
    target: LockTarget,
    display_name: &str,
    intent: LockIntent,
) -> Result<Lock> {
    let options = intent.options();
    let lock = api.lock(target, &options).await?;

    if lock.granted() {
        debug!(target = display_name, "lock granted");
        return Ok(lock);
    }

    match lock.status {
        LockStatus::Locked if lock.held_by_self() => {
            // A previous sync crashed while holding this.
            warn!(target = display_name, "found our own stale lock");
            match prompt.self_lock(display_name).await {
                SelfLockChoice::Proceed => Ok(lock),
                SelfLockChoice::Override => {
                    let forced = LockOptions { force: true, ..options };
                    api.lock(target, &forced).await
                }
                SelfLockChoice::Abort => Err(Error::LockDenied(Box::new(lock))),
            }
        }
        LockStatus::Locked if lock.expired(Utc::now()) => {
            // The server should have cleaned this up; take it over.
            info!(
                target = display_name,
                holder = lock.holder(),
                "overriding expired checkout"
            );
            let forced = LockOptions { force: true, ..options };
            api.lock(target, &forced).await
        }
        LockStatus::Locked => {
            debug!(
                target = display_name,
                holder = lock.holder(),
                since = ?lock.since,
                until = ?lock.until,
                "lock denied"
            );
            Err(Error::LockDenied(Box::new(lock)))
        }
        LockStatus::Unlocked => Ok(lock),
    }
}

/// Release a lock; warns rather than fails when the server disagrees about
/// the current state.
pub async fn release(api: &MetadataClient, target: LockTarget, display_name: &str) -> Result<()> {
    let unlocked = api.unlock(target, false).await?;
    match unlocked.status {
        LockStatus::Unlocked => {
            debug!(target = display_name, "unlocked");
        }
        LockStatus::Locked => {
            warn!(
                target = display_name,
                holder = unlocked.holder(),
                "could not release lock"
            );
        }
    }
    Ok(())
}

/// Take an 8-hour studio checkout on a project.
pub async fn checkout(
    api: &MetadataClient,
    prompt: &dyn UserPrompt,
    project_id: i64,
    project_name: &str,
) -> Result<Lock> {
    acquire(api, prompt, LockTarget::Project(project_id), project_name, LockIntent::Checkout).await
}

/// Lock a single song for exclusive work.
///
/// The parent project is locked first (serializing against batch syncers),
/// then the song, then the project lock is dropped. The song lock stays
/// held; `workdone` releases it.
///
/// # Errors
/// - `LockDenied` from the project, or from the song (project lock is
///   released before returning)
pub async fn acquire_song(
    api: &MetadataClient,
    prompt: &dyn UserPrompt,
    project_name: &str,
    song: &Song,
) -> Result<Lock> {
    let project_target = LockTarget::Project(song.project);
    acquire(api, prompt, project_target, project_name, LockIntent::Sync).await?;

    let song_target = LockTarget::Song { project: song.project, song: song.id };
    let song_lock = match acquire(api, prompt, song_target, &song.name, LockIntent::WorkOn).await {
        Ok(lock) => lock,
        Err(e) => {
            release(api, project_target, project_name).await?;
            return Err(e);
        }
    };

    release(api, project_target, project_name).await?;
    Ok(song_lock)
}

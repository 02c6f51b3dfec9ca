//! The per-song reconciliation decision.

use tracing::debug;

use studiosync_common::{Song, SongState, Verdict};

/// Decide what to do for one song.
///
/// `local_hash` is the project-root digest of the local song directory
/// (`None` when there is no local copy); `state` is the durable baseline
/// from the last successful sync; `song.revision` is the authoritative
/// server counter.
///
/// | condition                                  | verdict  |
/// |--------------------------------------------|----------|
/// | no local copy                              | REMOTE   |
/// | same revision, local hash == known         | NONE     |
/// | same revision, local hash != known         | LOCAL    |
/// | newer remote revision, local unchanged     | REMOTE   |
/// | newer remote revision, local changed       | CONFLICT |
/// | older remote revision                      | LOCAL    |
pub fn verdict(state: &SongState, song: &Song, local_hash: Option<&str>) -> Verdict {
    debug!(
        song = %song.name,
        local_revision = state.revision,
        remote_revision = song.revision,
        "computing verdict"
    );

    let Some(local) = local_hash else {
        debug!(song = %song.name, "no local copy");
        return Verdict::Remote;
    };
    let local_changed = local != state.known_hash;

    if song.revision == state.revision {
        if local_changed {
            Verdict::Local
        } else {
            Verdict::None
        }
    } else if song.revision > state.revision {
        if local_changed {
            Verdict::Conflict
        } else {
            Verdict::Remote
        }
    } else {
        // A push bumped our state past the server; the receipt or the
        // server-side counter is still catching up.
        Verdict::Local
    }
}

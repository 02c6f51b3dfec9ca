//! Client-update feed handling.

use semver::Version;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use studiosync_common::{ClientUpdate, Command, CommandRequest};

/// How often the background checker looks for new builds.
const CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Host tag the update feed is filtered by, e.g. `x86_64-linux`.
pub fn host_tag() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Pick the newest feed entry strictly ahead of the running version.
///
/// Entries with unparseable versions are skipped.
pub fn newest_applicable(updates: &[ClientUpdate], current: &str) -> Option<ClientUpdate> {
    let current = Version::parse(current).ok()?;
    updates
        .iter()
        .filter_map(|update| {
            let version = Version::parse(&update.version)
                .map_err(|e| debug!(version = %update.version, error = %e, "bad feed version"))
                .ok()?;
            (version > current).then_some((version, update))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, update)| update.clone())
}

/// Periodically enqueue an `update` command on the dispatcher.
///
/// Runs forever; routing through the queue keeps the check serialized with
/// everything else.
pub fn spawn_update_checker(requests: UnboundedSender<CommandRequest>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        // The startup check is enqueued by main; skip the immediate tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("running periodic update check");
            if requests.send(CommandRequest::new(Command::Update)).is_err() {
                warn!("dispatcher gone, stopping update checker");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(version: &str) -> ClientUpdate {
        ClientUpdate {
            version: version.to_string(),
            package: format!("https://example.com/studiosync-{}.zip", version),
            target: None,
        }
    }

    #[test]
    fn test_newest_applicable_picks_highest() {
        let feed = vec![update("0.1.1"), update("0.3.0"), update("0.2.0")];
        let picked = newest_applicable(&feed, "0.1.0").unwrap();
        assert_eq!(picked.version, "0.3.0");
    }

    #[test]
    fn test_current_version_is_not_applicable() {
        let feed = vec![update("0.1.0")];
        assert!(newest_applicable(&feed, "0.1.0").is_none());
        assert!(newest_applicable(&feed, "0.2.0").is_none());
    }

    #[test]
    fn test_garbage_versions_are_skipped() {
        let feed = vec![update("not-a-version"), update("0.2.0")];
        let picked = newest_applicable(&feed, "0.1.0").unwrap();
        assert_eq!(picked.version, "0.2.0");
    }

    #[test]
    fn test_host_tag_shape() {
        let tag = host_tag();
        assert!(tag.contains('-'));
    }
}

//! Durable local state for StudioSync.
//!
//! One SQLite database under the per-OS application-data directory holds
//! everything the daemon must remember across restarts: application
//! settings, auth tokens, per-song sync state, and the audio watcher's
//! per-path bookkeeping.

pub mod store;

pub use store::{AppStore, AudioFileRecord, Settings};

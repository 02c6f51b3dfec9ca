//! StudioSync reconciliation engine.
//!
//! This crate decides, per song, whether local wins, remote wins, the user
//! must choose, or nothing needs to happen, and then moves the minimal set
//! of files through the object store:
//! - Streaming MD5 hashing and directory manifests
//! - The verdict function over `{local hash, known hash, remote revision}`
//! - The transfer orchestrator with its worker pool and state commit
//! - The cooperative locking protocol against the metadata service
//! - Shared amp-preset subtree sync

pub mod amps;
pub mod engine;
pub mod locks;
pub mod prompt;
pub mod scan;
pub mod verdict;

pub use amps::sync_amps;
pub use engine::{ChangelogMode, EngineConfig, ProjectSyncReport, SongOutcome, SyncEngine};
pub use locks::{acquire, acquire_song, checkout, release, LockIntent};
pub use prompt::{ConflictChoice, SelfLockChoice, StaticPrompt, UserPrompt};
pub use scan::{hash_file, hash_project_root, Manifest, ManifestScanner, ParallelScanner, SerialScanner};
pub use verdict::verdict;

//! Common types shared across StudioSync modules.
//!
//! This crate holds the foundational pieces every other crate builds on:
//! the error type, the domain entities mirrored from the metadata service,
//! the command/status message types flowing between the local HTTP endpoint
//! and the dispatcher, and object-key helpers for the project bucket layout.

pub mod error;
pub mod keys;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use keys::ObjectKey;
pub use message::{Command, CommandRequest, StatusBody, StatusEvent, SyncTarget};
pub use types::{ClientUpdate, Lock, LockStatus, Project, ProjectRef, Song, SongRef, SongState, Verdict};

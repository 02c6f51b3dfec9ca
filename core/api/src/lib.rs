//! HTTPS client for the StudioSync control API.
//!
//! Everything the daemon knows about projects, songs, locks, receipts, the
//! update feed, and object-store credentials comes through here. The client
//! owns the token pair and transparently refreshes it once on a 403; a 401
//! means the refresh token itself is dead and the caller must re-login.

pub mod client;

pub use client::{BackendCredentials, LockOptions, LockTarget, MetadataClient};

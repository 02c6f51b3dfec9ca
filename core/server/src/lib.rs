//! Loopback HTTP command endpoint.
//!
//! The companion web UI talks to the daemon through `127.0.0.1:5000`.
//! Every command route pins the `Referer` to the companion origin and
//! verifies the `data` parameter as an RS256 JWT signed by the companion's
//! key; anything off is a plain 403. Verified payloads become queued
//! commands; `/api/results` drains the status events back out.

pub mod routes;

pub use routes::{probe_running_instance, router, serve, ServerConfig};

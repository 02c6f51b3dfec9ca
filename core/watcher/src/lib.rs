//! Near-real-time audio render uploader.
//!
//! Watches the configured audio directory recursively and streams changed
//! files to the audio bucket at `<project_name>/<basename>`, where the
//! project name is the file's parent directory. A per-path hash store
//! suppresses re-uploads, a settle window waits out writers that are still
//! flushing, and a rate limit keeps render-while-playing loops from
//! hammering the bucket. The event loop is supervised: if it dies it is
//! restarted.

pub mod watch;

pub use watch::{AudioWatcher, WatcherConfig};

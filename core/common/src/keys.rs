//! Object-store key handling for the project bucket layout.
//!
//! Keys are `/`-separated relative paths. The legacy Windows client wrote
//! some keys with `\` separators; those are normalized on read, and every
//! key we write uses `/`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// A normalized key inside an object-store bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Build a key from a relative path, normalizing separators.
    ///
    /// # Errors
    /// - Empty input, or input that normalizes to empty
    pub fn new(key: impl AsRef<str>) -> Result<Self> {
        let normalized = key
            .as_ref()
            .replace('\\', "/")
            .trim_matches('/')
            .to_string();
        if normalized.is_empty() {
            return Err(Error::InvalidInput("object key cannot be empty".to_string()));
        }
        Ok(Self(normalized))
    }

    /// Append a child component.
    pub fn join(&self, child: &str) -> Result<Self> {
        Self::new(format!("{}/{}", self.0, child))
    }

    /// The final path component.
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prefix under which a song's files live: `<project_id>/<song_id>/`.
pub fn song_prefix(project_id: i64, song_id: i64) -> String {
    format!("{}/{}/", project_id, song_id)
}

/// Prefix for one amp's shared presets:
/// `<project_id>/Amp Settings/<amp>/`.
pub fn amp_prefix(project_id: i64, amp: &str) -> String {
    format!("{}/Amp Settings/{}/", project_id, amp)
}

/// Flat audio-bucket key: `<project_name>/<filename>`.
pub fn audio_key(project_name: &str, file_name: &str) -> Result<ObjectKey> {
    ObjectKey::new(format!("{}/{}", project_name, file_name))
}

/// Strip a listing prefix from a full key, yielding the manifest-relative
/// part. Returns `None` when the key does not live under the prefix.
pub fn strip_prefix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

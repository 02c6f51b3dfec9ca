//! Log shipping support.

use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use studiosync_common::{Error, Result};

/// Compress the live log file into an in-memory zip archive.
pub fn zip_log(log_path: &Path) -> Result<Vec<u8>> {
    let content = std::fs::read(log_path)?;

    let mut buffer = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(&mut buffer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let name = log_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "studiosync.log".to_string());

    writer
        .start_file(name, options)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    writer.write_all(&content)?;
    writer.finish().map_err(|e| Error::Io(std::io::Error::other(e)))?;

    Ok(buffer.into_inner())
}

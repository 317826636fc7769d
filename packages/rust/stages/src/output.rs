//! Atomic output writers.
//!
//! Every stage output is written to a hidden temp file next to its target and
//! renamed into place, so a failed stage never leaves a half-written file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use spamflow_shared::{Result, SpamflowError};

/// Stream into `path` through `fill`, then rename into place.
///
/// The temp file is removed if `fill` fails.
pub fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SpamflowError::write(parent, e))?;
    }

    let temp = temp_path(path);
    let result = (|| {
        let file = File::create(&temp).map_err(|e| SpamflowError::write(&temp, e))?;
        let mut writer = BufWriter::new(file);
        fill(&mut writer)?;
        writer.flush().map_err(|e| SpamflowError::write(&temp, e))?;
        std::fs::rename(&temp, path).map_err(|e| SpamflowError::write(path, e))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result?;

    debug!(path = %path.display(), "wrote output");
    Ok(())
}

/// Delete whatever exists at `paths` under `root`, files or directories.
///
/// Used after a failed stage so none of its outputs survive. Removal errors
/// are logged and otherwise ignored.
pub fn remove_outputs<'a>(root: &Path, paths: impl IntoIterator<Item = &'a str>) {
    for out in paths {
        let path = root.join(out);
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if path.exists() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        match removed {
            Ok(()) => debug!(path = %path.display(), "removed output of failed stage"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not remove output of failed stage")
            }
        }
    }
}

/// Write a compact JSON document atomically.
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    write_atomic(path, |w| {
        serde_json::to_writer(&mut *w, data).map_err(|e| {
            SpamflowError::validation(format!("JSON serialization failed: {e}"))
        })
    })
}

/// Write a pretty-printed JSON document atomically, with a trailing newline.
pub fn write_json_pretty<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    write_atomic(path, |w| {
        serde_json::to_writer_pretty(&mut *w, data).map_err(|e| {
            SpamflowError::validation(format!("JSON serialization failed: {e}"))
        })?;
        w.write_all(b"\n").map_err(|e| SpamflowError::write(path, e))
    })
}

/// Read and deserialize a JSON document.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read(path).map_err(|e| SpamflowError::io(path, e))?;
    serde_json::from_slice(&content)
        .map_err(|e| SpamflowError::validation(format!("invalid JSON in {}: {e}", path.display())))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    path.with_file_name(format!(".{name}.tmp"))
}

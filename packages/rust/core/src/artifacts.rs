//! Content-addressed artifact store.
//!
//! Objects are stored under their SHA-256 as `<remote>/<aa>/<remaining 62 hex>`.
//! Pushing the same bytes twice is a no-op, and pulled bytes are re-hashed
//! before they replace the destination.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use spamflow_shared::{PipelineDocument, Result, SpamflowError};

use crate::fingerprint::{DIR_PREFIX, hash_file, hex};
use crate::lock::LockFile;

/// Lowercase hex SHA-256 of an object's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress(String);

impl ContentAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative location inside a store.
    fn object_path(&self) -> PathBuf {
        let (prefix, rest) = self.0.split_at(2);
        PathBuf::from(prefix).join(rest)
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentAddress {
    type Err = SpamflowError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(SpamflowError::validation(format!(
                "'{s}' is not a SHA-256 content address"
            )))
        }
    }
}

/// Push/pull contract for tracked artifacts.
pub trait ArtifactStore {
    /// Store the file at `path` and return its address.
    fn push(&self, path: &Path) -> Result<ContentAddress>;

    /// Write the object at `address` to `dest`, verifying its hash.
    fn pull(&self, address: &ContentAddress, dest: &Path) -> Result<PathBuf>;

    fn contains(&self, address: &ContentAddress) -> bool;
}

/// A store rooted at a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalRemote {
    root: PathBuf,
}

impl LocalRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object(&self, address: &ContentAddress) -> PathBuf {
        self.root.join(address.object_path())
    }
}

/// Copy `src` to a temp file beside `dest`, hashing on the way, then rename.
///
/// When `expected` is set and the hash differs, nothing is written.
fn copy_verified(
    src: &Path,
    dest: &Path,
    expected: Option<&ContentAddress>,
) -> Result<ContentAddress> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SpamflowError::write(parent, e))?;
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dest.with_file_name(format!(".{name}.tmp"));

    let result = (|| {
        let mut reader = BufReader::new(File::open(src).map_err(|e| SpamflowError::io(src, e))?);
        let mut writer =
            BufWriter::new(File::create(&temp).map_err(|e| SpamflowError::write(&temp, e))?);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(|e| SpamflowError::io(src, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer
                .write_all(&buf[..n])
                .map_err(|e| SpamflowError::write(&temp, e))?;
        }
        writer.flush().map_err(|e| SpamflowError::write(&temp, e))?;
        drop(writer);

        let actual = ContentAddress(hex(&hasher.finalize()));
        if let Some(expected) = expected.filter(|e| **e != actual) {
            return Err(SpamflowError::validation(format!(
                "object {expected} is corrupt: content hashes to {actual}"
            )));
        }
        std::fs::rename(&temp, dest).map_err(|e| SpamflowError::write(dest, e))?;
        Ok(actual)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

impl ArtifactStore for LocalRemote {
    #[instrument(skip(self), fields(remote = %self.root.display()))]
    fn push(&self, path: &Path) -> Result<ContentAddress> {
        let address = ContentAddress(hash_file(path)?);
        let object = self.object(&address);
        if object.exists() {
            debug!(%address, "object already present");
            return Ok(address);
        }
        copy_verified(path, &object, Some(&address))?;
        debug!(%address, "object stored");
        Ok(address)
    }

    #[instrument(skip(self), fields(remote = %self.root.display()))]
    fn pull(&self, address: &ContentAddress, dest: &Path) -> Result<PathBuf> {
        let object = self.object(address);
        if !object.exists() {
            return Err(SpamflowError::InputMissing { path: object });
        }
        copy_verified(&object, dest, Some(address))?;
        Ok(dest.to_path_buf())
    }

    fn contains(&self, address: &ContentAddress) -> bool {
        self.object(address).is_file()
    }
}

/// Resolve the remote directory: explicit override, else `[remote] path`.
///
/// Relative paths are taken from the project root.
pub fn resolve_remote(
    doc: &PipelineDocument,
    override_path: Option<&Path>,
    root: &Path,
) -> Result<LocalRemote> {
    let path = match (override_path, doc.remote.as_ref()) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(remote)) => PathBuf::from(&remote.path),
        (None, None) => {
            return Err(SpamflowError::config(
                "no remote configured: set [remote] path in pipeline.toml or SPAMFLOW_REMOTE",
            ));
        }
    };
    Ok(LocalRemote::new(if path.is_absolute() {
        path
    } else {
        root.join(path)
    }))
}

/// Outcome of a bulk push or pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Objects copied.
    pub transferred: usize,
    /// Objects already in place.
    pub unchanged: usize,
    /// Outputs that could not be handled (directories, missing files).
    pub skipped: Vec<String>,
}

/// Push every output recorded in the lock file. Metrics files are never
/// recorded as outputs, so they are never pushed.
pub fn push_outputs(
    store: &dyn ArtifactStore,
    root: &Path,
    lock: &LockFile,
) -> Result<TransferSummary> {
    let mut summary = TransferSummary::default();
    for (stage, entry) in &lock.stages {
        for (out, recorded) in &entry.outs {
            let path = root.join(out);
            if recorded.starts_with(DIR_PREFIX) || !path.is_file() {
                warn!(%stage, %out, "output is not a file on disk, skipping");
                summary.skipped.push(out.clone());
                continue;
            }
            let address: ContentAddress = recorded.parse()?;
            if store.contains(&address) {
                summary.unchanged += 1;
                continue;
            }
            let pushed = store.push(&path)?;
            if pushed != address {
                warn!(%stage, %out, "output changed since it was recorded");
            }
            summary.transferred += 1;
        }
    }
    info!(
        transferred = summary.transferred,
        unchanged = summary.unchanged,
        "push complete"
    );
    Ok(summary)
}

/// Restore every output recorded in the lock file.
pub fn pull_outputs(
    store: &dyn ArtifactStore,
    root: &Path,
    lock: &LockFile,
) -> Result<TransferSummary> {
    let mut summary = TransferSummary::default();
    for entry in lock.stages.values() {
        for (out, recorded) in &entry.outs {
            if recorded.starts_with(DIR_PREFIX) {
                warn!(%out, "directory outputs are not stored, skipping");
                summary.skipped.push(out.clone());
                continue;
            }
            let address: ContentAddress = recorded.parse()?;
            let dest = root.join(out);
            if dest.is_file() && hash_file(&dest)? == address.as_str() {
                summary.unchanged += 1;
                continue;
            }
            store.pull(&address, &dest)?;
            summary.transferred += 1;
        }
    }
    info!(
        transferred = summary.transferred,
        unchanged = summary.unchanged,
        "pull complete"
    );
    Ok(summary)
}

//! Stage fingerprints and content hashing.
//!
//! A fingerprint covers the command text, the content of every dep, and the
//! value of every consumed parameter. Two runs with the same fingerprint are
//! expected to produce the same outputs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use spamflow_shared::{ParamsDocument, Result, SpamflowError, StageDef};

/// Recorded in place of a hash for a dep that does not exist.
pub const MISSING: &str = "missing";

/// Everything a stage fingerprint is computed from, plus the digest itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub digest: String,
    pub cmd: String,
    /// Dep path → content hash (or [`MISSING`]).
    pub deps: BTreeMap<String, String>,
    /// Dotted parameter key → value.
    pub params: BTreeMap<String, Value>,
}

/// Lowercase hex SHA-256 of a file's bytes.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SpamflowError::io(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| SpamflowError::io(path, e))?;
    Ok(hex(&hasher.finalize()))
}

/// Hash a file, or a directory as the sorted list of its relative paths and
/// file hashes. `None` when nothing exists at `path`.
pub fn hash_path(path: &Path) -> Result<Option<String>> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SpamflowError::io(path, e)),
    };
    if meta.is_file() {
        return hash_file(path).map(Some);
    }

    let mut files = Vec::new();
    collect_files(path, path, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for rel in &files {
        hasher.update(rel.as_bytes());
        hasher.update([0]);
        hasher.update(hash_file(&path.join(rel))?.as_bytes());
        hasher.update([b'\n']);
    }
    Ok(Some(hex(&hasher.finalize())))
}

/// Marks a recorded output hash that belongs to a directory.
pub const DIR_PREFIX: &str = "dir:";

/// Hash of a produced output as recorded in the lock file: the content
/// address for a file, [`DIR_PREFIX`] plus the tree hash for a directory.
pub fn output_hash(path: &Path) -> Result<Option<String>> {
    if path.is_dir() {
        Ok(hash_path(path)?.map(|h| format!("{DIR_PREFIX}{h}")))
    } else {
        hash_path(path)
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| SpamflowError::io(dir, e))? {
        let entry = entry.map_err(|e| SpamflowError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compute the fingerprint of `stage` against the files under `root`.
pub fn compute(stage: &StageDef, root: &Path, params: &ParamsDocument) -> Result<Fingerprint> {
    let mut deps = BTreeMap::new();
    for dep in &stage.deps {
        let hash = hash_path(&root.join(dep))?.unwrap_or_else(|| MISSING.to_string());
        deps.insert(dep.clone(), hash);
    }

    let mut values = BTreeMap::new();
    for key in &stage.params {
        let value = params.lookup(key).ok_or_else(|| {
            SpamflowError::config(format!(
                "stage '{}' consumes unknown parameter '{key}'",
                stage.name
            ))
        })?;
        values.insert(key.clone(), value.clone());
    }

    let mut hasher = Sha256::new();
    hasher.update(b"cmd\0");
    hasher.update(stage.cmd.as_bytes());
    for (path, hash) in &deps {
        hasher.update(b"\0dep\0");
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(hash.as_bytes());
    }
    for (key, value) in &values {
        hasher.update(b"\0param\0");
        hasher.update(key.as_bytes());
        hasher.update([0]);
        // serde_json maps are key-sorted, so this is canonical
        hasher.update(value.to_string().as_bytes());
    }

    Ok(Fingerprint {
        digest: hex(&hasher.finalize()),
        cmd: stage.cmd.clone(),
        deps,
        params: values,
    })
}

//! The lock file (`pipeline.lock`): last known state of every stage.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use spamflow_shared::{Result, SpamflowError};
use spamflow_stages::output::write_json_pretty;

use crate::fingerprint::Fingerprint;

const LOCK_VERSION: u32 = 1;

/// Per-stage lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Stale,
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stale => "stale",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        })
    }
}

/// What the runner recorded for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    pub state: StageState,
    pub fingerprint: String,
    pub cmd: String,
    #[serde(default)]
    pub deps: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Output path → content hash. Filled on success only.
    #[serde(default)]
    pub outs: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl LockEntry {
    pub fn new(state: StageState, fp: &Fingerprint) -> Self {
        Self {
            state,
            fingerprint: fp.digest.clone(),
            cmd: fp.cmd.clone(),
            deps: fp.deps.clone(),
            params: fp.params.clone(),
            outs: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Root of `pipeline.lock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
    pub version: u32,
    #[serde(default)]
    pub stages: BTreeMap<String, LockEntry>,
}

impl Default for LockFile {
    fn default() -> Self {
        Self {
            version: LOCK_VERSION,
            stages: BTreeMap::new(),
        }
    }
}

impl LockFile {
    /// Load the lock file, or an empty one if it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(SpamflowError::io(path, e)),
        };
        let lock: Self = serde_json::from_str(&content).map_err(|e| {
            SpamflowError::config(format!("invalid lock file {}: {e}", path.display()))
        })?;
        if lock.version != LOCK_VERSION {
            return Err(SpamflowError::config(format!(
                "unsupported lock file version {} (expected {LOCK_VERSION})",
                lock.version
            )));
        }
        Ok(lock)
    }

    /// Write atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_pretty(path, self)
    }

    pub fn get(&self, stage: &str) -> Option<&LockEntry> {
        self.stages.get(stage)
    }

    pub fn set(&mut self, stage: &str, entry: LockEntry) {
        self.stages.insert(stage.to_string(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            digest: "f".repeat(64),
            cmd: "spamflow stage preprocessing".into(),
            deps: BTreeMap::from([("data/raw/train.csv".into(), "a".repeat(64))]),
            params: BTreeMap::from([("preprocessing.lowercase".into(), Value::Bool(true))]),
        }
    }

    #[test]
    fn missing_file_is_empty_lock() {
        let path = std::env::temp_dir()
            .join(format!("spamflow_lock_{}.lock", uuid::Uuid::now_v7()));
        let lock = LockFile::load(&path).unwrap();
        assert!(lock.stages.is_empty());
    }

    #[test]
    fn save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("spamflow_lock_{}.lock", uuid::Uuid::now_v7()));
        let mut lock = LockFile::default();
        let mut entry = LockEntry::new(StageState::Success, &fingerprint());
        entry.outs.insert("data/interim/train_processed.csv".into(), "b".repeat(64));
        lock.set("preprocessing", entry.clone());
        lock.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"state\": \"success\""));
        assert_eq!(LockFile::load(&path).unwrap().get("preprocessing"), Some(&entry));
    }

    #[test]
    fn rejects_unknown_version() {
        let path = std::env::temp_dir()
            .join(format!("spamflow_lock_{}.lock", uuid::Uuid::now_v7()));
        std::fs::write(&path, r#"{"version": 99, "stages": {}}"#).unwrap();
        assert!(matches!(LockFile::load(&path), Err(SpamflowError::Config { .. })));
    }
}

//! Pipeline orchestration for spamflow.
//!
//! This crate turns a `pipeline.toml` into a validated DAG and brings it up
//! to date: fingerprinting each stage, executing the stale ones, recording
//! state in `pipeline.lock`, and moving tracked outputs to and from an
//! artifact store.

pub mod artifacts;
pub mod dag;
pub mod executor;
pub mod fingerprint;
pub mod lock;
pub mod runner;
pub mod stage_log;

pub use artifacts::{ArtifactStore, ContentAddress, LocalRemote, TransferSummary};
pub use dag::Dag;
pub use executor::{BuiltinExecutor, ShellExecutor, StageExecutor};
pub use lock::{LockEntry, LockFile, StageState};
pub use runner::{
    Pipeline, RunObserver, RunOptions, RunReport, Runner, SilentProgress, StageOutcome, StageRun,
    StageStatus, StaleReason, status,
};
pub use stage_log::StageLogLayer;

//! Conventional file layout of a spamflow project, relative to its root.
//!
//! The built-in stages read and write these paths; the default pipeline
//! document declares the same paths as deps and outs.

pub const RAW_TRAIN: &str = "data/raw/train.csv";
pub const RAW_TEST: &str = "data/raw/test.csv";

pub const INTERIM_TRAIN: &str = "data/interim/train_processed.csv";
pub const INTERIM_TEST: &str = "data/interim/test_processed.csv";

pub const FEATURES_TRAIN: &str = "data/processed/train_tfidf.csv";
pub const FEATURES_TEST: &str = "data/processed/test_tfidf.csv";

pub const VECTORIZER: &str = "models/vectorizer.json";
pub const MODEL: &str = "models/model.json";

pub const METRICS: &str = "reports/metrics.json";

/// Directory holding one append-only log per stage.
pub const LOG_DIR: &str = "logs";

pub const LOCK_FILE: &str = "pipeline.lock";

pub const EXPERIMENTS_DB: &str = ".spamflow/experiments.db";

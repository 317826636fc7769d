//! The five pipeline stages of spamflow.
//!
//! Each stage reads its inputs from the conventional [`layout`] under a
//! project root, writes its outputs atomically, and returns a summary:
//! - [`ingest`]: source dataset → seeded train/test split
//! - [`preprocess`]: text normalization
//! - [`features`]: TF-IDF feature tables (vectorizer in [`tfidf`])
//! - [`classifier`]: model training
//! - [`evaluate`]: held-out metrics (formulas in [`metrics`])
//!
//! [`layout`]: spamflow_shared::layout

pub mod classifier;
pub mod dataset;
pub mod evaluate;
pub mod features;
pub mod ingest;
pub mod metrics;
pub mod output;
pub mod preprocess;
pub mod tfidf;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::info_span;

use spamflow_shared::{Algorithm, MetricsReport, Params, Result, SpamflowError, layout};

pub use classifier::{Classifier, Model};
pub use features::{FeatureSummary, FeatureTable, SparseRow};
pub use ingest::IngestSummary;
pub use tfidf::{FittedTfidf, TfidfVectorizer};

/// Built-in stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    DataIngestion,
    Preprocessing,
    FeatureEngineering,
    ModelBuilding,
    ModelEvaluation,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        Self::DataIngestion,
        Self::Preprocessing,
        Self::FeatureEngineering,
        Self::ModelBuilding,
        Self::ModelEvaluation,
    ];

    /// Stage name as used in `pipeline.toml` and parameter sections.
    pub fn name(self) -> &'static str {
        match self {
            Self::DataIngestion => "data_ingestion",
            Self::Preprocessing => "preprocessing",
            Self::FeatureEngineering => "feature_engineering",
            Self::ModelBuilding => "model_building",
            Self::ModelEvaluation => "model_evaluation",
        }
    }

    /// Paths under the project root this stage writes.
    pub fn outputs(self) -> &'static [&'static str] {
        match self {
            Self::DataIngestion => &[layout::RAW_TRAIN, layout::RAW_TEST],
            Self::Preprocessing => &[layout::INTERIM_TRAIN, layout::INTERIM_TEST],
            Self::FeatureEngineering => &[
                layout::FEATURES_TRAIN,
                layout::FEATURES_TEST,
                layout::VECTORIZER,
            ],
            Self::ModelBuilding => &[layout::MODEL],
            Self::ModelEvaluation => &[layout::METRICS],
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = SpamflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| SpamflowError::config(format!("unknown built-in stage '{s}'")))
    }
}

/// What a finished stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Ingested(IngestSummary),
    Preprocessed { train: usize, test: usize },
    Features(FeatureSummary),
    Trained(Algorithm),
    Evaluated(MetricsReport),
}

impl StageOutcome {
    pub fn metrics(&self) -> Option<&MetricsReport> {
        match self {
            Self::Evaluated(report) => Some(report),
            _ => None,
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingested(s) => write!(
                f,
                "{} rows ({} spam): {} train, {} test",
                s.total, s.spam, s.train, s.test
            ),
            Self::Preprocessed { train, test } => {
                write!(f, "normalized {train} train and {test} test rows")
            }
            Self::Features(s) => write!(
                f,
                "{} features for {} train and {} test rows",
                s.width, s.train_rows, s.test_rows
            ),
            Self::Trained(algorithm) => write!(f, "trained {algorithm}"),
            Self::Evaluated(report) => {
                let parts: Vec<String> =
                    report.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
                f.write_str(&parts.join(" "))
            }
        }
    }
}

/// Run one built-in stage under `root` with its parameter section.
///
/// Runs inside a `stage` span carrying the stage name, which the per-stage
/// log layer keys on. On failure every output of the stage is removed, so
/// a stage never leaves a mix of new and stale files behind. Errors are
/// returned, not logged; callers log them inside the same span.
pub fn run_stage(kind: StageKind, root: &Path, params: &Params) -> Result<StageOutcome> {
    let span = info_span!("stage", name = kind.name());
    let _guard = span.enter();

    let result = dispatch(kind, root, params);
    if result.is_err() {
        output::remove_outputs(root, kind.outputs().iter().copied());
    }
    result
}

fn dispatch(kind: StageKind, root: &Path, params: &Params) -> Result<StageOutcome> {
    match kind {
        StageKind::DataIngestion => {
            ingest::run(root, &params.data_ingestion).map(StageOutcome::Ingested)
        }
        StageKind::Preprocessing => preprocess::run(root, &params.preprocessing)
            .map(|(train, test)| StageOutcome::Preprocessed { train, test }),
        StageKind::FeatureEngineering => {
            features::run(root, &params.feature_engineering).map(StageOutcome::Features)
        }
        StageKind::ModelBuilding => classifier::run(root, &params.model_building)
            .map(|m| StageOutcome::Trained(m.algorithm())),
        StageKind::ModelEvaluation => {
            evaluate::run(root, &params.model_evaluation).map(StageOutcome::Evaluated)
        }
    }
}

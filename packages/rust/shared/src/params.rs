//! The parameter document (`params.toml`).
//!
//! Every stage reads the document at start-up; nothing writes it at runtime.
//! Typed sections are validated on load. The raw document is kept alongside so
//! the runner can fingerprint arbitrary dotted keys, including keys consumed
//! only by user-supplied shell stages.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SpamflowError};
use crate::types::MetricName;

/// Default parameter file name, relative to the project root.
pub const PARAMS_FILE_NAME: &str = "params.toml";

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

/// Typed view of the parameter document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub data_ingestion: DataIngestionParams,

    #[serde(default)]
    pub preprocessing: PreprocessingParams,

    #[serde(default)]
    pub feature_engineering: FeatureEngineeringParams,

    #[serde(default)]
    pub model_building: ModelBuildingParams,

    #[serde(default)]
    pub model_evaluation: ModelEvaluationParams,
}

/// `[data_ingestion]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataIngestionParams {
    /// Source dataset, relative to the project root.
    #[serde(default = "default_source")]
    pub source: String,

    /// Held-out fraction, exclusive range (0, 1).
    #[serde(default = "default_test_size")]
    pub test_size: f64,

    /// Seed for the train/test partition.
    #[serde(default = "default_random_state")]
    pub random_state: u64,
}

impl Default for DataIngestionParams {
    fn default() -> Self {
        Self {
            source: default_source(),
            test_size: default_test_size(),
            random_state: default_random_state(),
        }
    }
}

fn default_source() -> String {
    "data/external/spam.csv".into()
}
fn default_test_size() -> f64 {
    0.2
}
fn default_random_state() -> u64 {
    42
}

/// `[preprocessing]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingParams {
    #[serde(default = "default_true")]
    pub lowercase: bool,

    #[serde(default = "default_true")]
    pub remove_punctuation: bool,
}

impl Default for PreprocessingParams {
    fn default() -> Self {
        Self {
            lowercase: true,
            remove_punctuation: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Inclusive n-gram length range, serialized as `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NgramRange(pub usize, pub usize);

impl NgramRange {
    pub fn low(&self) -> usize {
        self.0
    }

    pub fn high(&self) -> usize {
        self.1
    }
}

/// `[feature_engineering]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEngineeringParams {
    /// Upper bound on vocabulary size (feature table width).
    #[serde(default = "default_max_features")]
    pub max_features: usize,

    #[serde(default = "default_ngram_range")]
    pub ngram_range: NgramRange,
}

impl Default for FeatureEngineeringParams {
    fn default() -> Self {
        Self {
            max_features: default_max_features(),
            ngram_range: default_ngram_range(),
        }
    }
}

fn default_max_features() -> usize {
    5000
}
fn default_ngram_range() -> NgramRange {
    NgramRange(1, 2)
}

/// Classifier selected by `model_building.algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[serde(alias = "LogisticRegression")]
    LogisticRegression,
    #[serde(alias = "MultinomialNB")]
    MultinomialNb,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LogisticRegression => f.write_str("logistic_regression"),
            Self::MultinomialNb => f.write_str("multinomial_nb"),
        }
    }
}

/// `[model_building]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBuildingParams {
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    /// Inverse regularization strength (logistic regression).
    #[serde(rename = "C", default = "default_c")]
    pub c: f64,

    /// Optimizer iteration cap (logistic regression).
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Additive smoothing (naive Bayes).
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

impl Default for ModelBuildingParams {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            c: default_c(),
            max_iter: default_max_iter(),
            alpha: default_alpha(),
        }
    }
}

fn default_algorithm() -> Algorithm {
    Algorithm::LogisticRegression
}
fn default_c() -> f64 {
    1.0
}
fn default_max_iter() -> usize {
    1000
}
fn default_alpha() -> f64 {
    1.0
}

/// `[model_evaluation]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluationParams {
    #[serde(default = "default_metrics")]
    pub metrics: BTreeSet<MetricName>,
}

impl Default for ModelEvaluationParams {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
        }
    }
}

fn default_metrics() -> BTreeSet<MetricName> {
    [
        MetricName::Accuracy,
        MetricName::Precision,
        MetricName::Recall,
        MetricName::F1,
    ]
    .into_iter()
    .collect()
}

impl Params {
    /// Check every range constraint. The first violation wins.
    pub fn validate(&self) -> Result<()> {
        let di = &self.data_ingestion;
        if di.source.trim().is_empty() {
            return Err(SpamflowError::out_of_range(
                "data_ingestion.source",
                "must not be empty",
            ));
        }
        if !(di.test_size.is_finite() && di.test_size > 0.0 && di.test_size < 1.0) {
            return Err(SpamflowError::out_of_range(
                "data_ingestion.test_size",
                format!("{} is not in (0, 1)", di.test_size),
            ));
        }

        let fe = &self.feature_engineering;
        if fe.max_features == 0 {
            return Err(SpamflowError::out_of_range(
                "feature_engineering.max_features",
                "must be positive",
            ));
        }
        let NgramRange(low, high) = fe.ngram_range;
        if low == 0 || low > high {
            return Err(SpamflowError::out_of_range(
                "feature_engineering.ngram_range",
                format!("[{low}, {high}] must satisfy 1 <= low <= high"),
            ));
        }

        let mb = &self.model_building;
        if !(mb.c.is_finite() && mb.c > 0.0) {
            return Err(SpamflowError::out_of_range(
                "model_building.C",
                format!("{} is not a positive number", mb.c),
            ));
        }
        if mb.max_iter == 0 {
            return Err(SpamflowError::out_of_range(
                "model_building.max_iter",
                "must be positive",
            ));
        }
        if !(mb.alpha.is_finite() && mb.alpha > 0.0) {
            return Err(SpamflowError::out_of_range(
                "model_building.alpha",
                format!("{} is not a positive number", mb.alpha),
            ));
        }

        if self.model_evaluation.metrics.is_empty() {
            return Err(SpamflowError::out_of_range(
                "model_evaluation.metrics",
                "at least one metric is required",
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document (typed + raw)
// ---------------------------------------------------------------------------

/// A loaded, validated parameter document.
#[derive(Debug, Clone)]
pub struct ParamsDocument {
    /// Typed sections with defaults applied.
    pub params: Params,
    /// Whole document as JSON, typed sections merged over the file's contents.
    raw: Value,
}

impl ParamsDocument {
    /// Load and validate `params.toml` at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SpamflowError::io(path, e))?;
        Self::parse(&content).map_err(|e| match e {
            SpamflowError::Config { message } => {
                SpamflowError::config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate a TOML parameter document.
    pub fn parse(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)
            .map_err(|e| SpamflowError::config(format!("failed to parse params: {e}")))?;
        let params: Params = toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e| SpamflowError::config(format!("invalid params: {e}")))?;
        params.validate()?;

        let mut raw = serde_json::to_value(&table)
            .map_err(|e| SpamflowError::config(e.to_string()))?;
        let typed =
            serde_json::to_value(&params).map_err(|e| SpamflowError::config(e.to_string()))?;
        merge(&mut raw, typed);

        Ok(Self { params, raw })
    }

    /// Build a document from typed params only.
    pub fn from_params(params: Params) -> Result<Self> {
        params.validate()?;
        let raw =
            serde_json::to_value(&params).map_err(|e| SpamflowError::config(e.to_string()))?;
        Ok(Self { params, raw })
    }

    /// Look up a dotted key such as `model_building.C`.
    pub fn lookup(&self, dotted: &str) -> Option<&Value> {
        dotted
            .split('.')
            .try_fold(&self.raw, |node, segment| node.get(segment))
    }

    /// Serialize the typed defaults as a TOML document.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Params::default())
            .map_err(|e| SpamflowError::config(e.to_string()))
    }

    /// Render the typed sections as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.params).map_err(|e| SpamflowError::config(e.to_string()))
    }
}

/// Overlay `overlay` onto `base`, recursing into objects.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        let params = Params::default();
        params.validate().expect("defaults validate");
        assert_eq!(params.feature_engineering.max_features, 5000);
        assert_eq!(params.model_evaluation.metrics.len(), 4);
    }

    #[test]
    fn defaults_roundtrip_through_toml() {
        let toml_str = ParamsDocument::default_toml().expect("serialize");
        assert!(toml_str.contains("test_size"));
        assert!(toml_str.contains("C = 1.0"));
        let doc = ParamsDocument::parse(&toml_str).expect("parse");
        assert_eq!(doc.params, Params::default());
    }

    #[test]
    fn partial_document_gets_defaults() {
        let doc = ParamsDocument::parse(
            r#"
[data_ingestion]
test_size = 0.25

[model_building]
algorithm = "LogisticRegression"
C = 0.5
"#,
        )
        .expect("parse");
        assert_eq!(doc.params.data_ingestion.test_size, 0.25);
        assert_eq!(doc.params.data_ingestion.random_state, 42);
        assert_eq!(doc.params.model_building.algorithm, Algorithm::LogisticRegression);
        assert_eq!(doc.params.model_building.c, 0.5);
        assert_eq!(
            doc.lookup("model_building.max_iter"),
            Some(&serde_json::json!(1000))
        );
    }

    #[test]
    fn lookup_keeps_unknown_keys() {
        let doc = ParamsDocument::parse(
            r#"
[custom]
threshold = 3
"#,
        )
        .expect("parse");
        assert_eq!(doc.lookup("custom.threshold"), Some(&serde_json::json!(3)));
        assert_eq!(
            doc.lookup("feature_engineering.ngram_range"),
            Some(&serde_json::json!([1, 2]))
        );
        assert!(doc.lookup("custom.missing").is_none());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases = [
            ("[data_ingestion]\ntest_size = 1.0", "data_ingestion.test_size"),
            ("[data_ingestion]\ntest_size = 0.0", "data_ingestion.test_size"),
            ("[feature_engineering]\nmax_features = 0", "feature_engineering.max_features"),
            ("[feature_engineering]\nngram_range = [2, 1]", "feature_engineering.ngram_range"),
            ("[model_building]\nC = -1.0", "model_building.C"),
            ("[model_building]\nmax_iter = 0", "model_building.max_iter"),
            ("[model_evaluation]\nmetrics = []", "model_evaluation.metrics"),
        ];
        for (doc, expected_key) in cases {
            match ParamsDocument::parse(doc) {
                Err(SpamflowError::ParameterOutOfRange { key, .. }) => {
                    assert_eq!(key, expected_key, "document: {doc}")
                }
                other => panic!("expected out-of-range for {doc}, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_algorithm_is_a_config_error() {
        let result = ParamsDocument::parse("[model_building]\nalgorithm = \"svm\"");
        assert!(matches!(result, Err(SpamflowError::Config { .. })));
    }

    #[test]
    fn unknown_metric_is_a_config_error() {
        let result = ParamsDocument::parse("[model_evaluation]\nmetrics = [\"mse\"]");
        assert!(matches!(result, Err(SpamflowError::Config { .. })));
    }
}

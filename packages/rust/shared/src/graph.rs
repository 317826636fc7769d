//! The pipeline graph document (`pipeline.toml`).
//!
//! ```toml
//! [remote]
//! path = "/mnt/artifacts"
//!
//! [[stages]]
//! name = "data_ingestion"
//! cmd = "spamflow stage data_ingestion"
//! deps = ["data/external/spam.csv"]
//! outs = ["data/raw/train.csv", "data/raw/test.csv"]
//! params = ["data_ingestion.test_size"]
//! ```
//!
//! This module only parses and checks the document's own shape. Edges, cycles
//! and output ownership are resolved by the DAG builder in `spamflow-core`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpamflowError};
use crate::layout;

/// Default graph file name, relative to the project root.
pub const PIPELINE_FILE_NAME: &str = "pipeline.toml";

/// One stage definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    /// Unique stage name.
    pub name: String,

    /// Command text. Part of the stage fingerprint.
    pub cmd: String,

    /// Files (or directories) the stage reads.
    #[serde(default)]
    pub deps: Vec<String>,

    /// Files the stage writes. Tracked and pushed to the artifact store.
    #[serde(default)]
    pub outs: Vec<String>,

    /// Dotted parameter keys the stage consumes.
    #[serde(default)]
    pub params: Vec<String>,

    /// Metrics report written by the stage. Never cached or pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
}

impl StageDef {
    /// Every path the stage must produce: `outs` followed by `metrics`.
    pub fn produced_paths(&self) -> impl Iterator<Item = &str> {
        self.outs
            .iter()
            .map(String::as_str)
            .chain(self.metrics.as_deref())
    }
}

/// `[remote]` section: where `push`/`pull` move artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Directory of the content-addressed store.
    pub path: String,
}

/// Root of `pipeline.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,

    #[serde(default)]
    pub stages: Vec<StageDef>,
}

impl PipelineDocument {
    /// Load and check `pipeline.toml` at `path`.
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

    /// Parse and check a TOML graph document.
    pub fn parse(content: &str) -> Result<Self> {
        let doc: Self = toml::from_str(content)
            .map_err(|e| SpamflowError::config(format!("failed to parse pipeline: {e}")))?;
        doc.check()?;
        Ok(doc)
    }

    /// Shape checks: at least one stage, names unique and non-empty, commands non-empty.
    pub fn check(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(SpamflowError::config("pipeline declares no [[stages]]"));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(SpamflowError::config("stage with empty name"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(SpamflowError::config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.cmd.trim().is_empty() {
                return Err(SpamflowError::config(format!(
                    "stage '{}' has an empty cmd",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Find a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The standard five-stage text-classification graph.
    pub fn standard(source: &str) -> Self {
        let stage = |name: &str, deps: &[&str], outs: &[&str], params: &[&str]| StageDef {
            name: name.into(),
            cmd: format!("spamflow stage {name}"),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            outs: outs.iter().map(|s| s.to_string()).collect(),
            params: params.iter().map(|s| s.to_string()).collect(),
            metrics: None,
        };

        let mut evaluation = stage(
            "model_evaluation",
            &[layout::MODEL, layout::FEATURES_TEST],
            &[],
            &["model_evaluation.metrics"],
        );
        evaluation.metrics = Some(layout::METRICS.into());

        Self {
            remote: None,
            stages: vec![
                stage(
                    "data_ingestion",
                    &[source],
                    &[layout::RAW_TRAIN, layout::RAW_TEST],
                    &[
                        "data_ingestion.source",
                        "data_ingestion.test_size",
                        "data_ingestion.random_state",
                    ],
                ),
                stage(
                    "preprocessing",
                    &[layout::RAW_TRAIN, layout::RAW_TEST],
                    &[layout::INTERIM_TRAIN, layout::INTERIM_TEST],
                    &["preprocessing.lowercase", "preprocessing.remove_punctuation"],
                ),
                stage(
                    "feature_engineering",
                    &[layout::INTERIM_TRAIN, layout::INTERIM_TEST],
                    &[
                        layout::FEATURES_TRAIN,
                        layout::FEATURES_TEST,
                        layout::VECTORIZER,
                    ],
                    &[
                        "feature_engineering.max_features",
                        "feature_engineering.ngram_range",
                    ],
                ),
                stage(
                    "model_building",
                    &[layout::FEATURES_TRAIN],
                    &[layout::MODEL],
                    &[
                        "model_building.algorithm",
                        "model_building.C",
                        "model_building.max_iter",
                        "model_building.alpha",
                    ],
                ),
                evaluation,
            ],
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SpamflowError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_graph_roundtrips() {
        let doc = PipelineDocument::standard("data/external/spam.csv");
        let toml_str = doc.to_toml().expect("serialize");
        assert!(toml_str.contains("[[stages]]"));
        let parsed = PipelineDocument::parse(&toml_str).expect("parse");
        assert_eq!(parsed, doc);
        assert_eq!(parsed.stages.len(), 5);
        assert_eq!(
            parsed.stage("model_evaluation").and_then(|s| s.metrics.as_deref()),
            Some("reports/metrics.json")
        );
    }

    #[test]
    fn produced_paths_include_metrics() {
        let doc = PipelineDocument::standard("spam.csv");
        let eval = doc.stage("model_evaluation").expect("stage");
        let produced: Vec<&str> = eval.produced_paths().collect();
        assert_eq!(produced, vec!["reports/metrics.json"]);
    }

    #[test]
    fn parse_with_remote() {
        let doc = PipelineDocument::parse(
            r#"
[remote]
path = "/tmp/store"

[[stages]]
name = "a"
cmd = "echo a > a.txt"
outs = ["a.txt"]
"#,
        )
        .expect("parse");
        assert_eq!(doc.remote.as_ref().map(|r| r.path.as_str()), Some("/tmp/store"));
        assert!(doc.stages[0].deps.is_empty());
    }

    #[test]
    fn duplicate_names_rejected() {
        let result = PipelineDocument::parse(
            r#"
[[stages]]
name = "a"
cmd = "true"

[[stages]]
name = "a"
cmd = "true"
"#,
        );
        assert!(matches!(result, Err(SpamflowError::Config { .. })));
    }

    #[test]
    fn empty_cmd_rejected() {
        let result = PipelineDocument::parse("[[stages]]\nname = \"a\"\ncmd = \" \"");
        assert!(result.unwrap_err().to_string().contains("empty cmd"));
    }

    #[test]
    fn empty_document_rejected() {
        assert!(PipelineDocument::parse("").is_err());
    }
}

//! Core domain types shared by the stages and the runner.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Label
// ---------------------------------------------------------------------------

/// Target class of a message. `Spam` is the positive class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Ham,
    Spam,
}

impl Label {
    /// Numeric encoding used by feature tables and classifiers.
    pub fn as_target(self) -> u8 {
        match self {
            Self::Ham => 0,
            Self::Spam => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ham => "ham",
            Self::Spam => "spam",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ham" | "0" => Ok(Self::Ham),
            "spam" | "1" => Ok(Self::Spam),
            other => Err(format!("unknown label '{other}' (expected 'spam' or 'ham')")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A labelled text sample as stored in the raw and interim CSV files.
///
/// Raw and processed records share this shape; preprocessing only rewrites `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub label: Label,
    pub text: String,
}

impl Record {
    pub fn new(label: Label, text: impl Into<String>) -> Self {
        Self {
            label,
            text: text.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Scalar metrics the evaluation stage knows how to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Accuracy,
    Precision,
    Recall,
    #[serde(alias = "f1_score")]
    F1,
    RocAuc,
}

impl MetricName {
    /// All metrics, in report order.
    pub const ALL: [MetricName; 5] = [
        Self::Accuracy,
        Self::Precision,
        Self::Recall,
        Self::F1,
        Self::RocAuc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Precision => "precision",
            Self::Recall => "recall",
            Self::F1 => "f1",
            Self::RocAuc => "roc_auc",
        }
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat key/value metrics report written by the evaluation stage.
///
/// Keys are kept sorted so the serialized report is byte-stable.
pub type MetricsReport = BTreeMap<String, f64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_parsing_is_lenient() {
        assert_eq!(" SPAM ".parse::<Label>().unwrap(), Label::Spam);
        assert_eq!("ham".parse::<Label>().unwrap(), Label::Ham);
        assert_eq!("1".parse::<Label>().unwrap(), Label::Spam);
        assert!("eggs".parse::<Label>().is_err());
    }

    #[test]
    fn label_target_encoding() {
        assert_eq!(Label::Spam.as_target(), 1);
        assert_eq!(Label::Ham.as_target(), 0);
    }

    #[test]
    fn metric_names_accept_alias() {
        let names: Vec<MetricName> =
            serde_json::from_str(r#"["accuracy", "f1_score", "roc_auc"]"#).expect("parse");
        assert_eq!(
            names,
            vec![MetricName::Accuracy, MetricName::F1, MetricName::RocAuc]
        );
        assert_eq!(MetricName::F1.to_string(), "f1");
    }

    #[test]
    fn record_serialization() {
        let rec = Record::new(Label::Spam, "WIN a prize, now!");
        let json = serde_json::to_string(&rec).expect("serialize");
        assert_eq!(json, r#"{"label":"spam","text":"WIN a prize, now!"}"#);
    }
}

//! Model evaluation: trained model + held-out features → metrics report.

use std::path::Path;

use tracing::{info, instrument};

use spamflow_shared::{MetricsReport, ModelEvaluationParams, Result, SpamflowError, layout};

use crate::classifier::{Classifier, Model};
use crate::features::FeatureTable;
use crate::metrics;
use crate::output::{read_json, write_json_pretty};

/// Score every row of `table` and compute the requested metrics.
pub fn evaluate(
    model: &Model,
    table: &FeatureTable,
    params: &ModelEvaluationParams,
) -> Result<MetricsReport> {
    if model.n_features() != table.width() {
        return Err(SpamflowError::validation(format!(
            "model expects {} features but the test table has {}",
            model.n_features(),
            table.width()
        )));
    }
    let scores: Vec<f64> = table.rows.iter().map(|r| model.predict_proba(r)).collect();
    metrics::compute(&params.metrics, &table.labels, &scores)
}

/// Run the evaluation stage under `root`.
///
/// The report is written pretty-printed with sorted keys, so identical inputs
/// produce a byte-identical file.
#[instrument(skip_all)]
pub fn run(root: &Path, params: &ModelEvaluationParams) -> Result<MetricsReport> {
    let model: Model = read_json(&root.join(layout::MODEL))?;
    let table = FeatureTable::read_csv(&root.join(layout::FEATURES_TEST))?;

    let report = evaluate(&model, &table, params)?;
    write_json_pretty(&root.join(layout::METRICS), &report)?;

    for (name, value) in &report {
        info!(metric = %name, value, "evaluated");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{self, LogisticRegression};
    use crate::dataset::tests::scratch_dir;
    use crate::features::SparseRow;
    use spamflow_shared::{Label, MetricName, ModelBuildingParams};

    fn table() -> FeatureTable {
        FeatureTable {
            columns: vec!["win".into(), "lunch".into()],
            rows: vec![
                SparseRow::new(vec![(0, 1.0)]),
                SparseRow::new(vec![(1, 1.0)]),
                SparseRow::new(vec![(0, 0.8), (1, 0.2)]),
                SparseRow::new(vec![(1, 0.9)]),
            ],
            labels: vec![Label::Spam, Label::Ham, Label::Spam, Label::Ham],
        }
    }

    #[test]
    fn width_mismatch_is_validation_error() {
        let model = Model::LogisticRegression(LogisticRegression {
            weights: vec![1.0; 3],
            intercept: 0.0,
            c: 1.0,
            n_iter: 0,
        });
        let err = evaluate(&model, &table(), &ModelEvaluationParams::default()).unwrap_err();
        assert!(matches!(err, SpamflowError::Validation { .. }));
    }

    #[test]
    fn run_writes_sorted_pretty_report() {
        let root = scratch_dir("evaluate");
        let t = table();
        let model = classifier::train(&t, &ModelBuildingParams::default()).unwrap();
        crate::output::write_json(&root.join(layout::MODEL), &model).unwrap();
        t.write_csv(&root.join(layout::FEATURES_TEST)).unwrap();

        let params = ModelEvaluationParams {
            metrics: MetricName::ALL.into_iter().collect(),
        };
        let report = run(&root, &params).expect("evaluate");
        assert_eq!(report.len(), 5);
        assert!(report.values().all(|v| (0.0..=1.0).contains(v)));

        let first = std::fs::read(root.join(layout::METRICS)).unwrap();
        let text = String::from_utf8(first.clone()).unwrap();
        assert!(text.ends_with("}\n"));
        let keys: Vec<&str> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"'))
            .filter_map(|l| l.split('"').next())
            .collect();
        assert_eq!(keys, vec!["accuracy", "f1", "precision", "recall", "roc_auc"]);

        run(&root, &params).unwrap();
        assert_eq!(std::fs::read(root.join(layout::METRICS)).unwrap(), first);
    }

    #[test]
    fn missing_model_is_input_missing() {
        let root = scratch_dir("evaluate");
        let err = run(&root, &ModelEvaluationParams::default()).unwrap_err();
        assert!(matches!(err, SpamflowError::InputMissing { .. }));
    }
}

//! Classifiers and the serialized model artifact.
//!
//! `model_building.algorithm` selects an implementation through [`train`];
//! every implementation serializes into the tagged [`Model`] enum so the
//! evaluation stage can load any of them without knowing which was trained.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use spamflow_shared::{Algorithm, Label, ModelBuildingParams, Result, SpamflowError, layout};

use crate::features::{FeatureTable, SparseRow};
use crate::output::write_json;

/// Gradient norm below which logistic regression stops early.
const GRADIENT_TOLERANCE: f64 = 1e-6;

/// Common scoring interface.
pub trait Classifier {
    /// Probability that `row` is spam.
    fn predict_proba(&self, row: &SparseRow) -> f64;

    /// Number of feature columns the classifier was trained on.
    fn n_features(&self) -> usize;

    fn predict(&self, row: &SparseRow) -> Label {
        if self.predict_proba(row) >= 0.5 {
            Label::Spam
        } else {
            Label::Ham
        }
    }
}

/// Serialized model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Model {
    LogisticRegression(LogisticRegression),
    MultinomialNb(MultinomialNb),
}

impl Model {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::LogisticRegression(_) => Algorithm::LogisticRegression,
            Self::MultinomialNb(_) => Algorithm::MultinomialNb,
        }
    }
}

impl Classifier for Model {
    fn predict_proba(&self, row: &SparseRow) -> f64 {
        match self {
            Self::LogisticRegression(m) => m.predict_proba(row),
            Self::MultinomialNb(m) => m.predict_proba(row),
        }
    }

    fn n_features(&self) -> usize {
        match self {
            Self::LogisticRegression(m) => m.n_features(),
            Self::MultinomialNb(m) => m.n_features(),
        }
    }
}

/// Fit the classifier selected by `params.algorithm`.
pub fn train(table: &FeatureTable, params: &ModelBuildingParams) -> Result<Model> {
    check_trainable(table)?;
    let model = match params.algorithm {
        Algorithm::LogisticRegression => Model::LogisticRegression(LogisticRegression::fit(
            table,
            params.c,
            params.max_iter,
        )?),
        Algorithm::MultinomialNb => {
            Model::MultinomialNb(MultinomialNb::fit(table, params.alpha)?)
        }
    };
    Ok(model)
}

/// Run the model-building stage under `root`.
#[instrument(skip_all, fields(algorithm = %params.algorithm))]
pub fn run(root: &Path, params: &ModelBuildingParams) -> Result<Model> {
    let table = FeatureTable::read_csv(&root.join(layout::FEATURES_TRAIN))?;
    let model = train(&table, params)?;
    write_json(&root.join(layout::MODEL), &model)?;
    info!(
        rows = table.len(),
        features = table.width(),
        "trained {} model",
        model.algorithm()
    );
    Ok(model)
}

fn check_trainable(table: &FeatureTable) -> Result<()> {
    if table.is_empty() {
        return Err(SpamflowError::Fit("training table has no rows".into()));
    }
    if table.width() == 0 {
        return Err(SpamflowError::Fit("training table has no feature columns".into()));
    }
    let spam = table.labels.iter().filter(|&&l| l == Label::Spam).count();
    if spam == 0 || spam == table.len() {
        return Err(SpamflowError::Fit(
            "training data contains a single class; need both spam and ham".into(),
        ));
    }
    Ok(())
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

// ---------------------------------------------------------------------------
// Logistic regression
// ---------------------------------------------------------------------------

/// L2-regularized binary logistic regression with intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub weights: Vec<f64>,
    pub intercept: f64,
    /// Inverse regularization strength used at fit time.
    pub c: f64,
    /// Iterations actually run.
    pub n_iter: usize,
}

impl LogisticRegression {
    /// Minimize `mean(logloss) + ||w||² / (2·C·n)` with Nesterov-accelerated
    /// gradient descent from zero weights.
    ///
    /// The step size is the inverse of the objective's Lipschitz bound, so
    /// the result is deterministic for a given table and hyperparameters.
    pub fn fit(table: &FeatureTable, c: f64, max_iter: usize) -> Result<Self> {
        let n = table.len() as f64;
        let d = table.width();
        let reg = 1.0 / (c * n);

        let max_sq_norm = table
            .rows
            .iter()
            .map(|r| r.squared_norm() + 1.0)
            .fold(0.0, f64::max);
        let step = 1.0 / (0.25 * max_sq_norm + reg);

        let targets: Vec<f64> = table
            .labels
            .iter()
            .map(|l| f64::from(l.as_target()))
            .collect();

        // x_k (current), y_k (look-ahead) for weights and intercept.
        let mut w = vec![0.0; d];
        let mut b = 0.0;
        let mut w_prev = w.clone();
        let mut b_prev = b;
        let mut grad_w = vec![0.0; d];
        let mut n_iter = 0;

        for k in 0..max_iter {
            let momentum = k as f64 / (k as f64 + 3.0);
            let look_w: Vec<f64> = w
                .iter()
                .zip(&w_prev)
                .map(|(cur, prev)| cur + momentum * (cur - prev))
                .collect();
            let look_b = b + momentum * (b - b_prev);

            grad_w.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_b = 0.0;
            for (row, &y) in table.rows.iter().zip(&targets) {
                let residual = sigmoid(row.dot(&look_w) + look_b) - y;
                for &(i, v) in row.entries() {
                    grad_w[i] += residual * v;
                }
                grad_b += residual;
            }
            for (g, wi) in grad_w.iter_mut().zip(&look_w) {
                *g = *g / n + reg * wi;
            }
            grad_b /= n;

            w_prev = std::mem::replace(
                &mut w,
                look_w
                    .iter()
                    .zip(&grad_w)
                    .map(|(wi, g)| wi - step * g)
                    .collect(),
            );
            b_prev = b;
            b = look_b - step * grad_b;
            n_iter = k + 1;

            let grad_norm =
                (grad_w.iter().map(|g| g * g).sum::<f64>() + grad_b * grad_b).sqrt();
            if grad_norm < GRADIENT_TOLERANCE {
                break;
            }
        }

        if !b.is_finite() || w.iter().any(|v| !v.is_finite()) {
            return Err(SpamflowError::Fit(
                "logistic regression diverged (non-finite weights)".into(),
            ));
        }

        debug!(n_iter, max_iter, "logistic regression fitted");
        Ok(Self {
            weights: w,
            intercept: b,
            c,
            n_iter,
        })
    }
}

impl Classifier for LogisticRegression {
    fn predict_proba(&self, row: &SparseRow) -> f64 {
        sigmoid(row.dot(&self.weights) + self.intercept)
    }

    fn n_features(&self) -> usize {
        self.weights.len()
    }
}

// ---------------------------------------------------------------------------
// Multinomial naive Bayes
// ---------------------------------------------------------------------------

/// Multinomial naive Bayes over non-negative features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultinomialNb {
    /// `ln P(class)`, indexed by target (0 = ham, 1 = spam).
    pub class_log_prior: [f64; 2],
    /// `ln P(feature | class)`, indexed by target then column.
    pub feature_log_prob: [Vec<f64>; 2],
    pub alpha: f64,
}

impl MultinomialNb {
    pub fn fit(table: &FeatureTable, alpha: f64) -> Result<Self> {
        let d = table.width();
        let mut class_count = [0usize; 2];
        let mut feature_count = [vec![0.0; d], vec![0.0; d]];

        for (row, label) in table.rows.iter().zip(&table.labels) {
            let class = usize::from(label.as_target());
            class_count[class] += 1;
            for &(i, v) in row.entries() {
                if v < 0.0 {
                    return Err(SpamflowError::Fit(
                        "naive Bayes requires non-negative features".into(),
                    ));
                }
                feature_count[class][i] += v;
            }
        }

        let n = table.len() as f64;
        let class_log_prior = class_count.map(|c| (c as f64 / n).ln());
        let feature_log_prob = feature_count.map(|counts| {
            let total: f64 = counts.iter().sum::<f64>() + alpha * d as f64;
            counts
                .iter()
                .map(|&c| ((c + alpha) / total).ln())
                .collect::<Vec<f64>>()
        });

        Ok(Self {
            class_log_prior,
            feature_log_prob,
            alpha,
        })
    }

    fn joint_log_likelihood(&self, row: &SparseRow, class: usize) -> f64 {
        self.class_log_prior[class] + row.dot(&self.feature_log_prob[class])
    }
}

impl Classifier for MultinomialNb {
    fn predict_proba(&self, row: &SparseRow) -> f64 {
        sigmoid(self.joint_log_likelihood(row, 1) - self.joint_log_likelihood(row, 0))
    }

    fn n_features(&self) -> usize {
        self.feature_log_prob[0].len()
    }
}

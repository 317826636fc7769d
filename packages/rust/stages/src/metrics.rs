//! Binary classification metrics with spam as the positive class.

use std::collections::BTreeSet;

use spamflow_shared::{Label, MetricName, MetricsReport, Result, SpamflowError};

/// Confusion counts at the 0.5 decision threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confusion {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    pub fn_: usize,
}

impl Confusion {
    pub fn from_predictions(y_true: &[Label], y_pred: &[Label]) -> Self {
        let mut c = Self::default();
        for (t, p) in y_true.iter().zip(y_pred) {
            match (t, p) {
                (Label::Spam, Label::Spam) => c.tp += 1,
                (Label::Ham, Label::Spam) => c.fp += 1,
                (Label::Ham, Label::Ham) => c.tn += 1,
                (Label::Spam, Label::Ham) => c.fn_ += 1,
            }
        }
        c
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }
}

/// Zero when the denominator is zero.
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Area under the ROC curve via the Mann-Whitney rank statistic.
///
/// Tied scores share their average rank. Fails when `y_true` holds a single
/// class, where the curve is undefined.
pub fn roc_auc(y_true: &[Label], scores: &[f64]) -> Result<f64> {
    let n_pos = y_true.iter().filter(|&&l| l == Label::Spam).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(SpamflowError::validation(
            "roc_auc is undefined when the test set contains a single class",
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j+1 share their mean
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if y_true[idx] == Label::Spam {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let (p, n) = (n_pos as f64, n_neg as f64);
    Ok((rank_sum_pos - p * (p + 1.0) / 2.0) / (p * n))
}

/// Compute every requested metric.
///
/// `scores` are spam probabilities; predictions threshold them at 0.5.
pub fn compute(
    requested: &BTreeSet<MetricName>,
    y_true: &[Label],
    scores: &[f64],
) -> Result<MetricsReport> {
    if y_true.len() != scores.len() {
        return Err(SpamflowError::validation(format!(
            "{} labels but {} scores",
            y_true.len(),
            scores.len()
        )));
    }
    if y_true.is_empty() {
        return Err(SpamflowError::validation("cannot evaluate an empty test set"));
    }

    let y_pred: Vec<Label> = scores
        .iter()
        .map(|&s| if s >= 0.5 { Label::Spam } else { Label::Ham })
        .collect();
    let confusion = Confusion::from_predictions(y_true, &y_pred);

    let mut report = MetricsReport::new();
    for &metric in requested {
        let value = match metric {
            MetricName::Accuracy => confusion.accuracy(),
            MetricName::Precision => confusion.precision(),
            MetricName::Recall => confusion.recall(),
            MetricName::F1 => confusion.f1(),
            MetricName::RocAuc => roc_auc(y_true, scores)?,
        };
        report.insert(metric.as_str().to_string(), value);
    }
    Ok(report)
}

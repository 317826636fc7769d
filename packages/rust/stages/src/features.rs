//! Feature engineering: processed text → fixed-width TF-IDF tables.
//!
//! Tables are CSV with one column per vocabulary term followed by a `label`
//! column holding the numeric target (`1` = spam). Zero cells are written as
//! `0` so wide, sparse tables stay small on disk.

use std::borrow::Cow;
use std::path::Path;

use tracing::{debug, info, instrument};

use spamflow_shared::{FeatureEngineeringParams, Label, Record, Result, SpamflowError, layout};

use crate::dataset::{csv_error, csv_write_error, read_records};
use crate::output::{write_atomic, write_json};
use crate::tfidf::{FittedTfidf, TfidfVectorizer};

/// Name of the trailing target column.
pub const LABEL_COLUMN: &str = "label";

// ---------------------------------------------------------------------------
// Sparse rows
// ---------------------------------------------------------------------------

/// A feature vector stored as `(column, value)` pairs sorted by column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseRow {
    entries: Vec<(usize, f64)>,
}

impl SparseRow {
    /// Build from entries already sorted by column.
    pub fn new(entries: Vec<(usize, f64)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        Self { entries }
    }

    pub fn entries(&self) -> &[(usize, f64)] {
        &self.entries
    }

    /// Dot product with a dense weight vector.
    pub fn dot(&self, weights: &[f64]) -> f64 {
        self.entries.iter().map(|&(i, v)| v * weights[i]).sum()
    }

    pub fn squared_norm(&self) -> f64 {
        self.entries.iter().map(|(_, v)| v * v).sum()
    }
}

// ---------------------------------------------------------------------------
// Feature tables
// ---------------------------------------------------------------------------

/// A labelled feature matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    /// Feature column names (the vocabulary), excluding the label column.
    pub columns: Vec<String>,
    pub rows: Vec<SparseRow>,
    pub labels: Vec<Label>,
}

impl FeatureTable {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write as dense CSV, atomically.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let width = self.width();
        write_atomic(path, |w| {
            let mut writer = csv::Writer::from_writer(w);
            writer
                .write_record(
                    self.columns
                        .iter()
                        .map(String::as_str)
                        .chain(std::iter::once(LABEL_COLUMN)),
                )
                .map_err(|e| csv_write_error(path, e))?;

            let mut cells: Vec<Cow<'_, str>> = vec![Cow::Borrowed("0"); width + 1];
            for (row, label) in self.rows.iter().zip(&self.labels) {
                cells[..width].fill(Cow::Borrowed("0"));
                for &(idx, value) in row.entries() {
                    cells[idx] = Cow::Owned(value.to_string());
                }
                cells[width] = Cow::Owned(label.as_target().to_string());
                writer
                    .write_record(cells.iter().map(|c| c.as_bytes()))
                    .map_err(|e| csv_write_error(path, e))?;
            }
            writer.flush().map_err(|e| SpamflowError::write(path, e))
        })?;
        debug!(path = %path.display(), rows = self.len(), width, "wrote feature table");
        Ok(())
    }

    /// Read a table written by [`FeatureTable::write_csv`].
    pub fn read_csv(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SpamflowError::InputMissing {
                path: path.to_path_buf(),
            });
        }
        let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, 1, e))?;

        let mut features: Vec<String> = reader
            .headers()
            .map_err(|e| csv_error(path, 1, e))?
            .iter()
            .map(str::to_string)
            .collect();
        let last = features
            .pop()
            .ok_or_else(|| SpamflowError::malformed(path, 1, "empty header"))?;
        if last != LABEL_COLUMN {
            return Err(SpamflowError::malformed(
                path,
                1,
                format!("last column must be '{LABEL_COLUMN}', found '{last}'"),
            ));
        }

        let width = features.len();
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        let mut record = csv::StringRecord::new();
        loop {
            let line = reader.position().line();
            match reader.read_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => return Err(csv_error(path, line, e)),
            }

            let mut entries = Vec::new();
            for (idx, cell) in record.iter().take(width).enumerate() {
                let value: f64 = cell.trim().parse().map_err(|_| {
                    SpamflowError::malformed(path, line, format!("non-numeric cell '{cell}'"))
                })?;
                if !value.is_finite() {
                    return Err(SpamflowError::malformed(path, line, "non-finite cell"));
                }
                if value != 0.0 {
                    entries.push((idx, value));
                }
            }
            let label: Label = record
                .get(width)
                .ok_or_else(|| SpamflowError::malformed(path, line, "missing label"))?
                .parse()
                .map_err(|msg: String| SpamflowError::malformed(path, line, msg))?;

            rows.push(SparseRow::new(entries));
            labels.push(label);
        }

        debug!(path = %path.display(), rows = rows.len(), width, "read feature table");
        Ok(Self {
            columns: features,
            rows,
            labels,
        })
    }
}

/// Counts reported by a finished feature-engineering run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSummary {
    pub width: usize,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Fit on the training split, transform both splits.
pub fn build_tables(
    train: &[Record],
    test: &[Record],
    params: &FeatureEngineeringParams,
) -> Result<(FittedTfidf, FeatureTable, FeatureTable)> {
    let vectorizer = TfidfVectorizer::new(params.max_features, params.ngram_range);
    let fitted = vectorizer.fit(train.iter().map(|r| r.text.as_str()))?;

    let table = |records: &[Record]| FeatureTable {
        columns: fitted.vocabulary().to_vec(),
        rows: fitted.transform_all(records.iter().map(|r| r.text.as_str())),
        labels: records.iter().map(|r| r.label).collect(),
    };
    let train_table = table(train);
    let test_table = table(test);
    Ok((fitted, train_table, test_table))
}

/// Run the feature-engineering stage under `root`.
#[instrument(skip_all, fields(max_features = params.max_features))]
pub fn run(root: &Path, params: &FeatureEngineeringParams) -> Result<FeatureSummary> {
    let train = read_records(&root.join(layout::INTERIM_TRAIN))?;
    let test = read_records(&root.join(layout::INTERIM_TEST))?;

    let (fitted, train_table, test_table) = build_tables(&train, &test, params)?;
    info!(
        vocabulary = fitted.width(),
        documents = fitted.n_documents(),
        "fitted vectorizer on training split"
    );

    train_table.write_csv(&root.join(layout::FEATURES_TRAIN))?;
    test_table.write_csv(&root.join(layout::FEATURES_TEST))?;
    write_json(&root.join(layout::VECTORIZER), &fitted)?;

    Ok(FeatureSummary {
        width: fitted.width(),
        train_rows: train_table.len(),
        test_rows: test_table.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::scratch_dir;
    use spamflow_shared::NgramRange;

    fn params(max_features: usize) -> FeatureEngineeringParams {
        FeatureEngineeringParams {
            max_features,
            ngram_range: NgramRange(1, 2),
        }
    }

    fn records(texts: &[(&str, Label)]) -> Vec<Record> {
        texts.iter().map(|&(t, l)| Record::new(l, t)).collect()
    }

    #[test]
    fn sparse_dot() {
        let row = SparseRow::new(vec![(0, 2.0), (3, 0.5)]);
        assert_eq!(row.dot(&[1.0, 9.0, 9.0, 4.0]), 4.0);
        assert_eq!(row.squared_norm(), 4.25);
    }

    #[test]
    fn table_csv_roundtrip() {
        let dir = scratch_dir("features");
        let table = FeatureTable {
            columns: vec!["call".into(), "free prize".into(), "label".into()],
            rows: vec![
                SparseRow::new(vec![(1, 0.7071067811865475)]),
                SparseRow::new(vec![]),
            ],
            labels: vec![Label::Spam, Label::Ham],
        };
        let path = dir.join("t.csv");
        table.write_csv(&path).expect("write");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("call,free prize,label,label\n0,0.7071067811865475,0,1\n"));
        assert_eq!(FeatureTable::read_csv(&path).expect("read"), table);
    }

    #[test]
    fn tables_share_training_vocabulary() {
        let train = records(&[
            ("free prize call now", Label::Spam),
            ("see you at home", Label::Ham),
        ]);
        let test = records(&[("totally novel words here", Label::Ham)]);
        let (fitted, train_t, test_t) = build_tables(&train, &test, &params(5000)).expect("build");
        assert_eq!(train_t.columns, fitted.vocabulary());
        assert_eq!(test_t.columns, fitted.vocabulary());
        assert!(test_t.rows[0].entries().is_empty());
        assert_eq!(test_t.labels, vec![Label::Ham]);
    }

    #[test]
    fn width_never_exceeds_max_features() {
        let train: Vec<Record> = (0..200)
            .map(|i| Record::new(Label::Ham, format!("word{i} other{} shared", i * 7)))
            .collect();
        let (fitted, train_t, _) = build_tables(&train, &train[..5], &params(50)).expect("build");
        assert_eq!(fitted.width(), 50);
        assert_eq!(train_t.width(), 50);
    }

    #[test]
    fn run_writes_tables_and_vectorizer() {
        let root = scratch_dir("features");
        crate::dataset::write_records(
            &root.join(layout::INTERIM_TRAIN),
            &records(&[("win cash now", Label::Spam), ("lunch at noon", Label::Ham)]),
        )
        .unwrap();
        crate::dataset::write_records(
            &root.join(layout::INTERIM_TEST),
            &records(&[("cash at noon", Label::Spam)]),
        )
        .unwrap();

        let summary = run(&root, &params(5000)).expect("run");
        assert_eq!(summary.train_rows, 2);
        assert_eq!(summary.test_rows, 1);

        let test_t = FeatureTable::read_csv(&root.join(layout::FEATURES_TEST)).unwrap();
        assert_eq!(test_t.width(), summary.width);
        let fitted: FittedTfidf =
            crate::output::read_json(&root.join(layout::VECTORIZER)).unwrap();
        assert_eq!(fitted.width(), summary.width);
    }

    #[test]
    fn non_numeric_cell_is_malformed() {
        let dir = scratch_dir("features");
        let path = dir.join("bad.csv");
        std::fs::write(&path, "a,label\n0.5,1\nx,0\n").unwrap();
        match FeatureTable::read_csv(&path).unwrap_err() {
            SpamflowError::MalformedRow { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

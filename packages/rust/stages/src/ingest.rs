//! Data ingestion: source dataset → seeded train/test partition.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use spamflow_shared::{DataIngestionParams, Label, Record, Result, SpamflowError, layout};

use crate::dataset::{read_records, write_records};

/// Counts reported by a finished ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub total: usize,
    pub train: usize,
    pub test: usize,
    pub spam: usize,
}

/// Train/test row indices, each in ascending source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Number of held-out rows for `n` rows at fraction `test_size` (rounded up).
pub fn test_count(n: usize, test_size: f64) -> usize {
    // Guard against products like 0.1 * 30 = 3.0000000000000004.
    let raw = n as f64 * test_size;
    let count = (raw - 1e-9).ceil().max(0.0) as usize;
    count.min(n)
}

/// Partition `n` row indices deterministically from `seed`.
///
/// Rows are ranked by `SHA-256(seed ‖ index)`; the lowest `test_count` ranks
/// form the test split. The result depends only on `(n, test_size, seed)`.
pub fn partition(n: usize, test_size: f64, seed: u64) -> Partition {
    let mut ranked: Vec<(u64, usize)> = (0..n).map(|i| (rank_key(seed, i), i)).collect();
    ranked.sort_unstable();

    let n_test = test_count(n, test_size);
    let mut test: Vec<usize> = ranked[..n_test].iter().map(|&(_, i)| i).collect();
    let mut train: Vec<usize> = ranked[n_test..].iter().map(|&(_, i)| i).collect();
    test.sort_unstable();
    train.sort_unstable();

    Partition { train, test }
}

fn rank_key(seed: u64, index: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update((index as u64).to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Split records into `(train, test)` per [`partition`].
pub fn split_records(
    records: &[Record],
    test_size: f64,
    seed: u64,
) -> Result<(Vec<Record>, Vec<Record>)> {
    let part = partition(records.len(), test_size, seed);
    if part.train.is_empty() || part.test.is_empty() {
        return Err(SpamflowError::out_of_range(
            "data_ingestion.test_size",
            format!(
                "{test_size} leaves an empty split for {} rows",
                records.len()
            ),
        ));
    }
    let pick = |idx: &[usize]| idx.iter().map(|&i| records[i].clone()).collect::<Vec<_>>();
    Ok((pick(&part.train), pick(&part.test)))
}

/// Run the ingestion stage under `root`.
#[instrument(skip_all, fields(source = %params.source, test_size = params.test_size))]
pub fn run(root: &Path, params: &DataIngestionParams) -> Result<IngestSummary> {
    let source = root.join(&params.source);
    let records = read_records(&source)?;
    if records.is_empty() {
        return Err(SpamflowError::out_of_range(
            "data_ingestion.source",
            format!("{} has no rows", source.display()),
        ));
    }
    info!(rows = records.len(), "loaded source dataset");

    let (train, test) = split_records(&records, params.test_size, params.random_state)?;

    write_records(&root.join(layout::RAW_TRAIN), &train)?;
    write_records(&root.join(layout::RAW_TEST), &test)?;

    let summary = IngestSummary {
        total: records.len(),
        train: train.len(),
        test: test.len(),
        spam: records.iter().filter(|r| r.label == Label::Spam).count(),
    };
    info!(
        train = summary.train,
        test = summary.test,
        spam = summary.spam,
        "train/test split written"
    );
    Ok(summary)
}

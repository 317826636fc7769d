//! Text normalization.
//!
//! A pure per-record transform: order and row count are preserved and
//! applying it twice gives the same result as applying it once.

use std::path::Path;

use tracing::{info, instrument};

use spamflow_shared::{PreprocessingParams, Record, Result, layout};

use crate::dataset::{read_records, write_records};

/// Normalize one message.
///
/// Optionally lowercases and strips ASCII punctuation, then collapses all
/// whitespace runs to a single space.
pub fn normalize(text: &str, params: &PreprocessingParams) -> String {
    let lowered;
    let mut text = text;
    if params.lowercase {
        lowered = text.to_lowercase();
        text = &lowered;
    }

    let tokens = text.split_whitespace().filter_map(|token| {
        if params.remove_punctuation {
            let kept: String = token.chars().filter(|c| !c.is_ascii_punctuation()).collect();
            (!kept.is_empty()).then_some(kept)
        } else {
            Some(token.to_string())
        }
    });

    tokens.collect::<Vec<_>>().join(" ")
}

/// Normalize every record, preserving order.
pub fn preprocess(records: &[Record], params: &PreprocessingParams) -> Vec<Record> {
    records
        .iter()
        .map(|r| Record {
            label: r.label,
            text: normalize(&r.text, params),
        })
        .collect()
}

/// Run the preprocessing stage under `root`.
#[instrument(
    skip_all,
    fields(
        lowercase = params.lowercase,
        remove_punctuation = params.remove_punctuation
    )
)]
pub fn run(root: &Path, params: &PreprocessingParams) -> Result<(usize, usize)> {
    let train = read_records(&root.join(layout::RAW_TRAIN))?;
    let test = read_records(&root.join(layout::RAW_TEST))?;

    let train = preprocess(&train, params);
    let test = preprocess(&test, params);

    write_records(&root.join(layout::INTERIM_TRAIN), &train)?;
    write_records(&root.join(layout::INTERIM_TEST), &test)?;

    info!(train = train.len(), test = test.len(), "normalized text");
    Ok((train.len(), test.len()))
}

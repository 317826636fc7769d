//! TF-IDF vectorizer.
//!
//! [`TfidfVectorizer::fit`] sees training text only and returns an immutable
//! [`FittedTfidf`]. Transforming borrows the fitted state immutably, so scoring
//! held-out text cannot leak into the vocabulary or the IDF weights.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use spamflow_shared::{NgramRange, Result, SpamflowError};

use crate::features::SparseRow;

/// Tokens are runs of two or more word characters.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?u)\b\w\w+\b").expect("valid regex"));

/// Split text into lowercase tokens and join consecutive tokens into n-grams.
pub fn analyze(text: &str, ngram_range: NgramRange) -> Vec<String> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = TOKEN_RE.find_iter(&lowered).map(|m| m.as_str()).collect();

    let mut terms = Vec::new();
    for n in ngram_range.low()..=ngram_range.high() {
        if n == 0 || n > tokens.len() {
            continue;
        }
        for window in tokens.windows(n) {
            terms.push(window.join(" "));
        }
    }
    terms
}

/// Unfitted vectorizer configuration.
#[derive(Debug, Clone, Copy)]
pub struct TfidfVectorizer {
    pub max_features: usize,
    pub ngram_range: NgramRange,
}

/// Vocabulary and IDF weights learned from a training corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedTfidf {
    ngram_range: NgramRange,
    /// Alphabetically sorted; a term's position is its column index.
    vocabulary: Vec<String>,
    idf: Vec<f64>,
    /// Number of training documents the weights were computed from.
    n_documents: usize,
}

impl TfidfVectorizer {
    pub fn new(max_features: usize, ngram_range: NgramRange) -> Self {
        Self {
            max_features,
            ngram_range,
        }
    }

    /// Learn vocabulary and IDF weights from `documents`.
    ///
    /// Keeps the `max_features` most frequent terms (ties broken by term) and
    /// uses smoothed IDF: `ln((1 + n) / (1 + df)) + 1`.
    pub fn fit<'a, I>(&self, documents: I) -> Result<FittedTfidf>
    where
        I: IntoIterator<Item = &'a str>,
    {
        // term -> (corpus frequency, document frequency)
        let mut stats: HashMap<String, (usize, usize)> = HashMap::new();
        let mut n_documents = 0usize;

        for doc in documents {
            n_documents += 1;
            let mut counts: HashMap<String, usize> = HashMap::new();
            for term in analyze(doc, self.ngram_range) {
                *counts.entry(term).or_default() += 1;
            }
            for (term, count) in counts {
                let entry = stats.entry(term).or_default();
                entry.0 += count;
                entry.1 += 1;
            }
        }

        if stats.is_empty() {
            return Err(SpamflowError::Fit(
                "empty vocabulary: training text contains no tokens".into(),
            ));
        }

        let mut ranked: Vec<(String, (usize, usize))> = stats.into_iter().collect();
        ranked.sort_by(|(ta, (fa, _)), (tb, (fb, _))| fb.cmp(fa).then_with(|| ta.cmp(tb)));
        ranked.truncate(self.max_features);
        ranked.sort_by(|(ta, _), (tb, _)| ta.cmp(tb));

        let n = n_documents as f64;
        let (vocabulary, idf) = ranked
            .into_iter()
            .map(|(term, (_, df))| (term, ((1.0 + n) / (1.0 + df as f64)).ln() + 1.0))
            .unzip();

        Ok(FittedTfidf {
            ngram_range: self.ngram_range,
            vocabulary,
            idf,
            n_documents,
        })
    }
}

impl FittedTfidf {
    /// Number of feature columns.
    pub fn width(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    pub fn idf(&self) -> &[f64] {
        &self.idf
    }

    pub fn n_documents(&self) -> usize {
        self.n_documents
    }

    /// Column index of `term`, if it is in the vocabulary.
    pub fn index_of(&self, term: &str) -> Option<usize> {
        self.vocabulary
            .binary_search_by(|t| t.as_str().cmp(term))
            .ok()
    }

    /// Encode one document as an L2-normalized TF-IDF row.
    ///
    /// Terms outside the vocabulary are ignored.
    pub fn transform(&self, text: &str) -> SparseRow {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for term in analyze(text, self.ngram_range) {
            if let Some(idx) = self.index_of(&term) {
                *counts.entry(idx).or_default() += 1;
            }
        }

        let mut entries: Vec<(usize, f64)> = counts
            .into_iter()
            .map(|(idx, count)| (idx, count as f64 * self.idf[idx]))
            .collect();
        entries.sort_unstable_by_key(|&(idx, _)| idx);

        let norm = entries.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, v) in &mut entries {
                *v /= norm;
            }
        }
        SparseRow::new(entries)
    }

    /// Encode many documents.
    pub fn transform_all<'a, I>(&self, documents: I) -> Vec<SparseRow>
    where
        I: IntoIterator<Item = &'a str>,
    {
        documents.into_iter().map(|d| self.transform(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRAIN: [&str; 4] = [
        "free prize call now",
        "call me when you get home",
        "free free entry win prize",
        "are you home yet",
    ];

    #[test]
    fn analyze_builds_ngrams() {
        let terms = analyze("Free prize, call now", NgramRange(1, 2));
        assert_eq!(
            terms,
            vec![
                "free", "prize", "call", "now", "free prize", "prize call", "call now"
            ]
        );
        // single-character tokens are dropped
        assert_eq!(analyze("a b cd", NgramRange(1, 1)), vec!["cd"]);
    }

    #[test]
    fn vocabulary_is_capped_by_frequency() {
        let fitted = TfidfVectorizer::new(3, NgramRange(1, 1))
            .fit(TRAIN.iter().copied())
            .expect("fit");
        assert_eq!(fitted.width(), 3);
        // "free" (3), then "call"/"home"/"prize"/"you" (2 each) tie-broken by term
        assert_eq!(fitted.vocabulary(), &["call", "free", "home"]);
    }

    #[test]
    fn idf_is_smoothed() {
        let fitted = TfidfVectorizer::new(100, NgramRange(1, 1))
            .fit(TRAIN.iter().copied())
            .expect("fit");
        let free = fitted.index_of("free").expect("free in vocab");
        // df(free) = 2 of 4 documents
        let expected = (5.0f64 / 3.0).ln() + 1.0;
        assert!((fitted.idf()[free] - expected).abs() < 1e-12);
    }

    #[test]
    fn rows_are_unit_length() {
        let fitted = TfidfVectorizer::new(100, NgramRange(1, 2))
            .fit(TRAIN.iter().copied())
            .expect("fit");
        let row = fitted.transform("free prize call now");
        let norm: f64 = row.entries().iter().map(|(_, v)| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-12);
        assert!(fitted.transform("zzz qqq").entries().is_empty());
    }

    #[test]
    fn transforming_test_text_does_not_change_fitted_state() {
        let fitted = TfidfVectorizer::new(50, NgramRange(1, 2))
            .fit(TRAIN.iter().copied())
            .expect("fit");
        let before = fitted.clone();

        let test_docs = ["brand new words unseen in training", "free cash"];
        let rows = fitted.transform_all(test_docs.iter().copied());

        assert_eq!(fitted, before);
        assert!(fitted.index_of("unseen").is_none());
        assert!(fitted.index_of("cash").is_none());
        assert!(rows[0].entries().is_empty());
        assert_eq!(rows[1].entries().len(), 1);
    }

    #[test]
    fn fitting_on_test_text_would_change_the_vocabulary() {
        let vec = TfidfVectorizer::new(50, NgramRange(1, 1));
        let train_only = vec.fit(TRAIN.iter().copied()).expect("fit");
        let leaky = vec
            .fit(TRAIN.iter().copied().chain(["cash bonanza"]))
            .expect("fit");
        assert_ne!(train_only.vocabulary(), leaky.vocabulary());
    }

    #[test]
    fn empty_corpus_fails_to_fit() {
        let err = TfidfVectorizer::new(10, NgramRange(1, 1))
            .fit(["", "a"].iter().copied())
            .unwrap_err();
        assert!(matches!(err, SpamflowError::Fit(_)));
    }
}

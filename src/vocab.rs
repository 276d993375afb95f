//! Vocabulary filtering: which tokens of the text encoder become dataset
//! concepts.
//!
//! The scan walks every row of the token embedding table and keeps words
//! that round-trip to a single token, are longer than three characters,
//! alphanumeric, not English stopwords, and present in a curated common-word
//! list.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Candidate words must be strictly longer than this.
const MIN_WORD_LEN: usize = 3;

/// Read-only view of a tokenizer vocabulary.
///
/// This is the seam between the filter and the real CLIP tokenizer; tests
/// implement it with a fixed word table.
pub trait TokenVocab {
    /// Number of rows in the text embedding table.
    fn vocab_size(&self) -> usize;

    /// Decode a single token id to text.
    fn decode_token(&self, token_id: u32) -> String;

    /// Re-encode a word without special tokens.
    fn encode_word(&self, word: &str) -> Result<Vec<u32>>;
}

/// Decides which vocabulary entries become dataset concepts.
pub struct VocabFilter {
    stopwords: HashSet<String>,
    common_words: HashSet<String>,
}

impl VocabFilter {
    /// Filter backed by the built-in word data: the BIP-39 English list as
    /// the common-word set and the embedded English stopword corpus.
    pub fn new() -> Self {
        let common_words = bip39::Language::English
            .words_by_prefix("")
            .iter()
            .map(|word| (*word).to_string())
            .collect();
        Self {
            stopwords: english_stopwords(),
            common_words,
        }
    }

    /// Filter with a custom common-word list, one word per line.
    pub fn with_word_list(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read word list {}", path.display()))?;
        let common_words = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            stopwords: english_stopwords(),
            common_words,
        })
    }

    /// Per-word conditions: minimum length, alphanumeric, not a stopword,
    /// present in the common-word set.
    ///
    /// The single-token round-trip condition lives in [`scan`](Self::scan),
    /// the only place token ids are available.
    pub fn keeps(&self, word: &str) -> bool {
        word.chars().count() > MIN_WORD_LEN
            && word.chars().all(char::is_alphanumeric)
            && !self.stopwords.contains(word)
            && self.common_words.contains(word)
    }

    /// Scan the full embedding table and return the sorted, deduplicated
    /// candidate list.
    ///
    /// Tokens that re-encode to anything other than one id are dropped
    /// silently; this is filtering, not an error path.
    pub fn scan<V: TokenVocab>(&self, vocab: &V) -> Result<Vec<String>> {
        let vocab_size = vocab.vocab_size();
        info!("Scanning {} vocabulary entries", vocab_size);

        let mut candidates = BTreeSet::new();
        for token_id in 0..vocab_size {
            let word = vocab.decode_token(token_id as u32).trim().to_string();
            if word.is_empty() {
                continue;
            }
            let ids = vocab.encode_word(&word)?;
            if ids.len() != 1 {
                continue;
            }
            if self.keeps(&word) {
                debug!("Keeping token {}: {:?}", token_id, word);
                candidates.insert(word);
            }
        }

        info!("{} candidate words survive the filter", candidates.len());
        Ok(candidates.into_iter().collect())
    }
}

impl Default for VocabFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// The NLTK English stopword list (179 words). The broader stopwords-iso
/// list would swallow common words like "able" that belong in the dataset.
fn english_stopwords() -> HashSet<String> {
    stop_words::get(stop_words::LANGUAGE::English)
        .into_iter()
        .collect()
}

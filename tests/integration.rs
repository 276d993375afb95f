//! Integration tests for sd-extract
//!
//! Note: Tests marked with #[ignore] require GPU and model download.
//! Run them explicitly with: cargo test --ignored

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use sd_extract::{ExtractConfig, Extractor, ExtractorBackend, TokenVocab, VocabFilter};
use tempfile::TempDir;

/// Backend that records generate calls and returns tiny blank images.
struct FakeBackend {
    tokens: Vec<&'static str>,
    batch_sizes: Rc<RefCell<Vec<usize>>>,
}

impl FakeBackend {
    fn new(tokens: Vec<&'static str>) -> Self {
        Self {
            tokens,
            batch_sizes: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Handle to the recorded batch sizes, usable after the backend is
    /// moved into an extractor.
    fn batch_sizes_handle(&self) -> Rc<RefCell<Vec<usize>>> {
        Rc::clone(&self.batch_sizes)
    }
}

impl TokenVocab for FakeBackend {
    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn decode_token(&self, token_id: u32) -> String {
        self.tokens[token_id as usize].to_string()
    }

    fn encode_word(&self, word: &str) -> Result<Vec<u32>> {
        Ok(match self.tokens.iter().position(|t| *t == word) {
            Some(idx) => vec![idx as u32],
            None => vec![0, 1],
        })
    }
}

impl ExtractorBackend for FakeBackend {
    fn token_embedding(&self, token_id: u32) -> Result<Tensor> {
        Ok(Tensor::full(token_id as f32, (8,), &Device::Cpu)?)
    }

    fn generate(&self, prompts: &[String]) -> Result<Vec<Tensor>> {
        self.batch_sizes.borrow_mut().push(prompts.len());
        prompts
            .iter()
            .map(|_| Ok(Tensor::zeros((3, 8, 8), DType::U8, &Device::Cpu)?))
            .collect()
    }
}

fn test_config(output_dir: &Path) -> ExtractConfig {
    ExtractConfig {
        batch_size: 8,
        images_per_prompt: 1,
        output_dir: output_dir.to_path_buf(),
        width: 8,
        height: 8,
        ..ExtractConfig::default()
    }
}

fn png_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .is_some_and(|ext| ext == "png")
        })
        .count()
}

/// End-to-end scenario from the filtered vocabulary to files on disk:
/// 2 words, batch size 8, 1 image per prompt.
#[test]
fn test_end_to_end_two_words() {
    let output = TempDir::new().unwrap();
    let backend = FakeBackend::new(vec!["apple", "zebra"]);
    let words = vec!["apple".to_string(), "zebra".to_string()];

    let extractor = Extractor::new(backend, test_config(output.path()));
    let summary = extractor.run(&words).unwrap();

    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.skipped, 0);

    for word in ["apple", "zebra"] {
        // list length <= 4, so everything lands in "val"
        let unit = output.path().join("val").join(word);
        assert!(unit.join("learned_embeds.bin").is_file());
        assert_eq!(png_count(&unit.join("concept_images")), 13);
    }
    assert!(!output.path().join("train").exists());
}

/// 13 prompts with batch size 8 must hit the pipeline as one batch of 8 and
/// one batch of 5, per word.
#[test]
fn test_batch_sizes_seen_by_pipeline() {
    let output = TempDir::new().unwrap();
    let backend = FakeBackend::new(vec!["apple", "zebra"]);
    let batch_sizes = backend.batch_sizes_handle();
    let words = vec!["apple".to_string(), "zebra".to_string()];

    let extractor = Extractor::new(backend, test_config(output.path()));
    extractor.run(&words).unwrap();

    assert_eq!(*batch_sizes.borrow(), vec![8, 5, 8, 5]);
}

/// Re-running over an existing unit makes no model invocations and leaves
/// the tree unchanged.
#[test]
fn test_rerun_skips_existing_units() {
    let output = TempDir::new().unwrap();
    let words = vec!["apple".to_string(), "zebra".to_string()];

    let extractor = Extractor::new(
        FakeBackend::new(vec!["apple", "zebra"]),
        test_config(output.path()),
    );
    let first = extractor.run(&words).unwrap();
    assert_eq!(first.extracted, 2);

    let backend = FakeBackend::new(vec!["apple", "zebra"]);
    let batch_sizes = backend.batch_sizes_handle();
    let extractor = Extractor::new(backend, test_config(output.path()));
    let second = extractor.run(&words).unwrap();
    assert_eq!(second.extracted, 0);
    assert_eq!(second.skipped, 2);
    assert!(batch_sizes.borrow().is_empty());

    for word in ["apple", "zebra"] {
        let unit = output.path().join("val").join(word);
        assert_eq!(png_count(&unit.join("concept_images")), 13);
    }
}

/// A word that re-encodes to more than one token aborts the whole run.
#[test]
fn test_multi_token_word_is_fatal() {
    let output = TempDir::new().unwrap();
    let backend = FakeBackend::new(vec!["apple", "zebra"]);
    let words = vec!["pomegranate".to_string()];

    let extractor = Extractor::new(backend, test_config(output.path()));
    let err = extractor.run(&words).unwrap_err();
    assert!(err.to_string().contains("re-encoded"));
    assert!(!output.path().join("val").join("pomegranate").exists());
}

/// Words past the fourth-from-last position get the "train" label.
#[test]
fn test_long_lists_split_train_and_val() {
    let output = TempDir::new().unwrap();
    let tokens = vec!["apple", "brick", "cedar", "delta", "eagle", "fence"];
    let words: Vec<String> = tokens.iter().map(|t| (*t).to_string()).collect();

    let extractor = Extractor::new(FakeBackend::new(tokens), test_config(output.path()));
    extractor.run(&words).unwrap();

    assert!(output.path().join("train").join("apple").exists());
    assert!(output.path().join("train").join("brick").exists());
    for word in ["cedar", "delta", "eagle", "fence"] {
        assert!(output.path().join("val").join(word).exists());
    }
}

/// The filter output feeds the extractor: every surviving word round-trips
/// to a single token, so the extractor's fatal check never fires.
#[test]
fn test_scan_then_extract() {
    let output = TempDir::new().unwrap();
    // "the" is a stopword, "zoo" is too short, "keen!" is not alphanumeric
    let backend = FakeBackend::new(vec!["zebra", "the", "zoo", "keen!", "window"]);

    let filter = VocabFilter::new();
    let words = filter.scan(&backend).unwrap();
    assert_eq!(words, vec!["window".to_string(), "zebra".to_string()]);

    let extractor = Extractor::new(backend, test_config(output.path()));
    let summary = extractor.run(&words).unwrap();
    assert_eq!(summary.extracted, 2);
}

/// Embedding snapshots are a word -> vector mapping readable by candle.
#[test]
fn test_embedding_snapshot_roundtrip() {
    let output = TempDir::new().unwrap();
    let backend = FakeBackend::new(vec!["zebra"]);
    let words = vec!["zebra".to_string()];

    let extractor = Extractor::new(backend, test_config(output.path()));
    extractor.run(&words).unwrap();

    let path = output.path().join("val").join("zebra").join("learned_embeds.bin");
    let tensors = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
    let embedding = tensors.get("zebra").unwrap();
    assert_eq!(embedding.dims(), &[8]);
    let values = embedding.to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| (*v - 0.0).abs() < f32::EPSILON));
}

/// GPU-dependent test: full pipeline loading
#[test]
#[ignore = "requires GPU and model download"]
fn test_pipeline_loading() {
    use sd_extract::SdPipeline;

    let config = ExtractConfig {
        use_cpu: true,
        ..ExtractConfig::default()
    };
    let pipeline = SdPipeline::from_pretrained(&config).unwrap();
    // SD 2.1 ships the standard CLIP vocabulary
    assert_eq!(pipeline.vocab_size(), 49408);
    assert_eq!(pipeline.encode_word("zebra").unwrap().len(), 1);
}

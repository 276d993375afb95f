//! Per-token extraction: embedding snapshots and template-prompt image sets.
//!
//! For every candidate word the extractor writes one unit under
//! `{output}/{train|val}/{word}/`: a `learned_embeds.bin` snapshot of the
//! word's embedding row and a `concept_images/` folder with one PNG per
//! generated prompt. A unit whose directory already exists is skipped whole;
//! there is no partial-completion detection.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::config::ExtractConfig;
use crate::slug::slugify;
use crate::vocab::TokenVocab;

/// Tail entries of the sorted candidate list assigned to the "val" split.
const VAL_TAIL: usize = 4;

/// Style templates expanded for every candidate word.
pub const PROMPT_TEMPLATES: [&str; 13] = [
    "{}, DLSR photo",
    "{}, 3D render",
    "{}, pencil drawing",
    "{}, watercolor painting",
    "{}, oil painting",
    "{}, anime",
    "{}, cartoon",
    "{}, comic book",
    "{}, line art",
    "{}, vector art",
    "{}, clip art",
    "{}, sculpture",
    "{}, digital painting",
];

/// What the extractor needs from the loaded model beyond the vocabulary.
pub trait ExtractorBackend: TokenVocab {
    /// Row of the text-encoder embedding table, detached to CPU f32.
    fn token_embedding(&self, token_id: u32) -> Result<Tensor>;

    /// One `(3, height, width)` u8 image tensor per prompt, same order.
    fn generate(&self, prompts: &[String]) -> Result<Vec<Tensor>>;
}

/// Counts reported after a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractSummary {
    /// Units written during this run
    pub extracted: usize,
    /// Units skipped because they were already on disk
    pub skipped: usize,
}

/// Split label for the word at `index` in a sorted list of `total` entries.
///
/// Fixed-count tail split: the last [`VAL_TAIL`] entries are "val",
/// everything before them "train".
pub fn split_label(total: usize, index: usize) -> &'static str {
    if total - index <= VAL_TAIL {
        "val"
    } else {
        "train"
    }
}

/// All prompts for one word: each template expanded, then the whole list
/// repeated `images_per_prompt` times.
pub fn build_prompts(word: &str, images_per_prompt: usize) -> Vec<String> {
    let base: Vec<String> = PROMPT_TEMPLATES
        .iter()
        .map(|template| template.replacen("{}", word, 1))
        .collect();
    let mut prompts = Vec::with_capacity(base.len() * images_per_prompt);
    for _ in 0..images_per_prompt {
        prompts.extend(base.iter().cloned());
    }
    prompts
}

/// Main extraction loop over the sorted candidate list.
pub struct Extractor<B: ExtractorBackend> {
    backend: B,
    config: ExtractConfig,
}

impl<B: ExtractorBackend> Extractor<B> {
    /// Create an extractor owning the loaded backend for the run's lifetime.
    pub fn new(backend: B, config: ExtractConfig) -> Self {
        Self { backend, config }
    }

    /// Extract every word in order, skipping units already on disk.
    ///
    /// A word that no longer re-encodes to a single token aborts the whole
    /// run; the vocabulary filter guarantees this does not happen, so the
    /// check is a safety net rather than an expected path.
    pub fn run(&self, words: &[String]) -> Result<ExtractSummary> {
        let mut summary = ExtractSummary::default();
        let progress = ProgressBar::new(words.len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} extracting {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for (index, word) in words.iter().enumerate() {
            progress.set_message(word.clone());

            let ids = self.backend.encode_word(word)?;
            if ids.len() != 1 {
                bail!(
                    "word {word:?} re-encoded to {} tokens, need exactly one",
                    ids.len()
                );
            }
            let token_id = ids[0];

            let split = split_label(words.len(), index);
            let unit_dir = self.config.output_dir.join(split).join(word);
            if unit_dir.exists() {
                info!("Skipping {} because it already exists", unit_dir.display());
                summary.skipped += 1;
                progress.inc(1);
                continue;
            }

            let images_dir = unit_dir.join("concept_images");
            std::fs::create_dir_all(&images_dir)
                .with_context(|| format!("failed to create {}", images_dir.display()))?;

            let embedding = self.backend.token_embedding(token_id)?;
            save_embedding(word, &embedding, &unit_dir.join("learned_embeds.bin"))?;

            let prompts = build_prompts(word, self.config.images_per_prompt);
            for batch in prompts.chunks(self.config.batch_size) {
                info!(
                    "Inferring prompts: {}",
                    batch
                        .iter()
                        .map(|prompt| format!("{prompt:?}"))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
                let images = self.backend.generate(batch)?;
                for (n, (image, prompt)) in images.iter().zip(batch.iter()).enumerate() {
                    let filename = format!("image_{}_{}.png", slugify(prompt), n);
                    save_image(image, &images_dir.join(filename))?;
                }
            }

            summary.extracted += 1;
            progress.inc(1);
        }

        progress.finish_and_clear();
        Ok(summary)
    }
}

/// Persist the `word -> vector` mapping as safetensors.
fn save_embedding(word: &str, embedding: &Tensor, path: &Path) -> Result<()> {
    let mut tensors = HashMap::new();
    tensors.insert(word.to_string(), embedding.clone());
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Write a `(3, height, width)` u8 tensor as a lossless PNG.
fn save_image(image: &Tensor, path: &Path) -> Result<()> {
    let (channels, height, width) = image.dims3()?;
    anyhow::ensure!(
        channels == 3,
        "expected an RGB image tensor, got {channels} channels"
    );
    let pixels = image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let buffer: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
            .context("image buffer size mismatch")?;
    buffer
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

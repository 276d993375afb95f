// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f32/f64 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in token indexing
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::module_name_repetitions)] // ExtractConfig in config.rs is fine

//! sd-extract: per-token Stable Diffusion dataset generator
//!
//! Builds a small per-token image training set from a pretrained
//! text-to-image diffusion model: every single-token common English word in
//! the text encoder's vocabulary gets an embedding snapshot and a folder of
//! template-prompted images.
//!
//! ## Architecture
//!
//! - `config`: run parameters, fixed for the lifetime of a run
//! - `vocab`: vocabulary scan and the five-condition candidate filter
//! - `pipeline`: Candle Stable Diffusion pipeline (CLIP, UNet, VAE, DDIM)
//! - `extract`: per-token extraction loop writing the dataset tree
//! - `slug`: prompt slugification for image filenames

pub mod config;
pub mod extract;
pub mod pipeline;
pub mod slug;
pub mod vocab;

pub use config::ExtractConfig;
pub use extract::{
    build_prompts, split_label, ExtractSummary, Extractor, ExtractorBackend, PROMPT_TEMPLATES,
};
pub use pipeline::SdPipeline;
pub use slug::slugify;
pub use vocab::{TokenVocab, VocabFilter};

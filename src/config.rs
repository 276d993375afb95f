//! Run configuration for the extraction pipeline.

use std::path::PathBuf;

/// Parameters for a single extraction run.
///
/// Built once from the CLI and passed by reference; nothing mutates it after
/// the run starts.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// HuggingFace model id or local path
    pub model_id: String,
    /// Force CPU even when CUDA is available
    pub use_cpu: bool,
    /// Prompts per pipeline invocation
    pub batch_size: usize,
    /// How many times the template list is repeated per token
    pub images_per_prompt: usize,
    /// Root of the generated dataset tree
    pub output_dir: PathBuf,
    /// Generated image width in pixels
    pub width: usize,
    /// Generated image height in pixels
    pub height: usize,
    /// Denoising steps per batch
    pub num_inference_steps: usize,
    /// Classifier-free guidance scale
    pub guidance_scale: f64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            model_id: "stabilityai/stable-diffusion-2-1-base".to_string(),
            use_cpu: false,
            batch_size: 8,
            images_per_prompt: 2,
            output_dir: PathBuf::from("sd_extracted"),
            width: 512,
            height: 512,
            num_inference_steps: 50,
            guidance_scale: 9.0,
        }
    }
}

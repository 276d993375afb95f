//! sd-extract CLI: build a per-token image dataset from a diffusion model.

use anyhow::Result;
use clap::Parser;
use sd_extract::{ExtractConfig, Extractor, SdPipeline, TokenVocab, VocabFilter};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sd-extract")]
#[command(about = "Per-token Stable Diffusion dataset extractor")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (e.g., "stabilityai/stable-diffusion-2-1-base")
    #[arg(short, long, default_value = "stabilityai/stable-diffusion-2-1-base")]
    model: String,

    /// Images generated per template prompt
    #[arg(long, default_value_t = 2)]
    images_per_prompt: usize,

    /// Prompts per pipeline invocation
    #[arg(short, long, default_value_t = 8)]
    batch_size: usize,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Output directory for the dataset tree
    #[arg(short, long, default_value = "sd_extracted")]
    output: PathBuf,

    /// Generated image width
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Generated image height
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Custom common-word list, one word per line (default: built-in BIP-39 list)
    #[arg(long)]
    wordlist: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== sd-extract: per-token dataset generator ===");
    println!("Model:  {}", cli.model);
    println!("Output: {}", cli.output.display());
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    let config = ExtractConfig {
        model_id: cli.model,
        use_cpu: cli.cpu,
        batch_size: cli.batch_size,
        images_per_prompt: cli.images_per_prompt,
        output_dir: cli.output,
        width: cli.width,
        height: cli.height,
        ..ExtractConfig::default()
    };

    // Load pipeline
    info!("Loading pipeline...");
    let pipeline = SdPipeline::from_pretrained(&config)?;
    info!("Vocabulary: {} tokens", pipeline.vocab_size());

    // Scan the vocabulary for candidate words
    let filter = match &cli.wordlist {
        Some(path) => VocabFilter::with_word_list(path)?,
        None => VocabFilter::new(),
    };
    let words = filter.scan(&pipeline)?;
    info!("Extracting {} candidate words", words.len());

    // Run extraction
    let extractor = Extractor::new(pipeline, config);
    let summary = extractor.run(&words)?;

    println!("\n=== Extraction complete ===");
    println!("Extracted: {}", summary.extracted);
    println!("Skipped:   {} (already on disk)", summary.skipped);

    Ok(())
}

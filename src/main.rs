//! syneval CLI: targeted syntactic evaluation of GPT

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use syneval_rs::{Benchmark, EvalConfig, Evaluation, ScorerConfig, SynevalModel, DEFAULT_MODEL_ID};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "syneval")]
#[command(about = "Targeted syntactic evaluation of OpenAI GPT")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace`
    #[arg(short, long, global = true, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Skip pairs whose candidates contain unknown tokens
    #[arg(long, global = true)]
    skip_unknown: bool,

    /// Run the shared sentence prefix once per pair
    #[arg(long, global = true)]
    prefix_cache: bool,

    /// Continue past malformed sentences instead of aborting
    #[arg(long, global = true)]
    keep_going: bool,

    /// Write a JSON run summary to this path
    #[arg(long, global = true)]
    summary: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Marvin & Linzen (2018) minimal pairs
    Marvin(DatasetArgs),
    /// Gulordava et al. (2018) generated sentences
    Gul(DatasetArgs),
    /// Linzen, Goldberg & Dupoux (2016) agreement dataset
    Lgd(DatasetArgs),
}

#[derive(Args)]
struct DatasetArgs {
    /// Dataset file [default: the benchmark's usual file name]
    #[arg(long)]
    dataset: Option<PathBuf>,
}

impl Command {
    fn benchmark(&self) -> (Benchmark, Option<&PathBuf>) {
        match self {
            Self::Marvin(args) => (Benchmark::Marvin, args.dataset.as_ref()),
            Self::Gul(args) => (Benchmark::Gulordava, args.dataset.as_ref()),
            Self::Lgd(args) => (Benchmark::Lgd, args.dataset.as_ref()),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries only result records
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (benchmark, dataset) = match &cli.command {
        Some(command) => command.benchmark(),
        None => (Benchmark::Lgd, None),
    };
    let dataset_path = dataset
        .cloned()
        .unwrap_or_else(|| PathBuf::from(benchmark.default_dataset()));

    info!("Using model {}", cli.model);
    let model = SynevalModel::from_pretrained_with_device(&cli.model, cli.cpu)?;
    info!(
        "Model: {} layers, vocab {}",
        model.n_layers(),
        model.vocab_size()
    );

    let scorer = model.scorer(ScorerConfig {
        skip_unknown: cli.skip_unknown,
        reuse_prefix_cache: cli.prefix_cache,
    });
    let config = EvalConfig {
        benchmark,
        dataset_path,
        keep_going: cli.keep_going,
        ..Default::default()
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let summary = Evaluation::new(&scorer, config).run(&mut out)?;
    out.flush()?;

    if let Some(path) = &cli.summary {
        summary.write_json(path)?;
        info!("Summary saved to {}", path.display());
    }

    Ok(())
}

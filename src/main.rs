//! dictlearn-rs CLI: train and evaluate a Matroyshka batch top-k SAE

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use dictlearn_rs::{
    evaluate, load_dictionary, train_dictionary, ActivationSource, InMemoryActivations,
    MatroyshkaTrainer, TrainOptions, TrainerConfig,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dictlearn-rs")]
#[command(about = "Train Matroyshka batch top-k sparse autoencoders on cached activations")]
#[command(version)]
struct Cli {
    /// Safetensors file holding an (N, activation_dim) activation matrix
    #[arg(short, long)]
    activations: PathBuf,

    /// Name of the activation tensor inside the file
    #[arg(long, default_value = "activations")]
    tensor_name: String,

    /// Number of dictionary features
    #[arg(long, default_value_t = 4096)]
    dict_size: usize,

    /// Average active features per sample
    #[arg(short, long, default_value_t = 32)]
    k: usize,

    /// Comma-separated fraction of features per nested group
    #[arg(long, value_delimiter = ',', default_value = "0.0625,0.125,0.25,0.5625")]
    group_fractions: Vec<f64>,

    /// Optimizer steps
    #[arg(long, default_value_t = 10_000)]
    steps: usize,

    #[arg(long, default_value_t = 2048)]
    batch_size: usize,

    /// Base learning rate (scaled by dictionary width when omitted)
    #[arg(long)]
    lr: Option<f64>,

    #[arg(long, default_value_t = 1000)]
    warmup_steps: usize,

    /// Step at which the learning rate starts decaying to zero
    #[arg(long)]
    decay_start: Option<usize>,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Source model name recorded in the run config
    #[arg(long, default_value = "unknown")]
    lm_name: String,

    /// Source layer recorded in the run config
    #[arg(long, default_value_t = 0)]
    layer: usize,

    /// Log the loss every N steps
    #[arg(long, default_value_t = 100)]
    log_steps: usize,

    /// Comma-separated steps at which to write checkpoints
    #[arg(long, value_delimiter = ',')]
    save_steps: Vec<usize>,

    /// Batches used for evaluation after training
    #[arg(long, default_value_t = 10)]
    eval_batches: usize,

    /// Output run directory
    #[arg(short, long, default_value = "outputs/run")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
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

    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    println!("=== dictlearn-rs: Matroyshka batch top-k SAE ===");
    println!("Activations: {}", cli.activations.display());
    println!("Dictionary:  {} features, k={}", cli.dict_size, cli.k);
    println!("Output:      {}", cli.output.display());
    if cli.cpu {
        println!("Mode:        CPU (forced)");
    }

    let mut source = InMemoryActivations::from_safetensors(
        &cli.activations,
        &cli.tensor_name,
        cli.batch_size,
        cli.seed,
        &device,
    )?;
    let activation_dim = source.activation_dim();
    info!("{} activation vectors of width {}", source.len(), activation_dim);

    let config = TrainerConfig {
        lr: cli.lr,
        warmup_steps: cli.warmup_steps,
        decay_start: cli.decay_start,
        seed: Some(cli.seed),
        ..TrainerConfig::new(
            cli.steps,
            activation_dim,
            cli.dict_size,
            cli.k,
            cli.layer,
            cli.lm_name.clone(),
            cli.group_fractions.clone(),
        )
    };
    let mut trainer = MatroyshkaTrainer::new(config, &device)?;

    let options = TrainOptions {
        log_steps: Some(cli.log_steps),
        save_steps: cli.save_steps.clone(),
        save_dir: Some(cli.output.clone()),
    };
    let summary = train_dictionary(&mut source, &mut trainer, &options)?;
    println!("\n=== Training ===");
    println!("Steps:      {}", summary.steps_completed);
    if let Some(loss) = summary.final_loss {
        println!("Final loss: {loss:.5}");
    }

    // Evaluate the saved run, not the in-memory trainer
    let (dictionary, _) = load_dictionary(&cli.output, &device)?;
    let mut eval_source = InMemoryActivations::new(
        source.data().clone(),
        cli.batch_size,
        cli.seed.wrapping_add(1),
    )?
    .single_pass();
    let metrics = evaluate(&dictionary, &mut eval_source, cli.eval_batches)?;

    println!("\n=== Evaluation ===");
    println!("L2 loss:            {:.5}", metrics.l2_loss);
    println!("L0:                 {:.2}", metrics.l0);
    println!("Variance explained: {:.2}%", metrics.frac_variance_explained * 100.0);
    println!("Alive features:     {:.1}%", metrics.frac_alive * 100.0);

    let results_path = cli.output.join("eval_results.json");
    std::fs::write(&results_path, serde_json::to_string_pretty(&metrics)?)?;
    info!("Results saved to {}", results_path.display());

    Ok(())
}

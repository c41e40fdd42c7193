use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueHint};
use rand::rngs::StdRng;
use rand::SeedableRng;
use vnet::checkpoint::{CheckpointLoader, CheckpointSaver};
use vnet::model::{VNet2d, VNet2dConfig};
use vnet::module::parameter_count;
use vnet::tensor::{DeviceTensor, Shape, Tensor};
use vnet_backend_ref_cpu::CpuPortableBackend;

#[derive(Parser)]
#[command(author, version, about = "Initialise, inspect and run 2D V-Net checkpoints")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Randomly initialise a model and write it as a checkpoint
    Init(InitArgs),

    /// Print the configuration and parameter table of a checkpoint
    Inspect(InspectArgs),

    /// Run a random input batch through a checkpoint on the CPU backend
    Forward(ForwardArgs),
}

#[derive(Args)]
struct InitArgs {
    /// Destination checkpoint path
    #[arg(long, value_hint = ValueHint::FilePath)]
    out: PathBuf,

    #[arg(long, default_value_t = 1)]
    image_channels: usize,

    #[arg(long, default_value_t = 2)]
    num_classes: usize,

    /// Use per-channel PReLU instead of ELU
    #[arg(long)]
    prelu: bool,

    /// Enable dropout on the two deepest encoder and decoder stages
    #[arg(long)]
    deep_dropout: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    checkpoint: PathBuf,
}

#[derive(Args)]
struct ForwardArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    checkpoint: PathBuf,

    #[arg(long)]
    height: usize,

    #[arg(long)]
    width: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Seed for the random input batch
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Print the output shape of every stage
    #[arg(long)]
    trace: bool,
}

fn main() -> Result<()> {
    vnet::logging::init_tracing()?;
    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => init(args)?,
        Command::Inspect(args) => inspect(args)?,
        Command::Forward(args) => forward(args)?,
    }

    let report = vnet::profiling::take_report();
    if !report.is_empty() {
        eprintln!("{}", vnet::profiling::format_report(&report));
    }
    Ok(())
}

fn init(args: InitArgs) -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let mut config = VNet2dConfig::new(args.image_channels, args.num_classes, !args.prelu);
    config.deep_dropout = args.deep_dropout;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let model = VNet2d::random(config, backend, &mut rng)?;
    tracing::info!(seed = args.seed, "initialised model");
    CheckpointSaver::save(&args.out, &model)?;
    println!(
        "wrote {} ({} parameters)",
        args.out.display(),
        parameter_count(&model)?
    );
    Ok(())
}

fn inspect(args: InspectArgs) -> Result<()> {
    let loaded = CheckpointLoader::load(&args.checkpoint)?;
    println!("kind: {}", loaded.config.kind);
    println!("config: {}", serde_json::to_string_pretty(&loaded.config.config)?);
    let mut total = 0usize;
    for entry in &loaded.entries {
        let count: usize = entry.dims.iter().product();
        total += count;
        println!("{:<40} {:?} {:?}", entry.name, entry.dims, entry.dtype);
    }
    println!("tensors: {}, values: {}", loaded.entries.len(), total);
    Ok(())
}

fn forward(args: ForwardArgs) -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let loaded = CheckpointLoader::load(&args.checkpoint)?;
    let model = loaded
        .into_dyn_model(Arc::clone(&backend))
        .with_context(|| format!("failed to rebuild {}", args.checkpoint.display()))?;
    tracing::info!(kind = model.kind(), path = %args.checkpoint.display(), "loaded checkpoint");

    let shape = Shape::new([args.batch, model.image_channels(), args.height, args.width]);
    model.validate_input(&shape)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let x = DeviceTensor::from_host(Arc::clone(&backend), Tensor::randn(shape, 1.0, &mut rng))?;

    if args.trace {
        for (name, tensor) in model.forward_trace(&x)? {
            println!("{:<22} {:?}", name, tensor.shape().dims());
        }
    }

    let output = model.forward(&x)?;
    println!("logits:        {:?}", output.logits.shape().dims());
    println!("probabilities: {:?}", output.probabilities.shape().dims());

    let probs = output.probabilities.to_host()?;
    let dims = probs.shape().dims().to_vec();
    let (classes, plane) = (dims[1], dims[2] * dims[3]);
    for class in 0..classes {
        let mut sum = 0.0f64;
        for sample in probs.data().chunks(classes * plane) {
            sum += sample[class * plane..(class + 1) * plane]
                .iter()
                .map(|&v| v as f64)
                .sum::<f64>();
        }
        println!(
            "class {class}: mean probability {:.4}",
            sum / (args.batch * plane) as f64
        );
    }
    Ok(())
}

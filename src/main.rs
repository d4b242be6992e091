//! Spatial GCN - command line driver
//!
//! Train on ready-made batch files, predict with a checkpoint, or inspect
//! the pooling mask.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spatial_gcn::data::{load_batches, load_tensor, save_tensor};
use spatial_gcn::model::{
    build_disk_mask, load_checkpoint, save_checkpoint, ComputeContext, GridShape, SpatialGcn,
    DEFAULT_MASK_RADIUS,
};
use spatial_gcn::trainer::{predict, Trainer};
use spatial_gcn::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "spatial-gcn")]
#[command(about = "Graph convolutional regression over image-patch grids")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "GCN_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a fresh model on a batch file
    Train {
        /// Safetensors file with "{i}.x" / "{i}.y_mean" pairs
        #[arg(short, long)]
        data: PathBuf,

        /// YAML configuration file (defaults to ./config.yaml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of epochs (overrides config)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Compute device: cpu, cuda[:N], metal, auto (overrides config)
        #[arg(long)]
        device: Option<String>,

        /// Checkpoint output path (overrides config)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Run a trained model on an input tensor
    Predict {
        /// Checkpoint produced by `train`
        #[arg(long)]
        checkpoint: PathBuf,

        /// Safetensors file holding the input tensor "x"
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the predictions (tensor "y_pred")
        #[arg(short, long)]
        output: PathBuf,

        /// Only compute these output columns (comma separated)
        #[arg(long, value_delimiter = ',')]
        indices: Option<Vec<usize>>,

        /// Grid height of a flattened input
        #[arg(long, requires = "width")]
        height: Option<usize>,

        /// Grid width of a flattened input
        #[arg(long, requires = "height")]
        width: Option<usize>,

        #[arg(long, default_value = "auto")]
        device: String,
    },

    /// Print the disk pooling mask
    Mask {
        #[arg(short, long, default_value_t = DEFAULT_MASK_RADIUS)]
        radius: f64,
    },
}

fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Train {
            data,
            config,
            epochs,
            device,
            checkpoint,
        } => {
            let mut config = Config::from_yaml_and_env(config.as_deref())?;
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            if let Some(device) = device {
                config.device = device;
            }
            if let Some(path) = checkpoint {
                config.checkpoint_path = Some(path);
            }
            run_train(config, &data)
        }
        Commands::Predict {
            checkpoint,
            input,
            output,
            indices,
            height,
            width,
            device,
        } => {
            let grid = height.zip(width).map(|(h, w)| GridShape::new(h, w));
            run_predict(&checkpoint, &input, &output, indices, grid, &device)
        }
        Commands::Mask { radius } => {
            let mask = build_disk_mask(radius)?;
            println!(
                "radius {radius}: {side}x{side} grid, {count} cells selected",
                side = mask.side(),
                count = mask.count()
            );
            print!("{mask}");
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,spatial_gcn=debug,spatial_gcn_model=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn run_train(config: Config, data: &Path) -> Result<()> {
    let ctx = ComputeContext::parse(&config.device)?;
    let batches = load_batches(data, ctx.device())?;
    tracing::info!("Training on {} batches from {}", batches.len(), data.display());

    let mut model = SpatialGcn::new(config.model.clone(), ctx)?;
    let report = Trainer::from_config(&config).fit(&mut model, &batches)?;

    tracing::info!(
        "Training complete: {} steps, final loss {:?}",
        report.total_steps,
        report.final_loss()
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(path) = &config.checkpoint_path {
        save_checkpoint(&model, path)
            .with_context(|| format!("Failed to save checkpoint to {}", path.display()))?;
    }
    Ok(())
}

fn run_predict(
    checkpoint: &Path,
    input: &Path,
    output: &Path,
    indices: Option<Vec<usize>>,
    grid: Option<GridShape>,
    device: &str,
) -> Result<()> {
    let ctx = ComputeContext::parse(device)?;
    let x = load_tensor(input, "x", ctx.device())?;
    let mut model = load_checkpoint(checkpoint, ctx)?;

    let y_pred = predict(&mut model, &x, grid, indices.as_deref())?;
    save_tensor(&y_pred, "y_pred", output)?;
    tracing::info!(
        "Wrote predictions {:?} to {}",
        y_pred.dims(),
        output.display()
    );
    Ok(())
}

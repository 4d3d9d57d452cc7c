use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seed_diffusion::core_modules::utils::image_helper::{
    load_image_with_annotations, save_adjacent,
};
use seed_diffusion::{load_and_expand, LoadOptions, ParallelPropagator, PropagationConfig};

/// Expand sparse seed annotations into dense, mutually exclusive masks.
///
/// Each annotation image marks the seeds of one class. The expanded mask is
/// written next to it as `<stem>_expanded.<ext>`.
#[derive(Parser, Debug)]
#[command(name = "seed_expander", version, about)]
struct Cli {
    /// The image the annotations were drawn on.
    image_path: PathBuf,

    /// One annotation image per class.
    #[arg(required = true, num_args = 1..)]
    annotation_paths: Vec<PathBuf>,

    /// Side of the square neighborhood window (odd, >= 3).
    #[arg(long, env = "SEED_EXPANDER_WINDOW_SIZE", default_value_t = 3)]
    window_size: usize,

    /// Keep every n-th row and column of the inputs.
    #[arg(long, env = "SEED_EXPANDER_DOWN_SCALING", default_value_t = 1)]
    down_scaling: usize,

    /// Run channel affinities and per-class solves on the blocking pool.
    #[arg(long)]
    parallel: bool,

    /// Concurrent blocking tasks in parallel mode. Defaults to the CPU count.
    #[arg(long, env = "SEED_EXPANDER_WORKERS")]
    workers: Option<usize>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Argument Parsing & Setup ---
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = PropagationConfig::default().with_window_size(cli.window_size);
    if let Some(workers) = cli.workers {
        config = config.with_max_parallel_tasks(workers);
    }
    config
        .validate()
        .with_context(|| format!("invalid --window-size {}", cli.window_size))?;
    if cli.down_scaling == 0 {
        bail!("--down-scaling must be at least 1");
    }
    let options = LoadOptions {
        down_scaling: cli.down_scaling,
        ..LoadOptions::default()
    };

    // --- 2. Expansion ---
    let written = if cli.parallel {
        let propagator = ParallelPropagator::new(config)?;
        let (image, seeds) = load_image_with_annotations(&cli.image_path, &cli.annotation_paths, &options)
            .with_context(|| format!("loading {}", cli.image_path.display()))?;
        let expansion = propagator
            .expand(&image, &seeds)
            .await
            .context("expanding annotations")?;
        info!(counts = ?expansion.class_pixel_counts(), "class pixel counts");
        save_adjacent(&cli.annotation_paths, &expansion.masks).context("saving expanded masks")?
    } else {
        load_and_expand(&cli.image_path, &cli.annotation_paths, config, &options)
            .with_context(|| format!("expanding annotations on {}", cli.image_path.display()))?
    };

    // --- 3. Report ---
    for path in &written {
        info!(path = %path.display(), "wrote expanded mask");
    }
    Ok(())
}

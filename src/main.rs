//! bci-pipeline CLI
//!
//! Runs the pipeline against synthetic streams, checks configuration files
//! and, with the `server` feature, serves the HTTP control surface.

use anyhow::Context;
use bci_pipeline::{
    config::PipelineConfig,
    core::{Estimator, NearestCentroid, NullEstimator},
    pipeline::Pipeline,
    source::{SyntheticConfig, SyntheticRegistry},
    VERSION,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bci-pipeline")]
#[command(version = VERSION)]
#[command(about = "Marker-driven epoching and classification for live multi-channel streams", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train and test against synthetic streams
    Simulate {
        #[command(flatten)]
        synthetic: SyntheticArgs,

        /// Seconds spent in training mode
        #[arg(long, default_value = "20")]
        train_secs: u64,

        /// Seconds spent in test mode
        #[arg(long, default_value = "10")]
        test_secs: u64,

        /// Run without an estimator
        #[arg(long)]
        no_estimator: bool,
    },

    /// Check a configuration file without starting anything
    Validate {
        /// Path to the JSON configuration
        file: PathBuf,
    },

    /// Show current configuration
    Config,

    /// Serve the HTTP control surface over synthetic streams
    #[cfg(feature = "server")]
    Serve {
        #[command(flatten)]
        synthetic: SyntheticArgs,

        /// Port to listen on
        #[arg(long, default_value = "8765")]
        port: u16,

        /// Start acquisition immediately
        #[arg(long)]
        autostart: bool,
    },
}

#[derive(Args)]
struct SyntheticArgs {
    /// Number of synthetic data sources
    #[arg(long, default_value = "1")]
    sources: usize,

    /// Channels per source
    #[arg(long, default_value = "4")]
    channels: usize,

    /// Sampling rate in Hz
    #[arg(long, default_value = "250")]
    srate: f64,

    /// Marker labels, comma separated
    #[arg(long, default_value = "left,right")]
    labels: String,

    /// Seconds between markers
    #[arg(long, default_value = "1.5")]
    marker_interval: f64,
}

impl SyntheticArgs {
    fn registry(&self) -> SyntheticRegistry {
        SyntheticRegistry::new(SyntheticConfig {
            data_sources: self.sources,
            channels: self.channels,
            srate: self.srate,
            labels: self
                .labels
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            marker_interval: self.marker_interval,
            ..SyntheticConfig::default()
        })
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bci_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            synthetic,
            train_secs,
            test_secs,
            no_estimator,
        } => cmd_simulate(
            cli.config.as_deref(),
            &synthetic,
            train_secs,
            test_secs,
            no_estimator,
        ),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Config => cmd_config(cli.config.as_deref()),
        #[cfg(feature = "server")]
        Commands::Serve {
            synthetic,
            port,
            autostart,
        } => cmd_serve(cli.config.as_deref(), &synthetic, port, autostart),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load_from(path),
        None => PipelineConfig::load(),
    };
    config.context("Failed to load configuration")
}

fn cmd_simulate(
    config_path: Option<&Path>,
    synthetic: &SyntheticArgs,
    train_secs: u64,
    test_secs: u64,
    no_estimator: bool,
) -> anyhow::Result<()> {
    println!("bci-pipeline v{VERSION}");
    println!();

    let config = load_config(config_path)?;
    let estimator: Box<dyn Estimator> = if no_estimator {
        Box::new(NullEstimator)
    } else {
        Box::new(NearestCentroid::new())
    };
    let mut pipeline = Pipeline::new(config, Arc::new(synthetic.registry()), estimator);

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    pipeline.start().context("Failed to start pipeline")?;
    println!("Training for {train_secs}s (Ctrl+C to stop)...");
    wait_while_running(&running, Duration::from_secs(train_secs));

    if running.load(Ordering::SeqCst) {
        let info = pipeline.query_classifier_info()?;
        println!(
            "Classifier {:?} after {} training vectors",
            info.state, info.training_vectors
        );
        pipeline.set_test_mode();
        println!("Testing for {test_secs}s...");

        let deadline = Instant::now() + Duration::from_secs(test_secs);
        let mut last_seen = None;
        while running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(200));
            if let Some(guess) = pipeline.query_latest_guess()? {
                if last_seen != Some(guess.sequence_id) {
                    last_seen = Some(guess.sequence_id);
                    let verdict = if guess.prediction == guess.marker_label {
                        "hit"
                    } else {
                        "miss"
                    };
                    println!(
                        "  #{:<4} marker {:<8} predicted {:<8} {verdict}",
                        guess.sequence_id, guess.marker_label, guess.prediction
                    );
                }
            }
        }
    }

    let counts = pipeline.query_marker_counts()?;
    pipeline.stop()?;

    println!();
    println!("Epochs per label:");
    for (label, count) in &counts {
        println!("  {label}: {count}");
    }
    println!();
    println!("{}", pipeline.stats_summary());
    Ok(())
}

fn cmd_validate(file: &Path) -> anyhow::Result<()> {
    let config = PipelineConfig::load_from(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", file.display()))?;
    println!("{}: ok", file.display());
    println!(
        "  window: tmin {}s, tmax {}s, length {}s",
        config.epochs.global.tmin, config.epochs.global.tmax, config.epochs.global.window_length
    );
    println!("  overrides: {}", config.epochs.overrides.len());
    println!("  longest epoch span: {}s", config.epochs.max_span());
    Ok(())
}

fn cmd_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("Configuration");
    println!("=============");
    println!();
    println!(
        "Config file: {:?}",
        config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(PipelineConfig::config_path)
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(feature = "server")]
fn cmd_serve(
    config_path: Option<&Path>,
    synthetic: &SyntheticArgs,
    port: u16,
    autostart: bool,
) -> anyhow::Result<()> {
    use bci_pipeline::server::{run, ServerConfig};

    let config = load_config(config_path)?;
    let pipeline = Pipeline::new(
        config,
        Arc::new(synthetic.registry()),
        Box::new(NearestCentroid::new()),
    );
    let server_config = ServerConfig {
        port,
        autostart,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (addr, shutdown_tx) = run(server_config, pipeline).await?;
        println!("Listening on http://{addr} (Ctrl+C to stop)");
        tokio::signal::ctrl_c().await?;
        let _ = shutdown_tx.send(());
        Ok(())
    })
}

fn wait_while_running(running: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}

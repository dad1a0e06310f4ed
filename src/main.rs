use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use twincam::config::AppConfig;
use twincam::core::Orchestrator;
use twincam::core::merge_engine::MergeEngineType;
use twincam::logging::{self, LogConfig};
use twincam::{adapters, context};

#[derive(Parser)]
#[command(name = "twincam")]
#[command(about = "Synchronized two-camera capture daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file, in place of ./twincam.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the cameras and capture on every trigger
    Daemon(RunArgs),
    /// Probe every camera once
    Status,
    /// Bring cameras onto the network
    Connect {
        #[arg(long)]
        device: Option<String>,
    },
    /// Run a single capture cycle
    Capture(RunArgs),
    /// Append clip B to clip A
    Combine {
        clip_a: PathBuf,
        clip_b: PathBuf,
        output: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Default)]
struct RunArgs {
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    #[arg(long)]
    record_secs: Option<f64>,

    #[arg(long)]
    merge_engine: Option<MergeEngineType>,
}

/// CLI flags laid over the file and environment layers. Only flags that were
/// given are serialized.
#[derive(Serialize, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
    storage: StorageOverrides,
    capture: CaptureOverrides,
    combination: CombinationOverrides,
}

#[derive(Serialize, Default)]
struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    primary_dir: Option<PathBuf>,
}

#[derive(Serialize, Default)]
struct CaptureOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    record_secs: Option<f64>,
}

#[derive(Serialize, Default)]
struct CombinationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<MergeEngineType>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let mut overrides = Overrides {
            simulation: self.simulation,
            verbose: self.verbose,
            json_logs: self.json_logs,
            ..Default::default()
        };
        if let Commands::Daemon(args) | Commands::Capture(args) = &self.command {
            overrides.storage.primary_dir = args.storage_dir.clone();
            overrides.capture.record_secs = args.record_secs;
            overrides.combination.engine = args.merge_engine;
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides()))
        .context("Failed to load configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    config.validate().context("Invalid configuration")?;
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let adapters = adapters::get_adapters(&config, &config.devices())?;
    let orchestrator = Orchestrator::new(context::AppContext::new(config, adapters));

    match cli.command {
        Commands::Daemon(_) => orchestrator.start().await.context("Daemon stopped")?,
        Commands::Status => run_status(&orchestrator).await,
        Commands::Connect { device } => run_connect(&orchestrator, device.as_deref()).await?,
        Commands::Capture(_) => run_capture(&orchestrator).await?,
        Commands::Combine {
            clip_a,
            clip_b,
            output,
        } => {
            let report = orchestrator
                .combine(clip_a, clip_b, output)
                .await
                .context("Combination failed")?;
            println!(
                "{} ({}, {:.1}s, {} bytes)",
                report.output.display(),
                report.method,
                report.elapsed.as_secs_f64(),
                report.size_bytes
            );
        }
        Commands::Config => {}
    }

    Ok(())
}

async fn run_status(orchestrator: &Orchestrator) {
    for (device, state) in orchestrator.status().await {
        println!(
            "{:<12} {:<10} {:<15} {:<8} {state}",
            device.id, device.display_name, device.ip_address, device.interface,
        );
    }
}

async fn run_connect(orchestrator: &Orchestrator, device: Option<&str>) -> Result<()> {
    let connected = orchestrator.connect(device).await?;
    println!("{connected} device(s) connected");
    if connected == 0 {
        anyhow::bail!("no device connected");
    }
    Ok(())
}

async fn run_capture(orchestrator: &Orchestrator) -> Result<()> {
    let job = orchestrator.capture_once().await?;
    println!(
        "{}: recorded {}/{}, downloaded {}/{}",
        job.label(),
        job.records_ok(),
        job.records.len(),
        job.downloads_ok(),
        job.downloads.len()
    );
    for (device, result) in &job.downloads {
        match (&result.local_path, &result.error) {
            (Some(path), _) => println!("  {device}: {}", path.display()),
            (None, Some(error)) => println!("  {device}: failed ({error})"),
            (None, None) => println!("  {device}: failed"),
        }
    }
    if let Some(combination) = &job.combination {
        println!("  combined: {}", combination.output.display());
    }
    Ok(())
}

// sushi-eye command line interface
// Runs the detection loop against a camera and prints what it sees

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sushi_eye::camera::MediaDevices;
use sushi_eye::labels::japanese_name;
use sushi_eye::processing::format_label;
use sushi_eye::{CameraManager, CameraSelector, DetectionSystem, DetectorConfig, FacingMode};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sushi-eye")]
#[command(about = "Real-time sushi detection from a live camera", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection loop
    Run {
        /// Model path, https URL or stub://demo
        #[arg(long, short)]
        model: Option<String>,

        /// Camera device id
        #[arg(long, conflicts_with_all = ["facing", "label_facing"])]
        device: Option<String>,

        /// Request a camera by facing mode
        #[arg(long, value_enum, conflicts_with = "label_facing")]
        facing: Option<Facing>,

        /// Pick a camera by matching its label against a facing mode
        #[arg(long, value_enum)]
        label_facing: Option<Facing>,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Write the final overlay to this PNG file
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// List cameras
    Devices,

    /// Show the label table under the configured class-index convention
    Labels,
}

#[derive(Clone, Copy, ValueEnum)]
enum Facing {
    User,
    Environment,
}

impl From<Facing> for FacingMode {
    fn from(facing: Facing) -> Self {
        match facing {
            Facing::User => FacingMode::User,
            Facing::Environment => FacingMode::Environment,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("sushi_eye={0},sushi_cli={0}", default_level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            model,
            device,
            facing,
            label_facing,
            duration_secs,
            snapshot,
        } => {
            let mut config = config;
            if let Some(model) = model {
                config.model_source = model;
            }
            if let Some(id) = device {
                config.camera = CameraSelector::DeviceId { id };
            } else if let Some(facing) = facing {
                config.camera = CameraSelector::Facing { mode: facing.into() };
            } else if let Some(facing) = label_facing {
                config.camera = CameraSelector::LabelHeuristic { mode: facing.into() };
            }
            config.validate()?;
            run(config, duration_secs, snapshot, cli.json).await?;
        }
        Commands::Devices => {
            list_devices(&config, cli.json);
        }
        Commands::Labels => {
            show_labels(&config, cli.json)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DetectorConfig> {
    let mut config = match path {
        Some(path) => DetectorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DetectorConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

/// Webcams are asked for the surface size up front so frames need no rescale.
#[cfg(feature = "opencv")]
fn platform(config: &DetectorConfig) -> Arc<dyn MediaDevices> {
    let devices = sushi_eye::camera::webcam::OpenCvMediaDevices::default();
    match config.surface {
        sushi_eye::SurfaceConfig::Fixed { width, height } => {
            Arc::new(devices.with_requested_size(width, height))
        }
        sushi_eye::SurfaceConfig::AspectLocked { .. } => Arc::new(devices),
    }
}

#[cfg(not(feature = "opencv"))]
fn platform(_config: &DetectorConfig) -> Arc<dyn MediaDevices> {
    Arc::new(sushi_eye::camera::synthetic::SyntheticMediaDevices::front_and_back())
}

async fn run(
    config: DetectorConfig,
    duration_secs: Option<u64>,
    snapshot: Option<PathBuf>,
    json_output: bool,
) -> anyhow::Result<()> {
    info!("Starting detector with model {}", config.model_source);
    let devices = platform(&config);
    let system = DetectionSystem::start(config, devices).await?;
    if !system.wait_for_model().await {
        warn!("No model loaded; the loop will run without detections");
    }

    let mut events = system.subscribe();
    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(frame) if json_output => {
                    let detections: Vec<_> = frame.detections.iter().map(|d| json!({
                        "slot": d.slot,
                        "class_id": d.class_id,
                        "label": d.label,
                        "score": d.score,
                        "bbox": [d.bbox.x, d.bbox.y, d.bbox.width, d.bbox.height],
                    })).collect();
                    println!("{}", json!({ "sequence": frame.sequence, "detections": detections }));
                }
                Ok(frame) => {
                    if !frame.detections.is_empty() {
                        let labels: Vec<String> = frame
                            .detections
                            .iter()
                            .map(|d| format_label(&d.label, d.score))
                            .collect();
                        println!("#{:<6} {}", frame.sequence, labels.join(" | "));
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Dropped {} detection frames", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    system.shutdown().await;
    let stats = system.stats();
    if json_output {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "Cycles: {} completed, {} failed, {} ticks skipped",
            stats.scheduler.cycles_completed,
            stats.scheduler.cycles_failed,
            stats.scheduler.skipped_ticks
        );
    }

    if let Some(path) = snapshot {
        system
            .snapshot()
            .save_png(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Snapshot written to {}", path.display());
    }
    Ok(())
}

fn list_devices(config: &DetectorConfig, json_output: bool) {
    let manager = CameraManager::new(platform(config));
    let devices = manager.list_devices();
    if json_output {
        let list: Vec<_> = devices
            .iter()
            .map(|d| json!({ "id": d.id, "label": d.label }))
            .collect();
        println!("{}", json!(list));
        return;
    }
    if devices.is_empty() {
        println!("No cameras found");
    }
    for device in devices {
        println!("{:<24} {}", device.id, device.label);
    }
}

fn show_labels(config: &DetectorConfig, json_output: bool) -> anyhow::Result<()> {
    let table = config.label_table()?;
    let rows: Vec<(usize, &str)> = table
        .iter()
        .enumerate()
        .filter_map(|(pos, label)| table.class_index_of(pos).map(|idx| (idx, label)))
        .collect();
    if json_output {
        let map: Vec<_> = rows
            .iter()
            .map(|(idx, label)| {
                json!({ "class_index": idx, "label": label, "japanese": japanese_name(label) })
            })
            .collect();
        println!("{}", json!(map));
    } else {
        println!("Class index base: {:?}", table.base());
        for (idx, label) in rows {
            match japanese_name(label) {
                Some(ja) => println!("{:>3}  {} ({})", idx, label, ja),
                None => println!("{:>3}  {}", idx, label),
            }
        }
    }
    Ok(())
}

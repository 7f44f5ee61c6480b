//! Recovery Builder CLI
//!
//! ## Commands
//!
//! - `devices`: list the device database
//! - `check`: explain whether a device supports a flavor
//! - `build`: run one build in the foreground
//! - `status`: show a run from its report
//! - `artifacts`: list produced artifacts
//! - `history`: list past builds
//! - `stats`: show cross-run statistics
//! - `add-device`: register a custom device tree
//! - `init`: write a default settings file

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use recovery_builder::devices::DeviceTreeSource;
use recovery_builder::log_collector::init_global_logger;
use recovery_builder::orchestrator::BuildEvent;
use recovery_builder::{
    ArtifactFilter, DeviceInfo, Orchestrator, ProcessToolchain, RecoveryFlavor, Settings,
    Workspace,
};

#[derive(Parser)]
#[command(name = "recovery_builder")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build TWRP and Orange Fox recovery images", long_about = None)]
struct Cli {
    /// Settings file (default: <workspace>/recovery_builder.toml)
    #[arg(short, long, global = true, env = "RECOVERY_BUILDER_CONFIG")]
    config: Option<PathBuf>,

    /// Workspace root, overriding the settings file
    #[arg(short, long, global = true, env = "RECOVERY_BUILDER_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Echo log lines to stderr and enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known devices
    Devices,

    /// Check device/flavor compatibility
    Check {
        device: String,
        #[arg(default_value = "twrp")]
        flavor: String,
    },

    /// Build a recovery image and wait for it
    Build {
        /// Device codename
        device: String,

        /// Recovery flavor (twrp, orange_fox)
        #[arg(short, long, default_value = "twrp")]
        flavor: String,

        /// Flavor version, e.g. 3.7.0_12 or 12.1
        #[arg(short = 'V', long)]
        version: String,

        /// Build option toggle, `name` or `name=false`; repeatable
        #[arg(short, long = "option")]
        options: Vec<String>,
    },

    /// Show the status of a finished run
    Status { run_id: String },

    /// List artifacts
    Artifacts {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        flavor: Option<String>,
    },

    /// List past builds, newest first
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show build statistics
    Stats,

    /// Register a custom device tree
    AddDevice {
        codename: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        vendor: String,
        #[arg(long)]
        tree_url: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        kernel_url: Option<String>,
        #[arg(long, default_value = "arm64")]
        arch: String,
        #[arg(long, default_value = "unknown")]
        platform: String,
        #[arg(long, default_value = "12")]
        android_version: String,
        /// Comma-separated flavors
        #[arg(long, default_value = "twrp", value_delimiter = ',')]
        flavors: Vec<String>,
    },

    /// Write a default settings file
    Init,
}

fn load_settings(cli: &Cli) -> Result<(Settings, PathBuf)> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let root = cli
                .workspace
                .clone()
                .unwrap_or_else(|| Settings::default().workspace_root);
            Workspace::new(root)?.settings_file()
        }
    };

    let mut settings = Settings::load_or_default(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(workspace) = &cli.workspace {
        settings.workspace_root = workspace.clone();
    }
    Ok((settings, path))
}

fn parse_options(raw: &[String]) -> Result<HashMap<String, bool>> {
    let mut options = HashMap::new();
    for item in raw {
        let (key, value) = match item.split_once('=') {
            Some((key, value)) => {
                let enabled = match value.trim() {
                    "true" | "1" | "yes" | "on" => true,
                    "false" | "0" | "no" | "off" => false,
                    other => bail!("option {}: '{}' is not a boolean", key, other),
                };
                (key.trim().to_string(), enabled)
            }
            None => (item.trim().to_string(), true),
        };
        options.insert(key, value);
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (settings, settings_path) = load_settings(&cli)?;

    if let Commands::Init = cli.command {
        settings
            .save(&settings_path)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        println!("Wrote {}", settings_path.display());
        return Ok(());
    }

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let process_log = Workspace::new(&settings.workspace_root)?
        .process_log_file()
        .context("creating the log directory")?;
    let logger = init_global_logger(&process_log, level, cli.verbose)
        .map_err(anyhow::Error::msg)?;

    let orchestrator = Orchestrator::new(settings, Arc::new(ProcessToolchain::new()))
        .context("initializing workspace")?;

    let result = run(&cli, &orchestrator).await;
    let _ = logger.wait_for_empty().await;
    result
}

async fn run(cli: &Cli, orchestrator: &Orchestrator) -> Result<()> {
    match &cli.command {
        Commands::Devices => {
            for device in orchestrator.list_devices() {
                let flavors: Vec<&str> = device
                    .compatible_flavors
                    .iter()
                    .map(|f| f.display_name())
                    .collect();
                println!(
                    "{:<14} {:<10} {:<28} {}{}",
                    device.codename,
                    device.vendor,
                    device.display_name,
                    flavors.join(", "),
                    if device.custom { " (custom)" } else { "" }
                );
            }
        }
        Commands::Check { device, flavor } => {
            let flavor: RecoveryFlavor = flavor.parse()?;
            let (compatible, reason) = orchestrator.compatibility(device, flavor);
            println!("{}", reason);
            if !compatible {
                bail!("{} cannot build {}", device, flavor);
            }
        }
        Commands::Build {
            device,
            flavor,
            version,
            options,
        } => {
            let options = parse_options(options)?;
            let mut events = orchestrator.subscribe();
            let handle = orchestrator.submit(device, flavor, version, &options).await?;
            println!("Submitted {}", handle.run_id);

            let run_id = handle.run_id.clone();
            let verbose = cli.verbose;
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if event.run_id() != run_id {
                        continue;
                    }
                    match event {
                        BuildEvent::StageChanged { stage, .. } => println!("==> {}", stage),
                        BuildEvent::Log { line, .. } if verbose => println!("{}", line),
                        BuildEvent::Finished { .. } => break,
                        _ => {}
                    }
                }
            });

            let report = orchestrator.wait(&handle.run_id).await?;
            let _ = printer.await;

            println!(
                "{} {} in {:.1}s",
                report.run_id, report.outcome, report.duration_secs
            );
            for artifact in &report.artifacts {
                println!("  {}  {}", artifact.sha256, artifact.path.display());
            }
            if !report.is_success() {
                bail!(
                    "build failed at {}: {}",
                    report
                        .failed_stage
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown stage".into()),
                    report.error.unwrap_or_default()
                );
            }
        }
        Commands::Status { run_id } => {
            let status = orchestrator.status(run_id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Artifacts { device, flavor } => {
            let filter = ArtifactFilter {
                device: device.clone(),
                flavor: flavor
                    .as_deref()
                    .map(str::parse::<RecoveryFlavor>)
                    .transpose()?,
            };
            for artifact in orchestrator.list_artifacts(&filter)? {
                println!(
                    "{:<8?} {:>12} {} {}",
                    artifact.kind,
                    artifact.size,
                    artifact.sha256,
                    artifact.path.display()
                );
            }
        }
        Commands::History { limit } => {
            for report in orchestrator.history()?.iter().take(*limit) {
                println!(
                    "{} {:<8} {:>8.1}s {}",
                    report.timestamp,
                    report.outcome.to_string(),
                    report.duration_secs,
                    report.run_id
                );
            }
        }
        Commands::Stats => {
            let stats = orchestrator.statistics();
            println!(
                "{} builds, {} succeeded, {} failed ({:.0}% success)",
                stats.total_builds,
                stats.successful_builds,
                stats.failed_builds,
                stats.success_rate() * 100.0
            );
            for (codename, device) in &stats.per_device {
                println!(
                    "  {:<14} {:>4} builds {:>4} ok {:>8.1}s avg",
                    codename, device.builds, device.successes, device.average_duration_secs
                );
            }
        }
        Commands::AddDevice {
            codename,
            name,
            vendor,
            tree_url,
            branch,
            kernel_url,
            arch,
            platform,
            android_version,
            flavors,
        } => {
            let compatible_flavors = flavors
                .iter()
                .map(|f| f.parse::<RecoveryFlavor>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let device = DeviceInfo {
                codename: codename.clone(),
                display_name: name.clone(),
                vendor: vendor.clone(),
                arch: arch.clone(),
                platform: platform.clone(),
                android_version: android_version.clone(),
                compatible_flavors,
                tree: DeviceTreeSource {
                    url: tree_url.clone(),
                    branch: branch.clone(),
                    kernel_url: None,
                },
                custom: true,
            };
            let added =
                orchestrator.add_custom_device(device, tree_url, kernel_url.as_deref())?;
            println!("Registered {} ({})", added.codename, added.display_name);
        }
        // Handled before the orchestrator starts.
        Commands::Init => {}
    }
    Ok(())
}

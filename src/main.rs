//! Notchnet CLI
//!
//! Drives a network of (simulated) Notch sensors through the full session
//! lifecycle from the command line.

use anyhow::Context;
use clap::{Parser, Subcommand};
use notchnet_core::cli::{hex_preview, print_exit_codes, CliResult, OutputFormat};
use notchnet_core::config::{self, AppConfig};
use notchnet_core::{
    CaptureMode, Descriptor, NotchService, ServiceEvent, SimulatedDiscovery, Workout,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Notchnet CLI
#[derive(Parser, Debug)]
#[command(
    name = "notchnet",
    version,
    about = "Session coordinator for Notch wireless sensor networks",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "NOTCHNET_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover nearby sensors
    Scan {
        /// Wait for a sensor that was not seen by the first pass
        #[arg(long)]
        new: bool,
    },

    /// Run a workout: init, configure, capture, download, disconnect
    Run {
        /// Workout definition (TOML)
        workout: Option<PathBuf>,

        /// Bind every responding sensor instead of a workout
        #[arg(long, conflicts_with = "workout")]
        unchecked: bool,

        /// Capture for this long (ms); overrides the workout's capture mode
        #[arg(short, long)]
        duration_ms: Option<u64>,

        /// Download file
        #[arg(short, long, default_value = "measurement.notch")]
        output: PathBuf,

        /// Light the slot colors during the capture
        #[arg(long)]
        show_colors: bool,

        /// Power the sensors off instead of disconnecting
        #[arg(long)]
        power_off: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the exit code table
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return CliResult::from(&err).to_exit_code();
        }
    };
    init_tracing(&cli, &config);

    let result = match &cli.command {
        Commands::Scan { new } => scan(&cli, &config, *new).await,
        Commands::Run {
            workout,
            unchecked,
            duration_ms,
            output,
            show_colors,
            power_off,
        } => {
            let options = RunOptions {
                workout: workout.as_deref(),
                unchecked: *unchecked,
                duration: duration_ms.map(Duration::from_millis),
                output,
                show_colors: *show_colors,
                power_off: *power_off,
            };
            run(&cli, &config, options).await
        }
        Commands::Config { action } => handle_config(&cli, &config, action),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let result = CliResult::from(&err);
            if let Some(message) = result.message() {
                eprintln!("Error: {message}");
            }
            result.to_exit_code()
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(path).map_err(Into::into),
        None => AppConfig::load().map_err(Into::into),
    }
}

fn init_tracing(cli: &Cli, config: &AppConfig) {
    let level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => config.logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn service(config: &AppConfig) -> NotchService {
    let discovery = SimulatedDiscovery::from_configs(&config.simulator.devices)
        .with_scan_delay(Duration::from_millis(config.simulator.scan_delay_ms));
    let service = NotchService::new(Arc::new(discovery), config.service_config());

    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServiceEvent::StateChanged(t) => tracing::debug!("{} -> {}", t.from, t.to),
                ServiceEvent::Device {
                    address,
                    notification,
                } => tracing::debug!("{}: {:?}", address, notification),
                other => tracing::trace!("{:?}", other),
            }
        }
    });
    service
}

fn emit<T: serde::Serialize>(cli: &Cli, text: &str, value: &T) -> anyhow::Result<()> {
    if cli.quiet && cli.format == OutputFormat::Text {
        return Ok(());
    }
    println!("{}", cli.format.render(text, value)?);
    Ok(())
}

async fn scan(cli: &Cli, config: &AppConfig, new: bool) -> anyhow::Result<()> {
    let service = service(config);
    let devices = service.scan().result().await.context("scan failed")?;

    let devices = if new {
        let seen = devices.iter().map(|d| d.address.clone());
        let device = service
            .scan_for_new(seen)
            .result()
            .await
            .context("waiting for a new sensor")?;
        vec![device]
    } else {
        devices
    };

    let text = if devices.is_empty() {
        "No sensors found.".to_string()
    } else {
        devices
            .iter()
            .map(|d| format!("{}  {}", d.address, d.display_name()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    emit(cli, &text, &devices)
}

struct RunOptions<'a> {
    workout: Option<&'a Path>,
    unchecked: bool,
    duration: Option<Duration>,
    output: &'a Path,
    show_colors: bool,
    power_off: bool,
}

async fn run(cli: &Cli, config: &AppConfig, options: RunOptions<'_>) -> anyhow::Result<()> {
    let service = service(config);

    let network = if options.unchecked {
        service.unchecked_init().result().await
    } else {
        let path = options
            .workout
            .context("a workout file is required unless --unchecked is given")?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read workout {}", path.display()))?;
        service.init(Workout::from_toml(&content)?).result().await
    }
    .context("network init failed")?;
    tracing::info!(
        "network generation {} bound: {} sensor(s)",
        network.generation(),
        network.len()
    );

    let mode = match options.duration {
        Some(d) => CaptureMode::TimedCapture {
            duration_ms: d.as_millis() as u64,
        },
        None => network.workout().capture_mode.clone(),
    };

    let result = capture_and_download(cli, &service, &mode, &options).await;

    let teardown = if options.power_off {
        service.shut_down()
    } else {
        service.disconnect()
    };
    let teardown = teardown.result().await.context("teardown failed");

    result?;
    teardown
}

async fn capture_and_download(
    cli: &Cli,
    service: &NotchService,
    mode: &CaptureMode,
    options: &RunOptions<'_>,
) -> anyhow::Result<()> {
    let show_colors = options.show_colors;

    let descriptor: Descriptor = match mode {
        CaptureMode::Steady => {
            service.configure_steady(show_colors).result().await?;
            let session = service.steady().result().await.context("steady failed")?;
            let data = service.get_steady_data().result().await?;
            if cli.format == OutputFormat::Text && !cli.quiet {
                for (address, payload) in &data {
                    println!("{address}  {}", hex_preview(payload, 12));
                }
            }
            session.into()
        }
        CaptureMode::Capture => {
            service.configure_capture(show_colors).result().await?;
            let id = service.capture().result().await.context("capture failed")?;
            tracing::info!("capture {} running, press Ctrl-C to stop", id);
            tokio::signal::ctrl_c().await?;
            service.stop().result().await.context("stop failed")?.into()
        }
        CaptureMode::TimedCapture { duration_ms } => {
            let duration = Duration::from_millis(*duration_ms);
            service.configure_timed_capture(duration, show_colors).result().await?;
            let capture = service.timed_capture();
            tracing::info!("timed capture for {:?}", duration);
            capture.wait().await.into_result().context("timed capture failed")?.into()
        }
    };

    let file = tokio::fs::File::create(options.output)
        .await
        .with_context(|| format!("cannot create {}", options.output.display()))?;
    let output = service
        .download(descriptor.clone(), file)
        .result()
        .await
        .context("download failed")?;

    let report = &output.report;
    let text = format!(
        "{} {} from {} sensor(s): {} byte(s) in {:?} -> {}",
        match &descriptor {
            Descriptor::Steady(_) => "steady session",
            Descriptor::Capture(_) => "measurement",
        },
        report.descriptor,
        report.devices.len(),
        report.total_bytes,
        report.elapsed,
        options.output.display()
    );
    let value = serde_json::json!({
        "descriptor": descriptor,
        "output": options.output,
        "total_bytes": report.total_bytes,
        "elapsed_ms": report.elapsed.as_millis() as u64,
        "devices": report.devices.iter().map(|d| serde_json::json!({
            "address": d.address,
            "slot": d.slot_index,
            "bytes": d.bytes,
        })).collect::<Vec<_>>(),
    });
    emit(cli, &text, &value)
}

fn handle_config(cli: &Cli, config: &AppConfig, action: &ConfigAction) -> anyhow::Result<()> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => config::config_path(),
    };

    match action {
        ConfigAction::Show => {
            let text = toml::to_string_pretty(config)?;
            emit(cli, text.trim_end(), config)
        }
        ConfigAction::Path => {
            let path = path.context("could not determine config directory")?;
            emit(cli, &path.display().to_string(), &path)
        }
        ConfigAction::Init { force } => {
            let path = path.context("could not determine config directory")?;
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            AppConfig::default().save_to(&path)?;
            emit(cli, &format!("wrote {}", path.display()), &path)
        }
    }
}

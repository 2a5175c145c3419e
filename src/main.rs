mod config;
mod report;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use wave_recon_core::{
    list_devices, AcquisitionError, ModeController, SessionStatus, SyntheticSignal,
};

use config::{AppConfig, RunMode};
use report::ReportWriter;

#[derive(Parser, Debug)]
#[command(name = "wave-recon", version)]
#[command(about = "Scan RF spectrum with an RTL-SDR (or a simulated feed) and report detected signals")]
struct Cli {
    /// Also append log records to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an acquisition session until Ctrl-C or the duration elapses
    Run(RunArgs),
    /// List attached RTL-SDR devices
    Devices,
    /// Show or reset the stored configuration
    Config {
        /// Print only the configuration file location
        #[arg(long)]
        path: bool,
        /// Overwrite the stored configuration with defaults
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Source selection
    #[arg(short, long, value_enum)]
    mode: Option<RunMode>,

    /// Center frequency in Hz
    #[arg(short = 'f', long)]
    center_frequency: Option<f64>,

    /// Sample rate in Hz
    #[arg(short, long)]
    sample_rate: Option<f64>,

    /// Manual tuner gain in dB (automatic when omitted)
    #[arg(short, long)]
    gain: Option<f64>,

    /// RTL-SDR device index
    #[arg(long)]
    device: Option<u32>,

    /// Frequency correction in PPM
    #[arg(long, allow_hyphen_values = true)]
    ppm: Option<i32>,

    /// Simulation RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Synthetic signal as FREQ_HZ:BANDWIDTH_HZ:POWER_DB; replaces the configured ones
    #[arg(long = "signal", value_parser = parse_signal, allow_hyphen_values = true)]
    signals: Vec<SyntheticSignal>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Append every detection to a CSV file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Print reports as JSON lines instead of text
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    /// Layer command-line overrides on top of the stored configuration.
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(frequency) = self.center_frequency {
            config.center_frequency = frequency;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if self.gain.is_some() {
            config.gain_db = self.gain;
        }
        if let Some(device) = self.device {
            config.device_index = device;
        }
        if let Some(ppm) = self.ppm {
            config.ppm_correction = ppm;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if !self.signals.is_empty() {
            config.signals.clone_from(&self.signals);
        }
        config
    }
}

fn parse_signal(value: &str) -> Result<SyntheticSignal, String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [frequency, bandwidth, power] = parts.as_slice() else {
        return Err(format!("expected FREQ:BW:POWER, got '{value}'"));
    };
    let number = |field: &str, name: &str| {
        field
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid {name} '{field}': {e}"))
    };
    let bandwidth = number(*bandwidth, "bandwidth")?;
    if bandwidth < 0.0 {
        return Err(format!("bandwidth must not be negative, got {bandwidth}"));
    }
    #[allow(clippy::cast_possible_truncation, reason = "signal powers are small dB values")]
    let power_db = number(*power, "power")? as f32;
    Ok(SyntheticSignal {
        frequency: number(*frequency, "frequency")?,
        bandwidth,
        power_db,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = AppConfig::load();
    let filter = loaded
        .as_ref()
        .map_or_else(|_| "info".to_string(), |c| c.log_filter.clone());
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| loaded.as_ref().ok().and_then(|c| c.log_file.clone()));
    init_logging(&filter, log_file.as_deref())?;

    match cli.command {
        Command::Run(args) => {
            let config = loaded.context("failed to load configuration")?;
            run(&args, args.apply(config)).await
        }
        Command::Devices => {
            show_devices();
            Ok(())
        }
        Command::Config { path, reset } => show_config(loaded, path, reset),
    }
}

/// Copies each log record to stderr and a file.
struct Tee<W: Write> {
    file: W,
}

impl<W: Write> Write for Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(filter: &str, log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));

    if let Some(path) = log_file {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }

    builder.init();
    Ok(())
}

async fn run(args: &RunArgs, config: AppConfig) -> Result<()> {
    let csv_sink = args
        .csv
        .as_ref()
        .map(|path| {
            File::create(path).with_context(|| format!("failed to create {}", path.display()))
        })
        .transpose()?;
    let mut writer = ReportWriter::new(csv_sink, args.json);

    let mut controller = ModeController::new(config.pipeline.clone());
    let mut reports = controller.subscribe();
    start_session(&mut controller, &config)?;

    let deadline = async {
        match args.duration {
            Some(secs) if secs > 0.0 => tokio::time::sleep(Duration::from_secs_f64(secs)).await,
            _ => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut health = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to listen for Ctrl-C")?;
                info!("Interrupted, stopping");
                break;
            }
            () = &mut deadline => {
                info!("Duration elapsed, stopping");
                break;
            }
            _ = health.tick() => {
                if controller.status() == SessionStatus::Error {
                    error!("Acquisition failed, stopping session");
                    break;
                }
            }
            received = reports.recv() => match received {
                Ok(report) => writer.write(&report)?,
                Err(RecvError::Lagged(skipped)) => warn!("Output fell behind, skipped {skipped} reports"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let session = controller.session();
    controller.stop();
    let stats = controller.stats();

    // Reports published before the workers exited are still queued.
    loop {
        match reports.try_recv() {
            Ok(report) => writer.write(&report)?,
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }

    let reports_seen = writer.reports();
    let detections_seen = writer.detections();
    writer.finish()?;

    println!();
    if let Some(session) = session {
        println!("Session {} ({} source)", session.id, session.mode);
        println!("  Started:   {}", session.started_at.to_rfc3339());
    }
    println!("  Acquired:  {} blocks", stats.blocks_acquired);
    println!("  Processed: {} blocks", stats.blocks_processed);
    println!("  Dropped:   {} blocks", stats.blocks_dropped);
    println!("  Rejected:  {} blocks", stats.blocks_rejected);
    println!("  Reports:   {reports_seen} ({detections_seen} detections)");
    if let Some(path) = &args.csv {
        println!("  CSV:       {}", path.display());
    }
    Ok(())
}

/// Bind the configured source and start; `auto` falls back to simulation.
fn start_session(controller: &mut ModeController, config: &AppConfig) -> Result<()> {
    let source = config.source_config();

    match config.mode {
        RunMode::Simulated => {
            controller.set_simulation_mode_with(config.simulation_config())?;
            controller.start(source)?;
        }
        RunMode::Hardware => {
            controller.set_hardware_mode_with(config.hardware_options())?;
            controller
                .start(source)
                .context("failed to start hardware session")?;
        }
        RunMode::Auto => {
            if list_devices().is_empty() {
                info!("No RTL-SDR devices found, falling back to simulation");
                controller.set_simulation_mode_with(config.simulation_config())?;
                controller.start(source)?;
                return Ok(());
            }

            controller.set_hardware_mode_with(config.hardware_options())?;
            match controller.start(source.clone()) {
                Ok(()) => {}
                Err(AcquisitionError::DeviceUnavailable(reason)) => {
                    warn!("Hardware unavailable ({reason}), falling back to simulation");
                    controller.set_simulation_mode_with(config.simulation_config())?;
                    controller.start(source)?;
                }
                Err(e) => bail!("failed to start hardware session: {e}"),
            }
        }
    }
    Ok(())
}

fn show_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("No RTL-SDR devices found");
        if cfg!(not(feature = "hardware")) {
            println!("(built without the `hardware` feature)");
        }
        return;
    }
    for device in devices {
        println!("[{}] {} (serial {})", device.index, device.name, device.serial);
    }
}

fn show_config(
    loaded: Result<AppConfig, confy::ConfyError>,
    path_only: bool,
    reset: bool,
) -> Result<()> {
    let path = AppConfig::get_config_path().context("failed to resolve configuration path")?;

    if path_only {
        println!("{}", path.display());
        return Ok(());
    }

    if reset {
        AppConfig::default()
            .save()
            .context("failed to write default configuration")?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // Loading first creates the file with defaults when it is missing.
    loaded.context("failed to load configuration")?;
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    println!("# {}", path.display());
    print!("{contents}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        let signal = parse_signal("100500000:50000:-30").unwrap();
        assert_eq!(signal.frequency, 100.5e6);
        assert_eq!(signal.bandwidth, 50e3);
        assert_eq!(signal.power_db, -30.0);

        assert!(parse_signal("100e6:0").is_err());
        assert!(parse_signal("100e6:-5:-30").is_err());
        assert!(parse_signal("abc:0:-30").is_err());
    }

    #[test]
    fn test_run_args_override_config() {
        let cli = Cli::try_parse_from([
            "wave-recon",
            "run",
            "--mode",
            "simulated",
            "--center-frequency",
            "433920000",
            "--gain",
            "20.7",
            "--signal",
            "433950000:0:-40",
            "--ppm",
            "-3",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };

        let config = args.apply(AppConfig::default());
        assert_eq!(config.mode, RunMode::Simulated);
        assert_eq!(config.center_frequency, 433.92e6);
        assert_eq!(config.gain_db, Some(20.7));
        assert_eq!(config.ppm_correction, -3);
        assert_eq!(config.signals.len(), 1);
        assert_eq!(config.sample_rate, AppConfig::default().sample_rate);
    }

    #[test]
    fn test_tee_copies_records_to_file() {
        let mut tee = Tee { file: Vec::new() };
        write!(tee, "[INFO] session started").unwrap();
        tee.flush().unwrap();
        assert_eq!(tee.file, b"[INFO] session started");
    }

    #[test]
    fn test_log_file_flag_is_global() {
        let cli = Cli::try_parse_from(["wave-recon", "devices", "--log-file", "logs/wave-recon.log"]).unwrap();
        assert_eq!(cli.log_file, Some(PathBuf::from("logs/wave-recon.log")));
    }

    #[test]
    fn test_auto_mode_falls_back_to_simulation() {
        if !list_devices().is_empty() {
            return;
        }
        let config = AppConfig::default();
        let mut controller = ModeController::new(config.pipeline.clone());
        start_session(&mut controller, &config).unwrap();

        let session = controller.session().unwrap();
        assert_eq!(session.mode, wave_recon_core::SourceKind::Simulated);
        controller.stop();
    }
}

//! `nsim-daq`: sample the N-SIM environmental instruments from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nsim_daq::adapters::{available_ports, SerialAdapter, SharedPort};
use nsim_daq::config::{Settings, DEFAULT_DRY_MFC_ADDRESS, DEFAULT_WET_MFC_ADDRESS};
use nsim_daq::data::{spawn_refresh, CsvLogger, PlotBuffer, PlotGroup};
use nsim_daq::instrument::{Driver, FlowController, Hygrometer};
use nsim_daq::measurement::Channel;
use nsim_daq::SamplingOrchestrator;
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nsim-daq", version, about = "N-SIM microscope environmental control")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect all instruments and log readings until Ctrl+C (default)
    Monitor(MonitorArgs),
    /// Print the hygrometer's automatic output for a while
    HygrometerStream {
        /// How long to listen, in seconds
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
    },
    /// Set the hygrometer's automatic output interval
    HygrometerInterval {
        /// Interval in seconds
        #[arg(long, default_value_t = 1)]
        seconds: u32,
    },
    /// Print a status snapshot of each configured flow controller
    MfcStatus,
    /// List serial ports
    Ports,
}

#[derive(clap::Args, Debug, Default)]
struct MonitorArgs {
    /// Sampling interval in seconds (overrides the config file)
    #[arg(long)]
    interval: Option<f64>,
    /// Dry air flow setpoint (ml/min)
    #[arg(long)]
    dry_flow: Option<f32>,
    /// Wet air flow setpoint (ml/min)
    #[arg(long)]
    wet_flow: Option<f32>,
    /// Keep going without asking when some instruments failed to connect
    #[arg(long, short = 'y')]
    yes: bool,
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.application.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    init_tracing(&settings);
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "Config file not found, using defaults and environment");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match cli.command.unwrap_or(Command::Monitor(MonitorArgs::default())) {
        Command::Monitor(args) => runtime.block_on(monitor(settings, args)),
        Command::HygrometerStream { duration } => {
            runtime.block_on(hygrometer_stream(&settings, duration))
        }
        Command::HygrometerInterval { seconds } => {
            runtime.block_on(hygrometer_interval(&settings, seconds))
        }
        Command::MfcStatus => runtime.block_on(mfc_status(&settings)),
        Command::Ports => list_ports(),
    }
}

async fn confirm(prompt: &str) -> Result<bool> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || -> Result<bool> {
        let mut stdout = std::io::stdout();
        write!(stdout, "{prompt} (y/n): ")?;
        stdout.flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(answer.trim().eq_ignore_ascii_case("y"))
    })
    .await
    .context("Prompt task failed")?
}

fn interval_from_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("Interval must be a positive number of seconds, got {secs}");
    }
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("Interval of {secs} seconds is out of range"))
}

/// Turn the interrupt signal into a stop request. If the signal cannot be
/// installed the sender is held until the session ends, since dropping it
/// would also stop the loop.
async fn forward_stop<F>(signal: F, stop_tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Stop requested");
            let _ = stop_tx.send(true);
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl+C; monitoring continues until the process is killed");
            stop_tx.closed().await;
        }
    }
}

async fn monitor(settings: Settings, args: MonitorArgs) -> Result<()> {
    let interval = match args.interval {
        Some(secs) => interval_from_secs(secs)?,
        None => settings.application.sample_interval,
    };
    if settings.devices.is_empty() {
        warn!("No instruments configured; readings will be empty");
    }

    let mut orchestrator = SamplingOrchestrator::from_settings(&settings.devices);
    let report = orchestrator.connect_devices().await;
    if !report.all_connected {
        for failed in report.failed() {
            warn!(role = %failed.role, error = failed.error.as_deref().unwrap_or(""), "Device unavailable");
        }
        let proceed = args.yes
            || confirm("Some devices failed to connect. Continue anyway?")
                .await
                .unwrap_or(false);
        if !proceed {
            orchestrator.shutdown().await;
            bail!("Aborted: not all devices connected");
        }
    }

    if args.dry_flow.is_some() || args.wet_flow.is_some() {
        let setpoints = orchestrator.set_flow_rates(args.dry_flow, args.wet_flow).await;
        info!(dry = %setpoints.dry, wet = %setpoints.wet, "Setpoints");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(forward_stop(tokio::signal::ctrl_c(), stop_tx));

    let mut logger = CsvLogger::from_config(&settings.application);
    let mut plot = PlotBuffer::new(settings.plot.max_points);
    let refresh = spawn_refresh(plot.subscribe(), settings.plot.refresh_interval, |snapshot| {
        for group in PlotGroup::ALL {
            let points: usize = snapshot.group(group).iter().map(|(_, s)| s.len()).sum();
            debug!(chart = group.title(), readings = snapshot.len(), points, "Plot refresh");
        }
        if let Some(latest) = snapshot.latest() {
            for channel in Channel::ALL {
                if let Some(value) = latest.get(channel) {
                    debug!(series = channel.label(), value, unit = channel.unit(), "Latest point");
                }
            }
        }
    });

    let summary = orchestrator
        .run(interval, &mut logger, &mut plot, stop_rx)
        .await
        .context("Monitoring session failed")?;
    drop(plot);
    let _ = refresh.await;

    info!(
        cycles = summary.cycles,
        log_failures = summary.log_failures,
        file = ?logger.current_path(),
        "Session finished"
    );
    Ok(())
}

fn serial_port(settings: &nsim_daq::config::SerialSettings) -> SharedPort {
    SharedPort::new(Box::new(SerialAdapter::new(settings.clone())))
}

async fn connected_hygrometer(settings: &Settings) -> Result<Hygrometer> {
    let Some(cfg) = &settings.devices.hygrometer else {
        bail!("No [devices.hygrometer] section in the configuration");
    };
    let mut hygrometer = Hygrometer::from_config("hygrometer", cfg, serial_port(&cfg.serial));
    hygrometer
        .connect()
        .await
        .with_context(|| format!("Failed to connect to hygrometer on {}", cfg.serial.port))?;
    Ok(hygrometer)
}

async fn hygrometer_stream(settings: &Settings, duration: f64) -> Result<()> {
    let duration = interval_from_secs(duration)?;
    let mut hygrometer = connected_hygrometer(settings).await?;
    info!(?duration, "Reading continuous output");
    let result = hygrometer
        .read_stream(duration, |s| {
            println!(
                "DP={:6.2}°C  AT={:6.2}°C  RH={:6.2}%",
                s.dewpoint, s.ambient_temperature, s.relative_humidity
            );
        })
        .await;
    if let Err(e) = hygrometer.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    let count = result?;
    info!(samples = count, "Done");
    Ok(())
}

async fn hygrometer_interval(settings: &Settings, seconds: u32) -> Result<()> {
    let mut hygrometer = connected_hygrometer(settings).await?;
    let result = hygrometer.set_output_interval(seconds).await;
    if let Err(e) = hygrometer.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    for line in result? {
        println!("{line}");
    }
    Ok(())
}

async fn mfc_status(settings: &Settings) -> Result<()> {
    let devices = &settings.devices;
    let shared = match (&devices.dry_mfc, &devices.wet_mfc) {
        (Some(d), Some(w)) if d.serial.port == w.serial.port => Some(serial_port(&d.serial)),
        _ => None,
    };
    let controllers = [
        ("dry_mfc", devices.dry_mfc.as_ref(), DEFAULT_DRY_MFC_ADDRESS),
        ("wet_mfc", devices.wet_mfc.as_ref(), DEFAULT_WET_MFC_ADDRESS),
    ];
    if controllers.iter().all(|(_, cfg, _)| cfg.is_none()) {
        bail!("No flow controllers configured");
    }

    for (id, cfg, default_address) in controllers {
        let Some(cfg) = cfg else { continue };
        let port = shared.clone().unwrap_or_else(|| serial_port(&cfg.serial));
        let mut mfc = FlowController::from_config(id, cfg, default_address, port);
        if let Err(e) = mfc.connect().await {
            println!("{id}: unavailable ({e})");
            continue;
        }
        match mfc.status().await {
            Ok(s) => println!(
                "{id} (station {}): flow {:.2} ml/min, setpoint {:.2} ml/min, temperature {:.2} °C, valve {:.1} %",
                mfc.station(),
                s.flow,
                s.setpoint,
                s.temperature,
                s.valve_signal
            ),
            Err(e) => println!("{id}: status read failed ({e})"),
        }
        if let Err(e) = mfc.disconnect().await {
            warn!(device = id, error = %e, "Disconnect failed");
        }
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for (name, kind) in ports {
        println!("{name}\t{kind}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_secs_rejects_bad_values() {
        assert_eq!(interval_from_secs(0.5).unwrap(), Duration::from_millis(500));
        assert!(interval_from_secs(0.0).is_err());
        assert!(interval_from_secs(-1.0).is_err());
        assert!(interval_from_secs(f64::NAN).is_err());
        assert!(interval_from_secs(1e30).is_err());
    }

    #[tokio::test]
    async fn test_interrupt_sends_stop() {
        let (tx, mut rx) = watch::channel(false);
        forward_stop(async { Ok(()) }, tx).await;
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_signal_error_keeps_session_running() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(forward_stop(
            async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no handler")) },
            tx,
        ));
        tokio::task::yield_now().await;

        // Sender still alive and no stop sent
        assert!(!*rx.borrow_and_update());
        assert!(!task.is_finished());
        let changed = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        assert!(changed.is_err());

        drop(rx);
        task.await.unwrap();
    }
}

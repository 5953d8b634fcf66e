// src/main.rs
use anyhow::{Context, bail};
use clap::Parser;
use std::{
    fs::File,
    io,
    net::{Ipv4Addr, TcpListener},
    path::Path,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, info};

mod ata;
mod config;
mod disk;
mod error;
mod fan;
mod input;
mod logging;
mod panel;
mod scheduler;
mod sensors;
mod status;

use config::{CliArgs, Config};
use disk::{AtaBackend, DiskMonitor};
use error::{NasError, Result};
use fan::{PwmDevice, ThermalController};
use panel::LogPanel;
use scheduler::{EventSources, Exit, Scheduler, ShutdownCommand};
use sensors::{HWMON_BASE, HwmonSensors, SensorMonitor};
use status::NET_CLASS_BASE;

fn open_input(path: &Path) -> Result<File> {
    let file = File::open(path).map_err(|source| NasError::DeviceOpen {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Opened input device {}", path.display());
    Ok(file)
}

fn bind_status(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .and_then(|l| l.set_nonblocking(true).map(|()| l))
        .map_err(|source| NasError::StatusSocket { port, source })?;
    info!("Status service listening on 127.0.0.1:{}", port);
    Ok(listener)
}

/// Put SIGHUP back to ignored after ctrlc claimed it; only SIGINT and
/// SIGTERM stop the daemon.
fn ignore_hangup() -> io::Result<()> {
    // SAFETY: SIG_IGN installs no handler code.
    if unsafe { libc::signal(libc::SIGHUP, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn run(cli: CliArgs) -> anyhow::Result<ExitCode> {
    // Setup termination flag for SIGINT and SIGTERM
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Termination signal received");
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting termination signal handler")?;
    ignore_hangup().context("Error ignoring SIGHUP")?;

    let file_config = config::load_config_file(cli.config.as_deref());
    let config = Config::merge(cli, file_config).context("Configuration error")?;
    info!("Starting hardware monitor for {}", config.model);

    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        bail!("Root required.");
    }

    let shutdown = ShutdownCommand::locate(config.shutdown_command.as_deref())?;
    info!("Shutdown command: {}", shutdown.program().display());

    let power = open_input(&config.power_device).context("Power button unavailable")?;
    let buttons = config
        .button_device
        .as_deref()
        .map(open_input)
        .transpose()
        .context("Front panel buttons unavailable")?;

    let hwmon = HwmonSensors::open(Path::new(HWMON_BASE), &config.sensors)
        .context("Failed to resolve board sensors")?;

    let nodes = disk::scan_disk_nodes(&config.disk_dir)?;
    let mut disks = DiskMonitor::new(AtaBackend::default(), config.disk);
    disks
        .enumerate(&nodes)
        .context("Disk pass-through transport unavailable")?;

    let status = bind_status(config.port)?;

    // Fan control is taken last: from here on every exit goes through finish().
    let pwm = PwmDevice::open(&config.fan_device).context("Failed to take fan control")?;
    let initial_duty = pwm.original_duty();
    let controller = ThermalController::new(pwm, config.thermal, initial_duty);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let panel = LogPanel::new(&config.model, now);

    let mut scheduler = Scheduler::new(
        config.model.clone(),
        disks,
        SensorMonitor::new(hwmon),
        controller,
        panel,
        NET_CLASS_BASE.into(),
        config.nics.clone(),
    );
    let mut sources = EventSources {
        power: Some(power),
        buttons,
        status,
    };

    let exit = scheduler.run(&mut sources, &running);
    drop(sources);
    scheduler.finish(exit, &shutdown)?;

    Ok(match exit {
        Exit::Failed => ExitCode::FAILURE,
        Exit::Terminated | Exit::PowerOff => ExitCode::SUCCESS,
    })
}

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    logging::init_tracing(&cli.log_level);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

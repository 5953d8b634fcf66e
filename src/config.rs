// src/config.rs
//! Command line and TOML configuration. Precedence: CLI > file > default.

use clap::Parser;
use directories::ProjectDirs;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::disk::DiskThresholds;
use crate::error::{NasError, Result};
use crate::fan::{Band, ThermalThresholds};
use crate::sensors::SensorId;

pub const DEFAULT_PORT: u16 = 9100;
const TEMP_RANGE: (f64, f64) = (-50.0, 150.0);

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    model: Option<String>,
    power_device: Option<PathBuf>,
    button_device: Option<PathBuf>,
    fan_device: Option<PathBuf>,
    port: Option<u16>,
    nics: Option<Vec<String>>,
    shutdown_command: Option<PathBuf>,
    disk_dir: Option<PathBuf>,
    cpu_notice: Option<f64>,
    cpu_halt: Option<f64>,
    board_notice: Option<f64>,
    board_halt: Option<f64>,
    disk_notice: Option<u8>,
    disk_halt: Option<u8>,
    sensors: Option<BTreeMap<SensorId, String>>,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "NAS hardware monitor: disk and board temperatures, fan control, power button.", long_about = None)]
pub struct CliArgs {
    /// Optional path to a TOML configuration file.
    #[arg(long, short = 'c', value_name = "FILE_PATH")]
    pub config: Option<PathBuf>,

    /// Log filter (e.g. "info", "nasguard=debug"); RUST_LOG wins if set.
    #[arg(long, default_value = "info", value_name = "FILTER")]
    pub log_level: String,

    /// Model name shown on the panel and in logs.
    #[arg(long, short = 'm')]
    model: Option<String>,

    /// Input event device carrying the power button.
    #[arg(long, value_name = "DEVICE")]
    power_device: Option<PathBuf>,

    /// Input event device of the front-panel buttons.
    #[arg(long, value_name = "DEVICE")]
    button_device: Option<PathBuf>,

    /// hwmon PWM file driving the system fan, e.g. /sys/class/hwmon/hwmon1/pwm3.
    #[arg(long, value_name = "PWM_FILE")]
    fan_device: Option<PathBuf>,

    /// Loopback TCP port of the status service.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Network interfaces reported in the status snapshot.
    #[arg(long = "nic", value_name = "IFACE")]
    nics: Vec<String>,

    /// Shutdown binary (default: /sbin/shutdown or /usr/sbin/shutdown).
    #[arg(long, value_name = "PATH")]
    shutdown_command: Option<PathBuf>,

    /// Directory scanned for sdX disk nodes.
    #[arg(long, value_name = "DIR")]
    disk_dir: Option<PathBuf>,

    /// Board sensor binding, repeatable: LABEL=<device_name>/<base_filename>.
    #[arg(long = "sensor", value_name = "LABEL=SPEC")]
    sensors: Vec<String>,

    #[arg(long, value_name = "TEMP_C")] cpu_notice: Option<f64>,
    #[arg(long, value_name = "TEMP_C")] cpu_halt: Option<f64>,
    #[arg(long, value_name = "TEMP_C")] board_notice: Option<f64>,
    #[arg(long, value_name = "TEMP_C")] board_halt: Option<f64>,
    #[arg(long, value_name = "TEMP_C")] disk_notice: Option<u8>,
    #[arg(long, value_name = "TEMP_C")] disk_halt: Option<u8>,
}

/// Effective settings, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub power_device: PathBuf,
    pub button_device: Option<PathBuf>,
    pub fan_device: PathBuf,
    pub port: u16,
    pub nics: Vec<String>,
    pub shutdown_command: Option<PathBuf>,
    pub disk_dir: PathBuf,
    pub sensors: BTreeMap<SensorId, String>,
    pub thermal: ThermalThresholds,
    pub disk: DiskThresholds,
}

fn sensor_by_label(label: &str) -> Option<SensorId> {
    SensorId::ALL.into_iter().find(|id| id.label() == label)
}

fn parse_sensor_arg(arg: &str) -> Result<(SensorId, String)> {
    let (label, spec) = arg.split_once('=').ok_or_else(|| {
        NasError::Config(format!("Invalid sensor binding '{}'. Expected LABEL=SPEC.", arg))
    })?;
    let id = sensor_by_label(label.trim())
        .ok_or_else(|| NasError::Config(format!("Unknown sensor label '{}'", label)))?;
    Ok((id, spec.trim().to_string()))
}

fn required<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| NasError::Config(format!("{} must be provided", what)))
}

/// Look for `--config`, then the per-user config dir, then `./nasguard.toml`.
/// A missing or broken file falls back to defaults with a warning.
pub fn load_config_file(config_path: Option<&Path>) -> FileConfig {
    let mut config_path_to_load = config_path.map(Path::to_path_buf);

    if config_path_to_load.is_none() {
        if let Some(proj_dirs) = ProjectDirs::from("org", "nasguard", "nasguard") {
            let user_config_path = proj_dirs.config_dir().join("config.toml");
            if user_config_path.exists() {
                config_path_to_load = Some(user_config_path);
            }
        }
    }
    if config_path_to_load.is_none() {
        let current_dir_path = PathBuf::from("./nasguard.toml");
        if current_dir_path.exists() {
            config_path_to_load = Some(current_dir_path);
        }
    }

    let Some(path) = config_path_to_load else {
        info!("No config file specified or found in default locations.");
        return FileConfig::default();
    };

    info!("Loading configuration from: {}", path.display());
    match fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Failed to parse config file '{}': {}", path.display(), e);
                FileConfig::default()
            }
        },
        Err(e) => {
            warn!("Failed to read config file '{}': {}", path.display(), e);
            FileConfig::default()
        }
    }
}

impl Config {
    pub fn merge(cli: CliArgs, file: FileConfig) -> Result<Config> {
        let mut sensors = file.sensors.unwrap_or_default();
        for arg in &cli.sensors {
            let (id, spec) = parse_sensor_arg(arg)?;
            sensors.insert(id, spec);
        }

        let nics = if cli.nics.is_empty() {
            file.nics.unwrap_or_default()
        } else {
            cli.nics
        };

        let disk = DiskThresholds {
            notice: cli.disk_notice.or(file.disk_notice).unwrap_or(45),
            halt: cli.disk_halt.or(file.disk_halt).unwrap_or(55),
        };

        let config = Config {
            model: required(cli.model.or(file.model), "Model name")?,
            power_device: required(cli.power_device.or(file.power_device), "Power button device")?,
            button_device: cli.button_device.or(file.button_device),
            fan_device: required(cli.fan_device.or(file.fan_device), "Fan PWM device")?,
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            nics,
            shutdown_command: cli.shutdown_command.or(file.shutdown_command),
            disk_dir: cli
                .disk_dir
                .or(file.disk_dir)
                .unwrap_or_else(|| PathBuf::from("/dev")),
            sensors,
            thermal: ThermalThresholds {
                cpu: Band {
                    notice: cli.cpu_notice.or(file.cpu_notice).unwrap_or(40.0),
                    halt: cli.cpu_halt.or(file.cpu_halt).unwrap_or(70.0),
                },
                board: Band {
                    notice: cli.board_notice.or(file.board_notice).unwrap_or(40.0),
                    halt: cli.board_halt.or(file.board_halt).unwrap_or(60.0),
                },
                disk: Band {
                    notice: f64::from(disk.notice),
                    halt: f64::from(disk.halt),
                },
            },
            disk,
        };

        validate_parameters(&config)?;
        Ok(config)
    }
}

fn check_band(name: &str, band: &Band) -> Result<()> {
    if band.notice >= band.halt {
        return Err(NasError::Config(format!(
            "Invalid {} range: notice ({:.1}°C) must be less than halt ({:.1}°C)",
            name, band.notice, band.halt
        )));
    }
    if band.halt < TEMP_RANGE.0 || band.halt > TEMP_RANGE.1 {
        return Err(NasError::Config(format!(
            "{} halt ({:.1}°C) is outside reasonable range (-50 to 150°C)",
            name, band.halt
        )));
    }
    Ok(())
}

/// Checks run before any hardware is touched.
pub fn validate_parameters(config: &Config) -> Result<()> {
    check_band("CPU", &config.thermal.cpu)?;
    check_band("board", &config.thermal.board)?;
    check_band("disk", &config.thermal.disk)?;

    if config.port == 0 {
        return Err(NasError::Config("Status port must be non-zero".to_string()));
    }
    for id in [SensorId::Cpu, SensorId::System] {
        if !config.sensors.contains_key(&id) {
            return Err(NasError::Config(format!(
                "Sensor binding for {} is required",
                id.label()
            )));
        }
    }
    Ok(())
}

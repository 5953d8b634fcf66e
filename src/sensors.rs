// src/sensors.rs
//! Board sensors read from hwmon: temperatures, fan speed and supply rails.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, ReadDir},
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

use crate::error::{NasError, Result};

pub const HWMON_BASE: &str = "/sys/class/hwmon";

/// Seconds between checks of the non-thermal readings.
pub const SENSOR_UPDATE_INTERVAL: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SensorId {
    #[serde(rename = "CPU")]
    Cpu,
    System,
    Fan,
    Vcore,
    V1_2,
    V3_3,
    V5_0,
    V12,
}

impl SensorId {
    pub const ALL: [SensorId; 8] = [
        SensorId::Cpu,
        SensorId::System,
        SensorId::Fan,
        SensorId::Vcore,
        SensorId::V1_2,
        SensorId::V3_3,
        SensorId::V5_0,
        SensorId::V12,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SensorId::Cpu => "CPU",
            SensorId::System => "System",
            SensorId::Fan => "Fan",
            SensorId::Vcore => "Vcore",
            SensorId::V1_2 => "V1_2",
            SensorId::V3_3 => "V3_3",
            SensorId::V5_0 => "V5_0",
            SensorId::V12 => "V12",
        }
    }

    /// hwmon reports temperatures and voltages in milli-units, fans in RPM.
    fn scale(self) -> f64 {
        match self {
            SensorId::Fan => 1.0,
            _ => 1000.0,
        }
    }

    /// Readings that feed the fan loop and are checked on every tick.
    pub fn is_thermal(self) -> bool {
        matches!(self, SensorId::Cpu | SensorId::System)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    #[serde(skip)]
    pub label: &'static str,
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "Min")]
    pub min: f64,
    #[serde(rename = "Max")]
    pub max: f64,
}

impl SensorReading {
    /// Out of range: below min, or above a non-zero max.
    pub fn fails(&self) -> bool {
        self.value < self.min || (self.max != 0.0 && self.value > self.max)
    }
}

/// Source of live readings. Limits are fixed when the source is built.
pub trait SensorSource {
    fn sample(&mut self, id: SensorId) -> Result<SensorReading>;
    fn ids(&self) -> Vec<SensorId>;
}

// --- hwmon-backed source ---

#[derive(Debug, Clone)]
struct HwmonChannel {
    input: PathBuf,
    min: f64,
    max: f64,
}

#[derive(Debug)]
pub struct HwmonSensors {
    channels: BTreeMap<SensorId, HwmonChannel>,
}

fn parse_spec(spec: &str) -> Result<(&str, &str)> {
    spec.split_once('/').ok_or_else(|| {
        NasError::Config(format!(
            "Invalid sensor spec '{}'. Expected '<device_name>/<base_filename>'.",
            spec
        ))
    })
}

fn find_hwmon_path_by_name(base: &Path, device_name: &str) -> Result<PathBuf> {
    let entries: ReadDir = fs::read_dir(base)?;
    let mut found_path: Option<PathBuf> = None;

    for entry in entries {
        let path = entry?.path();
        let is_hwmon = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with("hwmon"));
        if !is_hwmon {
            continue;
        }

        let Ok(name_content) = fs::read_to_string(path.join("name")) else {
            continue;
        };
        if name_content.trim() == device_name {
            if found_path.is_some() {
                return Err(NasError::Config(format!(
                    "Multiple hwmon directories found for device name '{}'",
                    device_name
                )));
            }
            found_path = Some(path);
        }
    }

    found_path.ok_or_else(|| {
        NasError::Config(format!("No hwmon directory found for device name '{}'", device_name))
    })
}

fn read_scaled(path: &Path, scale: f64) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse::<f64>().ok().map(|v| v / scale)
}

impl HwmonSensors {
    /// Resolve every `(id, "<chip>/<base>")` spec under the hwmon tree at `base`.
    pub fn open(base: &Path, specs: &BTreeMap<SensorId, String>) -> Result<Self> {
        let mut channels = BTreeMap::new();

        for (&id, spec) in specs {
            let (device, file_base) = parse_spec(spec)?;
            let dir = find_hwmon_path_by_name(base, device)?;
            let input = dir.join(format!("{}_input", file_base));
            if !input.exists() {
                return Err(NasError::Sensor {
                    label: id.label().to_string(),
                    reason: format!("{} does not exist", input.display()),
                });
            }

            let scale = id.scale();
            let channel = HwmonChannel {
                min: read_scaled(&dir.join(format!("{}_min", file_base)), scale).unwrap_or(0.0),
                max: read_scaled(&dir.join(format!("{}_max", file_base)), scale).unwrap_or(0.0),
                input,
            };
            info!(
                "sensor {}: {}, min={}, max={}",
                id.label(),
                channel.input.display(),
                channel.min,
                channel.max
            );
            channels.insert(id, channel);
        }

        Ok(HwmonSensors { channels })
    }
}

impl SensorSource for HwmonSensors {
    fn sample(&mut self, id: SensorId) -> Result<SensorReading> {
        let channel = self.channels.get(&id).ok_or_else(|| NasError::Sensor {
            label: id.label().to_string(),
            reason: "not configured".to_string(),
        })?;
        let value = read_scaled(&channel.input, id.scale()).ok_or_else(|| NasError::Sensor {
            label: id.label().to_string(),
            reason: format!("unreadable value in {}", channel.input.display()),
        })?;
        Ok(SensorReading {
            label: id.label(),
            value,
            min: channel.min,
            max: channel.max,
        })
    }

    fn ids(&self) -> Vec<SensorId> {
        self.channels.keys().copied().collect()
    }
}

// --- Threshold monitor ---

/// Latest readings plus the cadence of the threshold checks.
pub struct SensorMonitor<S: SensorSource> {
    source: S,
    readings: BTreeMap<SensorId, SensorReading>,
    last_full_check: Option<i64>,
}

impl<S: SensorSource> SensorMonitor<S> {
    pub fn new(source: S) -> Self {
        SensorMonitor {
            source,
            readings: BTreeMap::new(),
            last_full_check: None,
        }
    }

    pub fn readings(&self) -> &BTreeMap<SensorId, SensorReading> {
        &self.readings
    }

    pub fn value(&self, id: SensorId) -> Option<f64> {
        self.readings.get(&id).map(|r| r.value)
    }

    /// Sample and check thresholds; returns the number of failing readings.
    ///
    /// CPU and System are checked every call, everything else once per
    /// [`SENSOR_UPDATE_INTERVAL`]. An unreadable sensor keeps its last value.
    pub fn update(&mut self, now: i64) -> usize {
        let full = self
            .last_full_check
            .is_none_or(|last| now - last >= SENSOR_UPDATE_INTERVAL);

        let mut failures = 0;
        for id in self.source.ids() {
            if !full && !id.is_thermal() {
                continue;
            }
            match self.source.sample(id) {
                Ok(reading) => {
                    debug!("{}: value {:.2}", reading.label, reading.value);
                    if reading.fails() {
                        if reading.value < reading.min {
                            error!(
                                "sensor {}: value {:.2} below low limit({})",
                                reading.label, reading.value, reading.min
                            );
                        } else {
                            error!(
                                "sensor {}: value {:.2} beyond high limit({})",
                                reading.label, reading.value, reading.max
                            );
                        }
                        failures += 1;
                    }
                    self.readings.insert(id, reading);
                }
                Err(e) => warn!("{}", e),
            }
        }

        if full {
            self.last_full_check = Some(now);
        }
        failures
    }
}

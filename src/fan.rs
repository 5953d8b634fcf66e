// src/fan.rs
//! System fan control: temperature fusion, smoothing and the PWM output gate.

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info};

use crate::error::{NasError, Result};

pub const HISTORY_LEN: usize = 6;

/// Oldest to newest; sums to 1.
pub const HISTORY_WEIGHTS: [f64; HISTORY_LEN] = [0.05, 0.075, 0.1125, 0.1688, 0.2532, 0.3405];

/// Smaller duty changes are held back to keep the fan from hunting.
pub const MIN_DUTY_STEP: u8 = 4;
/// Ticks after which the duty cycle is rewritten even if unchanged.
pub const MAX_SKIPPED_TICKS: u32 = 36;

// --- PWM device ---

fn enable_path_for(pwm_path: &Path) -> PathBuf {
    let mut name = pwm_path.as_os_str().to_os_string();
    name.push("_enable");
    PathBuf::from(name)
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| NasError::PwmRead {
            path: path.to_path_buf(),
            source,
        })
}

fn write_value(path: &Path, value: &str) -> Result<()> {
    fs::write(path, format!("{}\n", value)).map_err(|source| NasError::PwmWrite {
        path: path.to_path_buf(),
        source,
    })
}

pub trait PwmOutput {
    fn write_duty(&mut self, duty: u8) -> Result<()>;
    /// Hand the fan back in the state it was found.
    fn restore(self) -> Result<()>
    where
        Self: Sized;
}

/// hwmon `pwmN` file plus its `pwmN_enable` sibling.
///
/// Opening takes manual control; [`PwmOutput::restore`] hands the fan back
/// to the firmware.
#[derive(Debug)]
pub struct PwmDevice {
    pwm_path: PathBuf,
    enable_path: PathBuf,
    original_duty: u8,
    original_enable: String,
}

impl PwmDevice {
    pub fn open(pwm_path: &Path) -> Result<Self> {
        let enable_path = enable_path_for(pwm_path);
        info!("Fan device: {}, {}", enable_path.display(), pwm_path.display());

        let original_enable = read_trimmed(&enable_path)?;
        let duty_text = read_trimmed(pwm_path)?;
        let original_duty = duty_text
            .parse::<u8>()
            .map_err(|e| NasError::PwmRead {
                path: pwm_path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
        info!("Initial pwm output: {}, enable: '{}'", original_duty, original_enable);

        if original_enable != "1" {
            write_value(&enable_path, "1")?;
            info!("Manual PWM control enabled.");
        }

        Ok(PwmDevice {
            pwm_path: pwm_path.to_path_buf(),
            enable_path,
            original_duty,
            original_enable,
        })
    }

    pub fn original_duty(&self) -> u8 {
        self.original_duty
    }
}

impl PwmOutput for PwmDevice {
    fn write_duty(&mut self, duty: u8) -> Result<()> {
        write_value(&self.pwm_path, &duty.to_string())
    }

    fn restore(self) -> Result<()> {
        info!(
            "Restoring PWM {} and mode '{}' on {}",
            self.original_duty,
            self.original_enable,
            self.pwm_path.display()
        );
        write_value(&self.pwm_path, &self.original_duty.to_string())?;
        if self.original_enable != "1" {
            write_value(&self.enable_path, &self.original_enable)?;
        }
        Ok(())
    }
}

// --- Control law ---

/// Temperature band over which the fan ramps from 0 to full.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub notice: f64,
    pub halt: f64,
}

impl Band {
    pub fn fraction(&self, temp: f64) -> f64 {
        (temp - self.notice) / (self.halt - self.notice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalThresholds {
    pub cpu: Band,
    pub board: Band,
    pub disk: Band,
}

/// Recent CPU samples; unseeded until the first sample fills every slot.
#[derive(Debug, Clone, Default)]
pub struct ThermalHistory {
    samples: [f64; HISTORY_LEN],
    warm: bool,
}

impl ThermalHistory {
    pub fn push(&mut self, temp: f64) {
        if !self.warm {
            self.samples = [temp; HISTORY_LEN];
            self.warm = true;
        } else {
            self.samples.rotate_left(1);
            self.samples[HISTORY_LEN - 1] = temp;
        }
    }

    #[cfg(test)]
    pub fn is_warm(&self) -> bool {
        self.warm
    }

    pub fn newest(&self) -> f64 {
        self.samples[HISTORY_LEN - 1]
    }

    pub fn weighted(&self) -> f64 {
        self.samples
            .iter()
            .zip(HISTORY_WEIGHTS)
            .map(|(sample, weight)| sample * weight)
            .sum()
    }

    /// Weighted estimate, but never above the newest raw sample.
    pub fn smoothed(&self) -> f64 {
        self.weighted().min(self.newest())
    }
}

/// Duty cycle for the hottest of the three inputs relative to its band.
pub fn duty_cycle(thresholds: &ThermalThresholds, cpu: f64, board: Option<f64>, disk: u8) -> u8 {
    let cpu_fraction = thresholds.cpu.fraction(cpu);
    let board_fraction = board.map_or(0.0, |t| thresholds.board.fraction(t));
    let disk_fraction = thresholds.disk.fraction(f64::from(disk));

    let fraction = cpu_fraction.max(board_fraction).max(disk_fraction);
    // NaN clamps to NaN and casts to 0.
    (255.0 * fraction).clamp(0.0, 255.0) as u8
}

pub struct ThermalController<P: PwmOutput> {
    output: P,
    thresholds: ThermalThresholds,
    history: ThermalHistory,
    last_duty: u8,
    ticks_since_write: u32,
}

impl<P: PwmOutput> ThermalController<P> {
    pub fn new(output: P, thresholds: ThermalThresholds, initial_duty: u8) -> Self {
        ThermalController {
            output,
            thresholds,
            history: ThermalHistory::default(),
            last_duty: initial_duty,
            ticks_since_write: 0,
        }
    }

    pub fn last_duty(&self) -> u8 {
        self.last_duty
    }

    /// Feed one tick of inputs; returns the duty cycle written, if any.
    pub fn update(&mut self, cpu: f64, board: Option<f64>, disk: u8) -> Option<u8> {
        self.history.push(cpu);
        let smoothed = self.history.smoothed();
        let duty = duty_cycle(&self.thresholds, smoothed, board, disk);
        debug!(
            "cpu {:.2} (smoothed {:.2}), board {:?}, disk {}C -> pwm {}",
            cpu, smoothed, board, disk, duty
        );

        self.ticks_since_write += 1;
        if duty.abs_diff(self.last_duty) <= MIN_DUTY_STEP
            && self.ticks_since_write <= MAX_SKIPPED_TICKS
        {
            return None;
        }

        match self.output.write_duty(duty) {
            Ok(()) => {
                self.last_duty = duty;
                self.ticks_since_write = 0;
                Some(duty)
            }
            Err(e) => {
                error!("pwm output write failed: {}", e);
                None
            }
        }
    }

    /// Stop driving the fan and restore the firmware state.
    pub fn restore(self) -> Result<()> {
        self.output.restore()
    }

    #[cfg(test)]
    pub fn into_output(self) -> P {
        self.output
    }
}

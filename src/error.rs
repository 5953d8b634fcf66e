// src/error.rs
use std::{io, path::PathBuf};

pub type Result<T> = std::result::Result<T, NasError>;

#[derive(thiserror::Error, Debug)]
pub enum NasError {
    #[error("Failed to open device {path}: {source}")]
    DeviceOpen { path: PathBuf, source: io::Error },

    #[error("Failed to scan disk directory {path}: {source}")]
    DiskScan { path: PathBuf, source: io::Error },

    #[error("ATA pass-through unusable on {path}: {reason}")]
    PassThrough { path: PathBuf, reason: String },

    #[error("Failed to read PWM state from {path}: {source}")]
    PwmRead { path: PathBuf, source: io::Error },

    #[error("Failed to write PWM state to {path}: {source}")]
    PwmWrite { path: PathBuf, source: io::Error },

    #[error("Sensor {label}: {reason}")]
    Sensor { label: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Status server error on port {port}: {source}")]
    StatusSocket { port: u16, source: io::Error },

    #[error("Shutdown command {path} unavailable: {reason}")]
    Shutdown { path: PathBuf, reason: String },

    #[error("Event wait failed: {0}")]
    Poll(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

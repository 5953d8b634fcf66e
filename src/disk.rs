// src/disk.rs
//! Per-disk SMART temperature tracking.

use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

use crate::ata::{self, PowerMode, ProtocolError, Transport};
use crate::error::{NasError, Result};

/// Seconds between SMART polls; spinning a disk up for a reading is never worth it.
pub const SMART_UPDATE_INTERVAL: i64 = 600;

/// Known temperature attributes in priority order: 194 (Temperature_Celsius),
/// 190 (Airflow_Temperature_Cel).
pub const TEMP_ATTRIBUTE_IDS: [u8; 2] = [194, 190];

/// Hardware seam for the SMART monitor. Handles are closed by dropping them.
pub trait DiskBackend {
    type Handle;

    fn open(&mut self, path: &Path) -> io::Result<Self::Handle>;
    fn detect_capability(&mut self, handle: &Self::Handle) -> bool;
    fn model(&mut self, handle: &Self::Handle) -> String;
    fn enable_smart(&mut self, handle: &Self::Handle) -> std::result::Result<(), ProtocolError>;
    fn read_temperature(&mut self, handle: &Self::Handle, attribute_id: u8) -> u8;
    fn power_mode(&mut self, handle: &Self::Handle) -> PowerMode;
}

/// SAT pass-through on real block devices.
#[derive(Debug, Default)]
pub struct AtaBackend {
    transport: Transport,
}

impl DiskBackend for AtaBackend {
    type Handle = File;

    fn open(&mut self, path: &Path) -> io::Result<File> {
        OpenOptions::new().read(true).open(path)
    }

    fn detect_capability(&mut self, handle: &File) -> bool {
        ata::detect_capability(handle, &mut self.transport)
    }

    fn model(&mut self, handle: &File) -> String {
        ata::model(handle)
    }

    fn enable_smart(&mut self, handle: &File) -> std::result::Result<(), ProtocolError> {
        ata::enable_smart(handle)
    }

    fn read_temperature(&mut self, handle: &File, attribute_id: u8) -> u8 {
        ata::read_temperature(handle, attribute_id)
    }

    fn power_mode(&mut self, handle: &File) -> PowerMode {
        ata::get_power_mode(handle)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskRecord {
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(skip)]
    pub attribute_id: u8,
    #[serde(rename = "Temp")]
    pub temperature: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskThresholds {
    pub notice: u8,
    pub halt: u8,
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped,
    Polled { max_temperature: u8 },
    Overheated { max_temperature: u8 },
}

impl PollOutcome {
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, PollOutcome::Overheated { .. })
    }
}

pub struct DiskMonitor<B: DiskBackend> {
    backend: B,
    disks: Vec<DiskRecord>,
    thresholds: DiskThresholds,
    last_poll: Option<i64>,
    max_temperature: u8,
}

/// Whole-disk SCSI nodes: `sd` followed by exactly one letter.
pub fn is_whole_disk(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 3 && bytes.starts_with(b"sd") && bytes[2].is_ascii_lowercase()
}

/// Block-device disk nodes under `dir`, sorted by name.
pub fn scan_disk_nodes(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|source| NasError::DiskScan {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut nodes: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_whole_disk))
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_block_device()))
        .map(|entry| entry.path())
        .collect();
    nodes.sort();
    Ok(nodes)
}

impl<B: DiskBackend> DiskMonitor<B> {
    pub fn new(backend: B, thresholds: DiskThresholds) -> Self {
        DiskMonitor {
            backend,
            disks: Vec::new(),
            thresholds,
            last_poll: None,
            max_temperature: 0,
        }
    }

    pub fn disks(&self) -> &[DiskRecord] {
        &self.disks
    }

    /// Highest temperature seen in the most recent poll (0 when all disks sleep).
    pub fn max_temperature(&self) -> u8 {
        self.max_temperature
    }

    /// Probe every candidate node and keep the ones reporting a SMART temperature.
    ///
    /// A disk that cannot be opened, is not ATA, or lacks a temperature
    /// attribute is skipped. Only a pass-through failure other than the
    /// disk refusing SMART aborts startup.
    pub fn enumerate(&mut self, nodes: &[PathBuf]) -> Result<()> {
        for path in nodes {
            if let Some(record) = self.probe(path)? {
                info!(
                    "{}: {}, temperature {}C",
                    record.path.display(),
                    record.model,
                    record.temperature
                );
                self.max_temperature = self.max_temperature.max(record.temperature);
                self.disks.push(record);
            }
        }
        info!("Monitoring {} disk(s)", self.disks.len());
        Ok(())
    }

    fn probe(&mut self, path: &Path) -> Result<Option<DiskRecord>> {
        let handle = match self.backend.open(path) {
            Ok(h) => h,
            Err(e) => {
                error!("Skip disk {}: open failed: {}", path.display(), e);
                return Ok(None);
            }
        };

        debug!("Probe disk device: {}", path.display());
        if !self.backend.detect_capability(&handle) {
            info!("Skip non-SMART device: {}", path.display());
            return Ok(None);
        }

        let model = self.backend.model(&handle);
        debug!("Found device: {} {}", path.display(), model);

        if let Err(e) = self.backend.enable_smart(&handle) {
            if e.is_unsupported() {
                info!("{}: S.M.A.R.T. not available, skip", path.display());
                return Ok(None);
            }
            return Err(NasError::PassThrough {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }

        let found = TEMP_ATTRIBUTE_IDS.iter().find_map(|&id| {
            let temp = self.backend.read_temperature(&handle, id);
            (temp > 0).then_some((id, temp))
        });

        match found {
            Some((attribute_id, temperature)) => Ok(Some(DiskRecord {
                path: path.to_path_buf(),
                model,
                attribute_id,
                temperature,
            })),
            None => {
                warn!("{}: can not read temperature", path.display());
                Ok(None)
            }
        }
    }

    /// Refresh all disk temperatures, at most once per [`SMART_UPDATE_INTERVAL`].
    ///
    /// Disks that are not spinning report 0 so the poll never wakes them.
    pub fn poll(&mut self, now: i64) -> PollOutcome {
        if let Some(last) = self.last_poll {
            if now - last < SMART_UPDATE_INTERVAL {
                return PollOutcome::Skipped;
            }
        }

        let mut max_temperature = 0u8;
        let mut overheated = false;

        for disk in &mut self.disks {
            let handle = match self.backend.open(&disk.path) {
                Ok(h) => h,
                Err(e) => {
                    error!("Failed to open disk device {}: {}", disk.path.display(), e);
                    disk.temperature = 0;
                    continue;
                }
            };

            disk.temperature = match self.backend.power_mode(&handle) {
                PowerMode::Active => self.backend.read_temperature(&handle, disk.attribute_id),
                mode => {
                    debug!("{}: {:?}, temperature not read", disk.path.display(), mode);
                    0
                }
            };
            drop(handle);

            debug!(
                "{}: {}, temperature {}C",
                disk.path.display(),
                disk.model,
                disk.temperature
            );
            max_temperature = max_temperature.max(disk.temperature);

            if disk.temperature >= self.thresholds.halt {
                error!(
                    "{}: temperature {}C too high, need to shutdown",
                    disk.path.display(),
                    disk.temperature
                );
                overheated = true;
            } else if disk.temperature > self.thresholds.notice {
                warn!("{}: high temperature {}C", disk.path.display(), disk.temperature);
            }
        }

        self.last_poll = Some(now);
        self.max_temperature = max_temperature;

        if overheated {
            PollOutcome::Overheated { max_temperature }
        } else {
            PollOutcome::Polled { max_temperature }
        }
    }
}

// src/ata.rs
//! ATA commands tunnelled through the Linux SCSI generic layer.
//!
//! SATA disks behind libata only expose a SCSI face, so SMART and power
//! state queries are wrapped in 16-byte ATA PASS-THROUGH CDBs (SAT) and
//! pushed through `SG_IO`. INQUIRY additionally falls back to the legacy
//! `SCSI_IOCTL_SEND_COMMAND` interface on kernels without `SG_IO` support
//! for the device, and the power-mode probe uses `HDIO_DRIVE_CMD`.

use std::{
    fs::File,
    io,
    os::fd::{AsRawFd, RawFd},
    ptr,
};
use tracing::{debug, warn};

// --- ioctl request numbers (linux/hdreg.h, scsi/sg.h, scsi/scsi_ioctl.h) ---
const SG_IO: libc::c_ulong = 0x2285;
const SCSI_IOCTL_SEND_COMMAND: libc::c_ulong = 0x0001;
const SCSI_IOCTL_GET_BUS_NUMBER: libc::c_ulong = 0x5386;
const HDIO_DRIVE_CMD: libc::c_ulong = 0x031f;

const SG_INTERFACE_ID: libc::c_int = b'S' as libc::c_int;
const SG_TIMEOUT_MS: libc::c_uint = 3000;

// --- Command opcodes ---
const SCSI_INQUIRY: u8 = 0x12;
const ATA_PASS_THROUGH_16: u8 = 0x85;
const WIN_IDENTIFY: u8 = 0xEC;
const WIN_SMART: u8 = 0xB0;
const SMART_READ_VALUES: u8 = 0xD0;
const SMART_ENABLE: u8 = 0xD8;
const SMART_LBA_MID: u8 = 0x4F;
const SMART_LBA_HIGH: u8 = 0xC2;
const CHECK_POWER_MODE: u8 = 0xE5;
const CHECK_POWER_MODE_LEGACY: u8 = 0x98;

/// Descriptor-format sense data, returned when the SAT layer handled the CDB.
const ATA_SENSE_MAGIC: u8 = 0x72;

pub const SECTOR_SIZE: usize = 512;
/// SPC: never ask for more than 36 bytes, some USB bridges lock up otherwise.
const INQUIRY_LEN: usize = 36;
const SENSE_LEN: usize = 32;

const IDENTIFY_MODEL: std::ops::Range<usize> = 54..94;

const SMART_TABLE_OFFSET: usize = 3;
const SMART_RECORD_LEN: usize = 12;
const SMART_RECORD_COUNT: usize = 30;
const SMART_VALUE_OFFSET: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("ioctl failed: {0}")]
    Ioctl(#[source] io::Error),
    #[error("pass-through not handled by SAT layer (sense byte {0:#04x})")]
    MissingMagic(u8),
}

impl ProtocolError {
    /// True when the disk rejected the command rather than the transport failing.
    pub fn is_unsupported(&self) -> bool {
        match self {
            ProtocolError::Ioctl(e) => e.raw_os_error() == Some(libc::EIO),
            ProtocolError::MissingMagic(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Active,
    Standby,
    Sleeping,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    None,
    FromDevice,
}

impl Direction {
    fn sg_value(self) -> libc::c_int {
        match self {
            Direction::None => -1,
            Direction::FromDevice => -3,
        }
    }
}

// --- SCSI generic transport ---

#[repr(C)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *const libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

fn sg_io(
    fd: RawFd,
    cdb: &[u8],
    data: &mut [u8],
    sense: &mut [u8],
    direction: Direction,
) -> io::Result<()> {
    let mut hdr = SgIoHdr {
        interface_id: SG_INTERFACE_ID,
        dxfer_direction: direction.sg_value(),
        cmd_len: cdb.len() as libc::c_uchar,
        mx_sb_len: sense.len() as libc::c_uchar,
        iovec_count: 0,
        dxfer_len: data.len() as libc::c_uint,
        dxferp: if data.is_empty() {
            ptr::null_mut()
        } else {
            data.as_mut_ptr().cast()
        },
        cmdp: cdb.as_ptr(),
        sbp: if sense.is_empty() {
            ptr::null_mut()
        } else {
            sense.as_mut_ptr()
        },
        timeout: SG_TIMEOUT_MS,
        flags: 0,
        pack_id: 0,
        usr_ptr: ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };

    // SAFETY: every pointer in hdr refers to a live slice whose length is
    // recorded next to it, and hdr outlives the call.
    let rc = unsafe { libc::ioctl(fd, SG_IO as _, &mut hdr as *mut SgIoHdr) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_command(fd: RawFd, cdb: &[u8], data: &mut [u8], direction: Direction) -> io::Result<()> {
    let (in_len, out_len) = match direction {
        Direction::FromDevice => (0u32, data.len() as u32),
        Direction::None => (0, 0),
    };

    // Layout: inlen, outlen, cdb, payload. The reply overwrites from offset 8.
    let mut buf = vec![0u8; 8 + cdb.len() + data.len()];
    buf[0..4].copy_from_slice(&in_len.to_ne_bytes());
    buf[4..8].copy_from_slice(&out_len.to_ne_bytes());
    buf[8..8 + cdb.len()].copy_from_slice(cdb);

    // SAFETY: buf is large enough for the header, the CDB and the reply.
    let rc = unsafe { libc::ioctl(fd, SCSI_IOCTL_SEND_COMMAND as _, buf.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    data.copy_from_slice(&buf[8..8 + data.len()]);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    SgIo,
    SendCommand,
}

/// SCSI transport selection, pinned to whichever interface first works.
#[derive(Debug, Default)]
pub struct Transport {
    pinned: Option<TransportKind>,
}

impl Transport {
    #[cfg(test)]
    pub fn pinned(&self) -> Option<TransportKind> {
        self.pinned
    }

    fn dispatch(&mut self, mut run: impl FnMut(TransportKind) -> io::Result<()>) -> io::Result<()> {
        if let Some(kind) = self.pinned {
            return run(kind);
        }
        match run(TransportKind::SgIo) {
            Ok(()) => {
                debug!("SCSI transport pinned to SG_IO");
                self.pinned = Some(TransportKind::SgIo);
                Ok(())
            }
            Err(e) => {
                debug!("SG_IO unavailable ({}), trying SCSI_IOCTL_SEND_COMMAND", e);
                run(TransportKind::SendCommand)?;
                debug!("SCSI transport pinned to SCSI_IOCTL_SEND_COMMAND");
                self.pinned = Some(TransportKind::SendCommand);
                Ok(())
            }
        }
    }

    fn scsi_command(&mut self, fd: RawFd, cdb: &[u8], data: &mut [u8]) -> io::Result<()> {
        self.dispatch(|kind| {
            // Each attempt starts from a clean buffer so a failed SG_IO leaves no residue.
            data.fill(0);
            match kind {
                TransportKind::SgIo => sg_io(fd, cdb, data, &mut [], Direction::FromDevice),
                TransportKind::SendCommand => send_command(fd, cdb, data, Direction::FromDevice),
            }
        })
    }
}

// --- ATA pass-through ---

/// Register image of a taskfile command: opcode, LBA low, feature, data sectors.
#[derive(Debug, Clone, Copy)]
pub struct AtaCommand {
    pub command: u8,
    pub lba_low: u8,
    pub feature: u8,
    pub sectors: u8,
}

const IDENTIFY: AtaCommand = AtaCommand {
    command: WIN_IDENTIFY,
    lba_low: 0,
    feature: 0,
    sectors: 1,
};

const SMART_ENABLE_CMD: AtaCommand = AtaCommand {
    command: WIN_SMART,
    lba_low: 0,
    feature: SMART_ENABLE,
    sectors: 0,
};

const SMART_READ_VALUES_CMD: AtaCommand = AtaCommand {
    command: WIN_SMART,
    lba_low: 0,
    feature: SMART_READ_VALUES,
    sectors: 1,
};

pub fn build_ata16_cdb(cmd: &AtaCommand) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ATA_PASS_THROUGH_16;
    if cmd.sectors != 0 {
        cdb[1] = 4 << 1; // PIO data-in
        cdb[2] = 0x2e; // T_DIR from device, byte block, length in sector count
    } else {
        cdb[1] = 3 << 1; // non-data
        cdb[2] = 0x20; // CK_COND
    }
    cdb[4] = cmd.feature;
    cdb[6] = cmd.sectors;
    cdb[8] = cmd.lba_low;
    if cmd.command == WIN_SMART {
        cdb[10] = SMART_LBA_MID;
        cdb[12] = SMART_LBA_HIGH;
    }
    cdb[14] = cmd.command;
    cdb
}

fn pass_through(fd: RawFd, cmd: &AtaCommand, data: &mut [u8]) -> Result<(), ProtocolError> {
    let cdb = build_ata16_cdb(cmd);
    let mut sense = [0u8; SENSE_LEN];
    let direction = if cmd.sectors != 0 {
        Direction::FromDevice
    } else {
        Direction::None
    };
    let len = cmd.sectors as usize * SECTOR_SIZE;

    sg_io(fd, &cdb, &mut data[..len], &mut sense, direction).map_err(ProtocolError::Ioctl)?;

    if sense[0] != ATA_SENSE_MAGIC {
        return Err(ProtocolError::MissingMagic(sense[0]));
    }
    Ok(())
}

// --- Binary views ---

/// Swap each 16-bit word of an ATA data block from wire order to string order.
pub fn swap_words(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        let word = u16::from_be_bytes([pair[0], pair[1]]);
        pair.copy_from_slice(&word.to_le_bytes());
    }
}

/// Trim an ATA/SCSI ASCII field and collapse internal runs of blanks.
pub fn clean_ata_string(raw: &[u8]) -> String {
    let text: String = raw
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| if b.is_ascii_graphic() { b as char } else { ' ' })
        .collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SMART READ VALUES page after word swapping.
pub struct SmartPage([u8; SECTOR_SIZE]);

impl SmartPage {
    pub fn from_wire(mut raw: [u8; SECTOR_SIZE]) -> Self {
        swap_words(&mut raw);
        SmartPage(raw)
    }

    /// Value byte of the first attribute record with `attribute_id`, or 0.
    pub fn attribute_value(&self, attribute_id: u8) -> u8 {
        self.0[SMART_TABLE_OFFSET..]
            .chunks(SMART_RECORD_LEN)
            .take(SMART_RECORD_COUNT)
            .inspect(|rec| {
                if rec.len() > SMART_VALUE_OFFSET {
                    debug!("SMART field({}) = {}", rec[0], rec[SMART_VALUE_OFFSET]);
                }
            })
            .find(|rec| rec[0] == attribute_id && rec.len() > SMART_VALUE_OFFSET)
            .map_or(0, |rec| rec[SMART_VALUE_OFFSET])
    }
}

// --- Public operations ---

/// True when the device is an ATA disk reachable through SAT pass-through.
pub fn detect_capability(file: &File, transport: &mut Transport) -> bool {
    let fd = file.as_raw_fd();

    let mut bus: libc::c_int = 0;
    // SAFETY: the ioctl writes a single int into bus.
    if unsafe { libc::ioctl(fd, SCSI_IOCTL_GET_BUS_NUMBER as _, &mut bus as *mut libc::c_int) } != 0
    {
        debug!("not reachable through SCSI: {}", io::Error::last_os_error());
        return false;
    }

    let mut cdb = [0u8; 6];
    cdb[0] = SCSI_INQUIRY;
    cdb[4] = INQUIRY_LEN as u8;
    let mut inquiry = [0u8; INQUIRY_LEN];
    if let Err(e) = transport.scsi_command(fd, &cdb, &mut inquiry) {
        debug!("INQUIRY failed: {}", e);
        return false;
    }

    let ident = clean_ata_string(&inquiry[8..32]);
    if !ident.starts_with("ATA ") {
        debug!("not an ATA device: '{}'", ident);
        return false;
    }

    let mut identify = [0u8; SECTOR_SIZE];
    match pass_through(fd, &IDENTIFY, &mut identify) {
        Ok(()) => true,
        Err(e) => {
            debug!("IDENTIFY pass-through rejected: {}", e);
            false
        }
    }
}

/// Model string from IDENTIFY DEVICE, or "unknown".
pub fn model(file: &File) -> String {
    let mut identify = [0u8; SECTOR_SIZE];
    match pass_through(file.as_raw_fd(), &IDENTIFY, &mut identify) {
        Ok(()) => {
            let field = &mut identify[IDENTIFY_MODEL];
            swap_words(field);
            let model = clean_ata_string(field);
            if model.is_empty() {
                "unknown".to_string()
            } else {
                model
            }
        }
        Err(e) => {
            debug!("IDENTIFY for model failed: {}", e);
            "unknown".to_string()
        }
    }
}

pub fn enable_smart(file: &File) -> Result<(), ProtocolError> {
    pass_through(file.as_raw_fd(), &SMART_ENABLE_CMD, &mut [])
}

/// Current value of SMART attribute `attribute_id`, 0 when absent or unreadable.
pub fn read_temperature(file: &File, attribute_id: u8) -> u8 {
    let mut raw = [0u8; SECTOR_SIZE];
    match pass_through(file.as_raw_fd(), &SMART_READ_VALUES_CMD, &mut raw) {
        Ok(()) => SmartPage::from_wire(raw).attribute_value(attribute_id),
        Err(e) => {
            warn!("SMART READ VALUES failed: {}", e);
            0
        }
    }
}

fn drive_cmd(fd: RawFd, regs: &mut [u8; 4]) -> io::Result<()> {
    // SAFETY: HDIO_DRIVE_CMD reads and writes exactly four bytes for a non-data command.
    let rc = unsafe { libc::ioctl(fd, HDIO_DRIVE_CMD as _, regs.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// CHECK POWER MODE, trying the current opcode then the pre-ATA-4 one.
pub fn get_power_mode(file: &File) -> PowerMode {
    let fd = file.as_raw_fd();
    let mut regs = [CHECK_POWER_MODE, 0, 0, 0];
    let mut outcome = drive_cmd(fd, &mut regs);
    if outcome.is_err() {
        regs = [CHECK_POWER_MODE_LEGACY, 0, 0, 0];
        outcome = drive_cmd(fd, &mut regs);
    }
    classify_power_mode(&outcome, &regs)
}

/// Registers after the ioctl: status, error, sector count.
pub fn classify_power_mode(outcome: &io::Result<()>, regs: &[u8; 4]) -> PowerMode {
    match outcome {
        Ok(()) if regs[2] == 0xFF => PowerMode::Active,
        Ok(()) => PowerMode::Standby,
        Err(e) if e.raw_os_error() == Some(libc::EIO) && regs[0] == 0 && regs[1] == 0 => {
            PowerMode::Sleeping
        }
        Err(_) => PowerMode::Unknown,
    }
}

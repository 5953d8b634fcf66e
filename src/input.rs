// src/input.rs
//! Linux evdev records (`struct input_event`) from the button devices.

use std::{
    io::{self, Read},
    mem,
};

pub const KEY_POWER: u16 = 0x74;
pub const KEY_UP: u16 = 0x67;
pub const KEY_LEFT: u16 = 0x69;
pub const KEY_RIGHT: u16 = 0x6A;
pub const KEY_DOWN: u16 = 0x6C;
pub const BTN_OK: u16 = 0x160;

pub const EVENT_SIZE: usize = mem::size_of::<libc::input_event>();
/// Width of each of the two timeval fields; the tail is type, code, value.
const TIME_FIELD: usize = (EVENT_SIZE - 8) / 2;

const READ_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub sec: i64,
    pub usec: i64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

fn ne_signed(bytes: &[u8]) -> i64 {
    match bytes.len() {
        8 => i64::from_ne_bytes(bytes.try_into().unwrap_or([0; 8])),
        4 => i64::from(i32::from_ne_bytes(bytes.try_into().unwrap_or([0; 4]))),
        _ => 0,
    }
}

impl InputEvent {
    pub fn from_bytes(buf: &[u8; EVENT_SIZE]) -> Self {
        let tail = 2 * TIME_FIELD;
        InputEvent {
            sec: ne_signed(&buf[..TIME_FIELD]),
            usec: ne_signed(&buf[TIME_FIELD..tail]),
            kind: u16::from_ne_bytes([buf[tail], buf[tail + 1]]),
            code: u16::from_ne_bytes([buf[tail + 2], buf[tail + 3]]),
            value: i32::from_ne_bytes([buf[tail + 4], buf[tail + 5], buf[tail + 6], buf[tail + 7]]),
        }
    }

    /// Key down or autorepeat; release events carry value 0.
    pub fn is_press(&self) -> bool {
        self.value != 0
    }

    /// The initial key down only, without autorepeat.
    pub fn is_key_down(&self) -> bool {
        self.value == 1
    }
}

/// Read exactly one record, retrying briefly on EINTR.
pub fn read_event(source: &mut impl Read) -> io::Result<InputEvent> {
    let mut buf = [0u8; EVENT_SIZE];
    for _ in 0..READ_RETRIES {
        match source.read(&mut buf) {
            Ok(n) if n == EVENT_SIZE => return Ok(InputEvent::from_bytes(&buf)),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short input event read: {} of {} bytes", n, EVENT_SIZE),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::from(io::ErrorKind::Interrupted))
}

#[cfg(test)]
pub(crate) fn encode(ev: &InputEvent) -> Vec<u8> {
    let mut out = Vec::with_capacity(EVENT_SIZE);
    if TIME_FIELD == 8 {
        out.extend_from_slice(&ev.sec.to_ne_bytes());
        out.extend_from_slice(&ev.usec.to_ne_bytes());
    } else {
        out.extend_from_slice(&(ev.sec as i32).to_ne_bytes());
        out.extend_from_slice(&(ev.usec as i32).to_ne_bytes());
    }
    out.extend_from_slice(&ev.kind.to_ne_bytes());
    out.extend_from_slice(&ev.code.to_ne_bytes());
    out.extend_from_slice(&ev.value.to_ne_bytes());
    out
}

// src/status.rs
//! Read-only JSON status snapshot served on a loopback TCP port.

use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read, Write},
    mem,
    net::TcpListener,
    path::Path,
    thread,
    time::Duration,
};
use tracing::{debug, warn};

use crate::disk::DiskRecord;
use crate::sensors::{SensorId, SensorReading};

pub const NET_CLASS_BASE: &str = "/sys/class/net";

const IO_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(10);
const REQUEST_LIMIT: usize = 512;
/// sysinfo(2) load averages are fixed point with this many fraction bits.
const SI_LOAD_SHIFT: u32 = 16;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sysload {
    pub uptime: i64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub procs: u16,
    pub total_ram: u64,
    pub free_ram: u64,
    pub shared_ram: u64,
    pub buffer_ram: u64,
    pub total_swap: u64,
    pub free_swap: u64,
}

impl Sysload {
    pub fn read() -> io::Result<Self> {
        // SAFETY: sysinfo is plain integers; all-zero is a valid value.
        let mut info: libc::sysinfo = unsafe { mem::zeroed() };
        // SAFETY: `info` is a valid, writable sysinfo struct.
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let unit = u64::from(info.mem_unit.max(1));
        let load = |raw: libc::c_ulong| raw as f64 / f64::from(1u32 << SI_LOAD_SHIFT);
        Ok(Sysload {
            uptime: info.uptime as i64,
            load1: load(info.loads[0]),
            load5: load(info.loads[1]),
            load15: load(info.loads[2]),
            procs: info.procs,
            total_ram: info.totalram as u64 * unit,
            free_ram: info.freeram as u64 * unit,
            shared_ram: info.sharedram as u64 * unit,
            buffer_ram: info.bufferram as u64 * unit,
            total_swap: info.totalswap as u64 * unit,
            free_swap: info.freeswap as u64 * unit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NicStatus {
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "RxBytes")]
    pub rx_bytes: u64,
    #[serde(rename = "TxBytes")]
    pub tx_bytes: u64,
}

impl NicStatus {
    /// Link state and counters from `<base>/<name>`; unreadable fields default.
    pub fn read(base: &Path, name: &str) -> Self {
        let dir = base.join(name);
        let text = |file: &str| {
            fs::read_to_string(dir.join(file))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        };
        let counter = |file: &str| {
            fs::read_to_string(dir.join("statistics").join(file))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0)
        };
        NicStatus {
            state: text("operstate"),
            mac: text("address"),
            rx_bytes: counter("rx_bytes"),
            tx_bytes: counter("tx_bytes"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Snapshot<'a> {
    #[serde(rename = "Sysload")]
    pub sysload: Sysload,
    #[serde(rename = "Sensors")]
    pub sensors: &'a BTreeMap<SensorId, SensorReading>,
    #[serde(rename = "Disks")]
    pub disks: BTreeMap<String, &'a DiskRecord>,
    #[serde(rename = "NICs")]
    pub nics: BTreeMap<String, NicStatus>,
}

impl<'a> Snapshot<'a> {
    pub fn collect(
        sensors: &'a BTreeMap<SensorId, SensorReading>,
        disks: &'a [DiskRecord],
        nic_base: &Path,
        nics: &[String],
    ) -> Self {
        let sysload = Sysload::read().unwrap_or_else(|e| {
            warn!("sysinfo failed: {}", e);
            Sysload::default()
        });
        Snapshot {
            sysload,
            sensors,
            disks: disks
                .iter()
                .map(|d| (d.path.display().to_string(), d))
                .collect(),
            nics: nics
                .iter()
                .map(|name| (name.clone(), NicStatus::read(nic_base, name)))
                .collect(),
        }
    }
}

/// Frame `body` as an HTTP/1.0 response when the request looks like one.
pub fn render_response(request: &[u8], body: &str) -> Vec<u8> {
    if !request.starts_with(b"GET ") {
        return body.as_bytes().to_vec();
    }
    let mut out = format!(
        "HTTP/1.0 200 OK\r\n\
         Connection: Close\r\n\
         Cache-Control: max-age=30\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Answer at most one pending connection.
///
/// Every socket call is non-blocking and given [`IO_RETRIES`] attempts; a
/// client that is not ready by then is dropped. A client that sends
/// nothing gets the bare JSON document.
pub fn serve_one(listener: &TcpListener, snapshot: &Snapshot) -> io::Result<()> {
    let (mut stream, peer) = match listener.accept() {
        Ok(conn) => conn,
        Err(e) if is_transient(&e) => return Ok(()),
        Err(e) => return Err(e),
    };
    stream.set_nonblocking(true)?;
    debug!("status request from {}", peer);

    let mut request = [0u8; REQUEST_LIMIT];
    let mut received = 0;
    for _ in 0..IO_RETRIES {
        match stream.read(&mut request) {
            Ok(n) => {
                received = n;
                break;
            }
            Err(e) if is_transient(&e) => thread::sleep(RETRY_DELAY),
            Err(e) => return Err(e),
        }
    }

    let body = serde_json::to_string(snapshot).map_err(io::Error::other)?;
    let response = render_response(&request[..received], &body);

    let mut sent = 0;
    let mut retries = 0;
    while sent < response.len() {
        match stream.write(&response[sent..]) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(e) if is_transient(&e) && retries < IO_RETRIES => {
                retries += 1;
                thread::sleep(RETRY_DELAY);
            }
            Err(e) if is_transient(&e) => {
                warn!("status client {} too slow, dropped after {} bytes", peer, sent);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::path::PathBuf;

    fn listener() -> TcpListener {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.set_nonblocking(true).unwrap();
        l
    }

    fn sample_snapshot<'a>(
        sensors: &'a BTreeMap<SensorId, SensorReading>,
        disks: &'a [DiskRecord],
    ) -> Snapshot<'a> {
        Snapshot {
            sysload: Sysload::default(),
            sensors,
            disks: disks
                .iter()
                .map(|d| (d.path.display().to_string(), d))
                .collect(),
            nics: BTreeMap::new(),
        }
    }

    fn fixtures() -> (BTreeMap<SensorId, SensorReading>, Vec<DiskRecord>) {
        let mut sensors = BTreeMap::new();
        sensors.insert(
            SensorId::Cpu,
            SensorReading {
                label: "CPU",
                value: 45.5,
                min: 0.0,
                max: 70.0,
            },
        );
        let disks = vec![DiskRecord {
            path: PathBuf::from("/dev/sda"),
            model: "WDC WD40EFRX".to_string(),
            attribute_id: 194,
            temperature: 38,
        }];
        (sensors, disks)
    }

    #[test]
    fn snapshot_json_layout() {
        let (sensors, disks) = fixtures();
        let snap = sample_snapshot(&sensors, &disks);
        let json: serde_json::Value = serde_json::to_value(&snap).unwrap();

        assert_eq!(json["Sensors"]["CPU"]["Value"], 45.5);
        assert_eq!(json["Sensors"]["CPU"]["Max"], 70.0);
        assert_eq!(json["Disks"]["/dev/sda"]["Model"], "WDC WD40EFRX");
        assert_eq!(json["Disks"]["/dev/sda"]["Temp"], 38);
        assert!(json["Disks"]["/dev/sda"].get("attribute_id").is_none());
        assert!(json["Sysload"].get("Load1").is_some());
        assert!(json["NICs"].as_object().unwrap().is_empty());
    }

    #[test]
    fn http_request_gets_framed_response() {
        let out = render_response(b"GET / HTTP/1.1\r\n\r\n", "{}");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Cache-Control: max-age=30\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));

        assert_eq!(render_response(b"status\n", "{}"), b"{}".to_vec());
    }

    #[test]
    fn serves_one_http_client() {
        let (sensors, disks) = fixtures();
        let listener = listener();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.write_all(b"GET /status HTTP/1.0\r\n\r\n").unwrap();

        serve_one(&listener, &sample_snapshot(&sensors, &disks)).unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        let (head, body) = reply.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.0 200 OK"));
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["Disks"]["/dev/sda"]["Temp"], 38);
    }

    #[test]
    fn silent_client_gets_bare_json() {
        let (sensors, disks) = fixtures();
        let listener = listener();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        serve_one(&listener, &sample_snapshot(&sensors, &disks)).unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with('{'));
        let json: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(json["Sensors"]["CPU"]["Value"], 45.5);
    }

    #[test]
    fn no_pending_connection_is_not_an_error() {
        let (sensors, disks) = fixtures();
        serve_one(&listener(), &sample_snapshot(&sensors, &disks)).unwrap();
    }

    #[test]
    fn nic_status_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let eth = dir.path().join("eth0");
        fs::create_dir_all(eth.join("statistics")).unwrap();
        fs::write(eth.join("operstate"), "up\n").unwrap();
        fs::write(eth.join("address"), "00:11:22:33:44:55\n").unwrap();
        fs::write(eth.join("statistics/rx_bytes"), "1024\n").unwrap();

        let nic = NicStatus::read(dir.path(), "eth0");
        assert_eq!(nic.state, "up");
        assert_eq!(nic.mac, "00:11:22:33:44:55");
        assert_eq!(nic.rx_bytes, 1024);
        assert_eq!(nic.tx_bytes, 0);

        assert_eq!(NicStatus::read(dir.path(), "eth9").state, "unknown");
    }
}

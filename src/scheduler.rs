// src/scheduler.rs
//! The main loop: one thread multiplexing button devices and the status
//! socket against a wall-clock aligned hardware scan.

use std::{
    fs::File,
    io,
    net::TcpListener,
    os::{
        fd::AsRawFd,
        unix::process::CommandExt,
    },
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, warn};

use crate::disk::{DiskBackend, DiskMonitor};
use crate::error::{NasError, Result};
use crate::fan::{PwmOutput, ThermalController};
use crate::input::{self, InputEvent, KEY_POWER};
use crate::panel::FrontPanel;
use crate::sensors::{SensorId, SensorMonitor, SensorSource};
use crate::status::{self, Snapshot};

/// Seconds between hardware scans, aligned to the wall clock.
pub const SCAN_INTERVAL: i64 = 5;
/// Max seconds between two power presses that count toward power-off.
pub const CONFIRM_WINDOW: i64 = 10;
/// Presses closer than this to the last counted one are bounces.
pub const MIN_PRESS_GAP: i64 = 2;
pub const CONFIRM_PRESSES: u32 = 3;

const SHUTDOWN_CANDIDATES: [&str; 2] = ["/sbin/shutdown", "/usr/sbin/shutdown"];

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// First multiple of `interval` seconds strictly after `now_ms`.
pub fn next_deadline_ms(now_ms: i64, interval: i64) -> i64 {
    let step = interval * 1000;
    (now_ms / step + 1) * step
}

/// Keep `deadline` unless the clock stepped back past a whole interval,
/// in which case align again from `now_ms`.
pub fn realign_deadline(deadline: i64, now_ms: i64, interval: i64) -> i64 {
    if deadline - now_ms > interval * 1000 {
        next_deadline_ms(now_ms, interval)
    } else {
        deadline
    }
}

/// Power-off confirmation counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PowerConfirm {
    #[default]
    Idle,
    Confirming { repeats: u32, last_press: i64 },
}

impl PowerConfirm {
    /// Register a press at `now`; returns the updated repeat count, or
    /// `None` when it follows the last counted press too closely.
    pub fn press(&mut self, now: i64) -> Option<u32> {
        let repeats = match *self {
            PowerConfirm::Confirming { last_press, .. } if now - last_press < MIN_PRESS_GAP => {
                return None;
            }
            PowerConfirm::Confirming {
                repeats,
                last_press,
            } if now - last_press <= CONFIRM_WINDOW => repeats + 1,
            _ => 1,
        };
        *self = PowerConfirm::Confirming {
            repeats,
            last_press: now,
        };
        Some(repeats)
    }

    /// Drop back to idle once the window has passed without a press.
    pub fn expire(&mut self, now: i64) {
        if let PowerConfirm::Confirming { last_press, .. } = *self {
            if now - last_press > CONFIRM_WINDOW {
                debug!("power-off confirmation timed out");
                *self = PowerConfirm::Idle;
            }
        }
    }

    pub fn repeats(&self) -> u32 {
        match self {
            PowerConfirm::Idle => 0,
            PowerConfirm::Confirming { repeats, .. } => *repeats,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.repeats() > 0
    }

    pub fn is_confirmed(&self) -> bool {
        self.repeats() >= CONFIRM_PRESSES
    }
}

/// Detached `shutdown -h -P now`.
#[derive(Debug, Clone)]
pub struct ShutdownCommand {
    program: PathBuf,
}

impl ShutdownCommand {
    /// Use `configured`, or the first of the usual locations that exists.
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        let program = match configured {
            Some(path) if path.is_file() => path.to_path_buf(),
            Some(path) => {
                return Err(NasError::Shutdown {
                    path: path.to_path_buf(),
                    reason: "no such file".to_string(),
                });
            }
            None => SHUTDOWN_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file())
                .ok_or_else(|| NasError::Shutdown {
                    path: PathBuf::from(SHUTDOWN_CANDIDATES[0]),
                    reason: "no shutdown binary found".to_string(),
                })?,
        };
        Ok(ShutdownCommand { program })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start the shutdown in its own process group and do not wait for it.
    pub fn spawn(&self) -> Result<()> {
        let child = Command::new(&self.program)
            .args(["-h", "-P", "now"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| NasError::Shutdown {
                path: self.program.clone(),
                reason: e.to_string(),
            })?;
        warn!("{} started (pid {})", self.program.display(), child.id());
        Ok(())
    }
}

/// Descriptors watched by the loop, registered at startup. An input device
/// that fails for good is dropped and no longer polled.
pub struct EventSources {
    pub power: Option<File>,
    pub buttons: Option<File>,
    pub status: TcpListener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Power,
    Status,
    Buttons,
}

impl EventSources {
    fn pollfds(&self) -> (Vec<Source>, Vec<libc::pollfd>) {
        [
            self.power.as_ref().map(|f| (Source::Power, f.as_raw_fd())),
            Some((Source::Status, self.status.as_raw_fd())),
            self.buttons.as_ref().map(|f| (Source::Buttons, f.as_raw_fd())),
        ]
        .into_iter()
        .flatten()
        .map(|(source, fd)| {
            let pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            (source, pfd)
        })
        .unzip()
    }
}

/// Read one event from `slot`. Errors are logged; a device that hung up or
/// went away is closed so the loop stops polling it.
fn read_input(slot: &mut Option<File>, name: &str, revents: libc::c_short) -> Option<InputEvent> {
    let file = slot.as_mut()?;
    match input::read_event(file) {
        Ok(event) => Some(event),
        Err(e) => {
            error!("read {} failed: {}", name, e);
            let hung_up = revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            let gone = e.raw_os_error() == Some(libc::ENODEV)
                || e.kind() == io::ErrorKind::UnexpectedEof;
            if hung_up || gone {
                error!("{} lost, no longer watching it", name);
                *slot = None;
            }
            None
        }
    }
}

fn wait(fds: &mut [libc::pollfd], timeout_ms: i64) -> io::Result<usize> {
    let timeout = timeout_ms.clamp(0, i64::from(i32::MAX)) as libc::c_int;
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
    if ready < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ready as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Terminated,
    PowerOff,
    Failed,
}

pub struct Scheduler<B: DiskBackend, S: SensorSource, P: PwmOutput, F: FrontPanel> {
    model: String,
    disks: DiskMonitor<B>,
    sensors: SensorMonitor<S>,
    controller: ThermalController<P>,
    panel: F,
    confirm: PowerConfirm,
    nic_base: PathBuf,
    nics: Vec<String>,
    clock: Box<dyn FnMut() -> i64>,
}

impl<B: DiskBackend, S: SensorSource, P: PwmOutput, F: FrontPanel> Scheduler<B, S, P, F> {
    pub fn new(
        model: String,
        disks: DiskMonitor<B>,
        sensors: SensorMonitor<S>,
        controller: ThermalController<P>,
        panel: F,
        nic_base: PathBuf,
        nics: Vec<String>,
    ) -> Self {
        Scheduler {
            model,
            disks,
            sensors,
            controller,
            panel,
            confirm: PowerConfirm::Idle,
            nic_base,
            nics,
            clock: Box::new(now_ms),
        }
    }

    /// Replace the wall clock (milliseconds since the epoch).
    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl FnMut() -> i64 + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Timer expiry: check limits, drive the fan, run idle policies.
    pub fn tick(&mut self, now: i64) -> Flow {
        let sensor_failures = self.sensors.update(now);
        let disk_outcome = self.disks.poll(now);
        if sensor_failures > 0 || disk_outcome.is_hard_failure() {
            error!(
                "Hardware limits exceeded ({} sensor failure(s), disks {:?})",
                sensor_failures, disk_outcome
            );
            return Flow::Shutdown;
        }

        match self.sensors.value(SensorId::Cpu) {
            Some(cpu) => {
                let board = self.sensors.value(SensorId::System);
                if let Some(duty) = self.controller.update(cpu, board, self.disks.max_temperature()) {
                    debug!("pwm output set to {}", duty);
                }
            }
            None => warn!(
                "CPU temperature unavailable, fan held at {}",
                self.controller.last_duty()
            ),
        }

        self.confirm.expire(now);
        self.panel.idle_tick(now, self.confirm.is_pending());
        Flow::Continue
    }

    pub fn on_power_event(&mut self, event: &InputEvent) -> Flow {
        debug!(
            "Event: time={}.{:06}, type={:#x}, code={:#x}, value={:#x}",
            event.sec, event.usec, event.kind, event.code, event.value
        );
        if event.code != KEY_POWER || !event.is_key_down() {
            return Flow::Continue;
        }

        let Some(repeats) = self.confirm.press(event.sec) else {
            debug!("power press ignored, too close to the previous one");
            return Flow::Continue;
        };
        if repeats == 1 {
            warn!("Power button pressed to request poweroff");
        } else {
            warn!("Power button pressed again ({}/{})", repeats, CONFIRM_PRESSES);
        }
        self.panel
            .show_power_confirm(repeats, CONFIRM_PRESSES, event.sec);

        if self.confirm.is_confirmed() {
            warn!("System PowerOff is confirmed");
            return Flow::Shutdown;
        }
        Flow::Continue
    }

    pub fn on_button_event(&mut self, event: &InputEvent) {
        if event.is_press() {
            self.panel.handle_button(event);
        }
    }

    pub fn on_status_request(&mut self, listener: &TcpListener) {
        let snapshot = Snapshot::collect(
            self.sensors.readings(),
            self.disks.disks(),
            &self.nic_base,
            &self.nics,
        );
        if let Err(e) = status::serve_one(listener, &snapshot) {
            warn!("status request failed: {}", e);
        }
    }

    /// Run until termination is requested, a shutdown is decided, or polling
    /// itself fails.
    pub fn run(&mut self, sources: &mut EventSources, running: &AtomicBool) -> Exit {
        let interval_ms = SCAN_INTERVAL * 1000;
        let mut deadline = next_deadline_ms((self.clock)(), SCAN_INTERVAL);
        info!("Entering main loop, scan interval {}s", SCAN_INTERVAL);

        loop {
            if !running.load(Ordering::SeqCst) {
                info!("Termination requested, leaving main loop");
                return Exit::Terminated;
            }

            let now = (self.clock)();
            let realigned = realign_deadline(deadline, now, SCAN_INTERVAL);
            if realigned != deadline {
                warn!("Clock stepped back, next scan realigned to {}", realigned);
                deadline = realigned;
            }

            // A late tick runs before waiting again, so events cannot starve it.
            if now >= deadline {
                deadline = next_deadline_ms(now, SCAN_INTERVAL);
                if self.tick(now / 1000) == Flow::Shutdown {
                    return Exit::PowerOff;
                }
                continue;
            }

            let (kinds, mut fds) = sources.pollfds();
            match wait(&mut fds, (deadline - now).min(interval_ms)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("{}", NasError::Poll(e));
                    return Exit::Failed;
                }
            }

            for (kind, pfd) in kinds.into_iter().zip(&fds) {
                if pfd.revents == 0 {
                    continue;
                }
                match kind {
                    Source::Power => {
                        let event = read_input(&mut sources.power, "power button", pfd.revents);
                        if let Some(event) = event {
                            if self.on_power_event(&event) == Flow::Shutdown {
                                return Exit::PowerOff;
                            }
                        }
                    }
                    Source::Status => self.on_status_request(&sources.status),
                    Source::Buttons => {
                        let event = read_input(&mut sources.buttons, "front panel buttons", pfd.revents);
                        if let Some(event) = event {
                            self.on_button_event(&event);
                        }
                    }
                }
            }
        }
    }

    /// The one cleanup path: hand the fan back, then power off if asked to.
    pub fn finish(self, exit: Exit, shutdown: &ShutdownCommand) -> Result<()> {
        let Scheduler {
            model,
            controller,
            mut panel,
            ..
        } = self;

        if exit == Exit::PowerOff {
            panel.show_shutdown(&model);
        }
        let restored = controller.restore();
        if let Err(e) = &restored {
            error!("Failed to restore fan control: {}", e);
        }
        if exit == Exit::PowerOff {
            shutdown.spawn()?;
        }
        info!("cleanup and exit");
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ata::{PowerMode, ProtocolError};
    use crate::disk::DiskThresholds;
    use crate::fan::{Band, ThermalThresholds};
    use crate::input::{BTN_OK, KEY_DOWN};
    use crate::sensors::SensorReading;
    use std::{
        cell::RefCell,
        collections::BTreeMap,
        io::{Read, Write},
        net::TcpStream,
        os::fd::FromRawFd,
        rc::Rc,
        sync::Arc,
    };

    struct NoDisks;

    impl DiskBackend for NoDisks {
        type Handle = ();

        fn open(&mut self, _path: &Path) -> io::Result<()> {
            Err(io::ErrorKind::NotFound.into())
        }
        fn detect_capability(&mut self, _handle: &()) -> bool {
            false
        }
        fn model(&mut self, _handle: &()) -> String {
            String::new()
        }
        fn enable_smart(&mut self, _handle: &()) -> std::result::Result<(), ProtocolError> {
            Ok(())
        }
        fn read_temperature(&mut self, _handle: &(), _attribute_id: u8) -> u8 {
            0
        }
        fn power_mode(&mut self, _handle: &()) -> PowerMode {
            PowerMode::Unknown
        }
    }

    struct FixedSensors(BTreeMap<SensorId, SensorReading>);

    impl SensorSource for FixedSensors {
        fn sample(&mut self, id: SensorId) -> Result<SensorReading> {
            self.0.get(&id).cloned().ok_or_else(|| NasError::Sensor {
                label: id.label().to_string(),
                reason: "absent".to_string(),
            })
        }

        fn ids(&self) -> Vec<SensorId> {
            self.0.keys().copied().collect()
        }
    }

    #[derive(Default)]
    struct PwmLog {
        writes: Vec<u8>,
        restored: bool,
    }

    struct SharedPwm(Rc<RefCell<PwmLog>>);

    impl PwmOutput for SharedPwm {
        fn write_duty(&mut self, duty: u8) -> Result<()> {
            self.0.borrow_mut().writes.push(duty);
            Ok(())
        }

        fn restore(self) -> Result<()> {
            self.0.borrow_mut().restored = true;
            Ok(())
        }
    }

    #[derive(Default)]
    struct PanelLog {
        confirms: Vec<(u32, u32)>,
        buttons: Vec<u16>,
        idle: Vec<(i64, bool)>,
        shutdown: Option<String>,
    }

    struct SharedPanel(Rc<RefCell<PanelLog>>);

    impl FrontPanel for SharedPanel {
        fn handle_button(&mut self, event: &InputEvent) {
            self.0.borrow_mut().buttons.push(event.code);
        }
        fn show_power_confirm(&mut self, repeats: u32, required: u32, _now: i64) {
            self.0.borrow_mut().confirms.push((repeats, required));
        }
        fn show_shutdown(&mut self, model: &str) {
            self.0.borrow_mut().shutdown = Some(model.to_string());
        }
        fn idle_tick(&mut self, now: i64, confirm_pending: bool) {
            self.0.borrow_mut().idle.push((now, confirm_pending));
        }
    }

    const THRESHOLDS: ThermalThresholds = ThermalThresholds {
        cpu: Band {
            notice: 40.0,
            halt: 70.0,
        },
        board: Band {
            notice: 40.0,
            halt: 60.0,
        },
        disk: Band {
            notice: 45.0,
            halt: 55.0,
        },
    };

    type TestScheduler = Scheduler<NoDisks, FixedSensors, SharedPwm, SharedPanel>;

    fn scheduler(
        cpu: Option<f64>,
    ) -> (TestScheduler, Rc<RefCell<PwmLog>>, Rc<RefCell<PanelLog>>) {
        let mut readings = BTreeMap::new();
        if let Some(value) = cpu {
            readings.insert(
                SensorId::Cpu,
                SensorReading {
                    label: "CPU",
                    value,
                    min: 0.0,
                    max: 70.0,
                },
            );
        }
        let pwm = Rc::new(RefCell::new(PwmLog::default()));
        let panel = Rc::new(RefCell::new(PanelLog::default()));
        let sched = Scheduler::new(
            "RN626X".to_string(),
            DiskMonitor::new(NoDisks, DiskThresholds { notice: 45, halt: 55 }),
            SensorMonitor::new(FixedSensors(readings)),
            ThermalController::new(SharedPwm(pwm.clone()), THRESHOLDS, 0),
            SharedPanel(panel.clone()),
            PathBuf::from("/nonexistent"),
            Vec::new(),
        );
        (sched, pwm, panel)
    }

    fn key(code: u16, value: i32, sec: i64) -> InputEvent {
        InputEvent {
            sec,
            usec: 0,
            kind: 1,
            code,
            value,
        }
    }

    #[test]
    fn deadline_is_wall_clock_aligned() {
        assert_eq!(next_deadline_ms(12_345, 5), 15_000);
        assert_eq!(next_deadline_ms(15_000, 5), 20_000);
        assert_eq!(next_deadline_ms(19_999, 5), 20_000);
    }

    #[test]
    fn three_presses_within_window_confirm() {
        let mut confirm = PowerConfirm::default();
        assert_eq!(confirm.press(100), Some(1));
        assert_eq!(confirm.press(109), Some(2));
        assert!(!confirm.is_confirmed());
        assert_eq!(confirm.press(118), Some(3));
        assert!(confirm.is_confirmed());
    }

    #[test]
    fn late_press_restarts_count() {
        let mut confirm = PowerConfirm::default();
        confirm.press(100);
        assert_eq!(confirm.press(111), Some(1));
        assert_eq!(confirm.press(121), Some(2));
    }

    #[test]
    fn presses_inside_minimum_gap_are_bounces() {
        let mut confirm = PowerConfirm::default();
        assert_eq!(confirm.press(100), Some(1));
        assert_eq!(confirm.press(100), None);
        assert_eq!(confirm.press(101), None);
        assert_eq!(confirm.press(102), Some(2));
        // The gap counts from the last press that was accepted.
        assert_eq!(confirm.press(103), None);
        assert_eq!(confirm.press(104), Some(3));
    }

    #[test]
    fn deadline_realigns_after_clock_steps_back() {
        let deadline = next_deadline_ms(1_700_000_001_000, SCAN_INTERVAL);
        let stepped = 1_700_000_001_000 - 8 * 3600 * 1000;
        let realigned = realign_deadline(deadline, stepped, SCAN_INTERVAL);
        assert_eq!(realigned, next_deadline_ms(stepped, SCAN_INTERVAL));
        assert!(realigned - stepped <= SCAN_INTERVAL * 1000);

        // Normal progress keeps the original deadline.
        assert_eq!(realign_deadline(deadline, deadline - 4_000, SCAN_INTERVAL), deadline);
        assert_eq!(realign_deadline(deadline, deadline - 5_000, SCAN_INTERVAL), deadline);
    }

    #[test]
    fn confirmation_expires_on_tick() {
        let mut confirm = PowerConfirm::default();
        confirm.press(100);
        confirm.expire(110);
        assert!(confirm.is_pending());
        confirm.expire(111);
        assert_eq!(confirm, PowerConfirm::Idle);
        assert_eq!(confirm.repeats(), 0);
    }

    #[test]
    fn tick_drives_fan_from_cpu() {
        let (mut sched, pwm, panel) = scheduler(Some(55.0));
        assert_eq!(sched.tick(1000), Flow::Continue);
        assert_eq!(pwm.borrow().writes, vec![127]);
        assert_eq!(panel.borrow().idle, vec![(1000, false)]);
    }

    #[test]
    fn tick_without_cpu_reading_leaves_fan_alone() {
        let (mut sched, pwm, _panel) = scheduler(None);
        assert_eq!(sched.tick(1000), Flow::Continue);
        assert!(pwm.borrow().writes.is_empty());
    }

    #[test]
    fn sensor_over_limit_requests_shutdown() {
        let (mut sched, pwm, _panel) = scheduler(Some(75.0));
        assert_eq!(sched.tick(1000), Flow::Shutdown);
        assert!(pwm.borrow().writes.is_empty());
    }

    #[test]
    fn power_button_sequence_shuts_down() {
        let (mut sched, _pwm, panel) = scheduler(Some(45.0));
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 1, 10)), Flow::Continue);
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 0, 10)), Flow::Continue);
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 1, 15)), Flow::Continue);
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 1, 20)), Flow::Shutdown);
        assert_eq!(panel.borrow().confirms, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn autorepeat_does_not_confirm_power_off() {
        let (mut sched, _pwm, panel) = scheduler(Some(45.0));
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 1, 100)), Flow::Continue);
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 2, 100)), Flow::Continue);
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 2, 100)), Flow::Continue);
        assert_eq!(sched.confirm.repeats(), 1);
        assert!(!sched.confirm.is_confirmed());

        // A second key down one second later is a bounce as well.
        assert_eq!(sched.on_power_event(&key(KEY_POWER, 1, 101)), Flow::Continue);
        assert_eq!(sched.confirm.repeats(), 1);
        assert_eq!(panel.borrow().confirms, vec![(1, 3)]);
    }

    #[test]
    fn pending_confirmation_keeps_panel_awake_then_lapses() {
        let (mut sched, _pwm, panel) = scheduler(Some(45.0));
        sched.on_power_event(&key(KEY_POWER, 1, 100));
        sched.tick(105);
        sched.tick(111);
        assert_eq!(panel.borrow().idle, vec![(105, true), (111, false)]);
        assert_eq!(sched.confirm, PowerConfirm::Idle);
    }

    #[test]
    fn button_releases_are_ignored() {
        let (mut sched, _pwm, panel) = scheduler(Some(45.0));
        sched.on_button_event(&key(KEY_DOWN, 1, 1));
        sched.on_button_event(&key(KEY_DOWN, 0, 1));
        sched.on_button_event(&key(BTN_OK, 1, 2));
        assert_eq!(panel.borrow().buttons, vec![KEY_DOWN, BTN_OK]);
    }

    #[test]
    fn finish_restores_fan_on_termination() {
        let (sched, pwm, panel) = scheduler(Some(45.0));
        let shutdown = ShutdownCommand {
            program: PathBuf::from("/nonexistent/shutdown"),
        };
        sched.finish(Exit::Terminated, &shutdown).unwrap();
        assert!(pwm.borrow().restored);
        assert!(panel.borrow().shutdown.is_none());
    }

    #[test]
    fn finish_on_power_off_shows_notice_before_handoff() {
        let (sched, pwm, panel) = scheduler(Some(45.0));
        let shutdown = ShutdownCommand {
            program: PathBuf::from("/nonexistent/shutdown"),
        };
        // The handoff fails here, but the fan is already handed back.
        assert!(sched.finish(Exit::PowerOff, &shutdown).is_err());
        assert!(pwm.borrow().restored);
        assert_eq!(panel.borrow().shutdown.as_deref(), Some("RN626X"));
    }

    #[test]
    fn locate_checks_configured_binary() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("shutdown");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let found = ShutdownCommand::locate(Some(&bin)).unwrap();
        assert_eq!(found.program(), bin.as_path());
        assert!(ShutdownCommand::locate(Some(&dir.path().join("missing"))).is_err());
    }

    fn pipe() -> (File, File) {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: both descriptors are fresh and owned by nothing else.
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    struct Harness {
        sources: EventSources,
        power: Option<File>,
        buttons: Option<File>,
    }

    fn harness() -> Harness {
        let (power_rx, power_tx) = pipe();
        let (buttons_rx, buttons_tx) = pipe();
        let status = TcpListener::bind("127.0.0.1:0").unwrap();
        status.set_nonblocking(true).unwrap();
        Harness {
            sources: EventSources {
                power: Some(power_rx),
                buttons: Some(buttons_rx),
                status,
            },
            power: Some(power_tx),
            buttons: Some(buttons_tx),
        }
    }

    /// Hands out `times` in order; the last one also clears `running`.
    fn scripted_clock(times: Vec<i64>, running: Arc<AtomicBool>) -> impl FnMut() -> i64 {
        let mut calls = 0;
        move || {
            let t = times[calls.min(times.len() - 1)];
            calls += 1;
            if calls >= times.len() {
                running.store(false, Ordering::SeqCst);
            }
            t
        }
    }

    #[test]
    fn run_stops_when_flag_is_cleared() {
        let (sched, pwm, _panel) = scheduler(Some(45.0));
        let running = Arc::new(AtomicBool::new(false));
        let mut sched = sched.with_clock(scripted_clock(vec![1_000], running.clone()));
        let mut h = harness();

        assert_eq!(sched.run(&mut h.sources, &running), Exit::Terminated);
        assert!(pwm.borrow().writes.is_empty());
    }

    #[test]
    fn run_ticks_overdue_deadline_before_waiting() {
        let (sched, pwm, panel) = scheduler(Some(55.0));
        let running = Arc::new(AtomicBool::new(true));
        let mut sched = sched.with_clock(scripted_clock(vec![1_000, 6_000], running.clone()));
        let mut h = harness();

        assert_eq!(sched.run(&mut h.sources, &running), Exit::Terminated);
        assert_eq!(pwm.borrow().writes, vec![127]);
        assert_eq!(panel.borrow().idle, vec![(6, false)]);
    }

    #[test]
    fn run_powers_off_when_overdue_tick_exceeds_limits() {
        let (sched, _pwm, _panel) = scheduler(Some(75.0));
        let running = Arc::new(AtomicBool::new(true));
        let mut sched = sched.with_clock(scripted_clock(vec![1_000, 6_000], running.clone()));
        let mut h = harness();

        assert_eq!(sched.run(&mut h.sources, &running), Exit::PowerOff);
    }

    #[test]
    fn run_dispatches_ready_descriptors() {
        let (sched, _pwm, panel) = scheduler(Some(45.0));
        let running = Arc::new(AtomicBool::new(true));
        let mut sched =
            sched.with_clock(scripted_clock(vec![1_000, 1_000, 5_000], running.clone()));
        let mut h = harness();

        let power = h.power.as_mut().unwrap();
        power.write_all(&input::encode(&key(KEY_POWER, 1, 100))).unwrap();
        let buttons = h.buttons.as_mut().unwrap();
        buttons.write_all(&input::encode(&key(KEY_DOWN, 1, 100))).unwrap();
        let mut client = TcpStream::connect(h.sources.status.local_addr().unwrap()).unwrap();

        assert_eq!(sched.run(&mut h.sources, &running), Exit::Terminated);
        assert_eq!(sched.confirm.repeats(), 1);
        assert_eq!(panel.borrow().confirms, vec![(1, 3)]);
        assert_eq!(panel.borrow().buttons, vec![KEY_DOWN]);
        assert_eq!(panel.borrow().idle, vec![(5, true)]);

        let mut body = String::new();
        client.read_to_string(&mut body).unwrap();
        assert!(body.contains("\"Sysload\""), "unexpected status reply: {}", body);
    }

    #[test]
    fn run_confirms_power_off_from_device() {
        let (sched, _pwm, _panel) = scheduler(Some(45.0));
        let running = Arc::new(AtomicBool::new(true));
        let mut sched = sched.with_clock(scripted_clock(vec![1_000; 5], running.clone()));
        let mut h = harness();

        let power = h.power.as_mut().unwrap();
        for sec in [100, 105, 110] {
            power.write_all(&input::encode(&key(KEY_POWER, 1, sec))).unwrap();
        }

        // One event per wakeup, so the third press lands on the fourth clock read.
        assert_eq!(sched.run(&mut h.sources, &running), Exit::PowerOff);
    }

    #[test]
    fn run_survives_lost_input_devices() {
        let (sched, _pwm, panel) = scheduler(Some(45.0));
        let running = Arc::new(AtomicBool::new(true));
        let mut sched =
            sched.with_clock(scripted_clock(vec![1_000, 1_000, 5_000], running.clone()));
        let mut h = harness();
        drop(h.power.take());
        drop(h.buttons.take());

        assert_eq!(sched.run(&mut h.sources, &running), Exit::Terminated);
        assert!(h.sources.power.is_none());
        assert!(h.sources.buttons.is_none());
        // Monitoring carried on after both devices went away.
        assert_eq!(panel.borrow().idle, vec![(5, false)]);
    }

    #[test]
    fn run_realigns_after_clock_steps_back() {
        let start = 30_001_000;
        let stepped = start - 8 * 3600 * 1000;
        let due = next_deadline_ms(stepped, SCAN_INTERVAL);
        let (sched, _pwm, panel) = scheduler(Some(45.0));
        let running = Arc::new(AtomicBool::new(true));
        let mut sched =
            sched.with_clock(scripted_clock(vec![start, stepped, due], running.clone()));
        let mut h = harness();
        // Wakes the poll at once so the test does not wait out the timeout.
        let power = h.power.as_mut().unwrap();
        power.write_all(&input::encode(&key(KEY_POWER, 0, 1))).unwrap();

        assert_eq!(sched.run(&mut h.sources, &running), Exit::Terminated);
        assert_eq!(panel.borrow().idle, vec![(due / 1000, false)]);
    }
}

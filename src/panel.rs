// src/panel.rs
//! Front-panel display seam. The LCD itself is driven elsewhere; this module
//! keeps the page/backlight state the scheduler needs and logs what to show.

use tracing::{debug, info, warn};

use crate::input::{BTN_OK, InputEvent, KEY_DOWN, KEY_LEFT, KEY_RIGHT, KEY_UP};

/// Seconds without a button press before the panel blanks.
pub const PRESENT_TIMEOUT: i64 = 30;

pub trait FrontPanel {
    fn handle_button(&mut self, event: &InputEvent);
    fn show_power_confirm(&mut self, repeats: u32, required: u32, now: i64);
    fn show_shutdown(&mut self, model: &str);
    /// Called on every timer tick; blanks the panel after inactivity.
    fn idle_tick(&mut self, now: i64, confirm_pending: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Sensors,
    Disks,
    Sysload,
    Interfaces,
    Clock,
    Summary,
}

impl Page {
    const ORDER: [Page; 6] = [
        Page::Sensors,
        Page::Disks,
        Page::Sysload,
        Page::Interfaces,
        Page::Clock,
        Page::Summary,
    ];

    fn step(self, delta: isize) -> Page {
        let len = Self::ORDER.len() as isize;
        let idx = Self::ORDER.iter().position(|&p| p == self).unwrap_or(0) as isize;
        Self::ORDER[(idx + delta).rem_euclid(len) as usize]
    }
}

/// Panel state with output going to the log.
#[derive(Debug)]
pub struct LogPanel {
    on: bool,
    page: Page,
    item: isize,
    last_activity: i64,
}

impl LogPanel {
    pub fn new(model: &str, now: i64) -> Self {
        info!("panel: {} / Hardware monitor", model);
        LogPanel {
            on: true,
            page: Page::Summary,
            item: 0,
            last_activity: now,
        }
    }

    #[cfg(test)]
    pub fn is_on(&self) -> bool {
        self.on
    }

    #[cfg(test)]
    pub fn page(&self) -> Page {
        self.page
    }
}

impl FrontPanel for LogPanel {
    fn handle_button(&mut self, event: &InputEvent) {
        self.last_activity = event.sec;

        if event.code == BTN_OK {
            self.on = !self.on;
            debug!("panel: backlight {}", if self.on { "on" } else { "off" });
            return;
        }
        self.on = true;

        match event.code {
            KEY_UP => {
                self.page = self.page.step(-1);
                self.item = 0;
            }
            KEY_DOWN => {
                self.page = self.page.step(1);
                self.item = 0;
            }
            KEY_LEFT => self.item -= 1,
            KEY_RIGHT => self.item += 1,
            code => {
                warn!("unknown button event received: code={:#x}", code);
                return;
            }
        }
        debug!("panel: page {:?}, item {}", self.page, self.item);
    }

    fn show_power_confirm(&mut self, repeats: u32, required: u32, now: i64) {
        self.on = true;
        self.last_activity = now;
        info!("panel: >>> PowerOff <<< Confirm: {}/{}", repeats, required);
    }

    fn show_shutdown(&mut self, model: &str) {
        self.on = true;
        info!("panel: {} >>> shutdown <<<", model);
    }

    fn idle_tick(&mut self, now: i64, confirm_pending: bool) {
        if self.on && !confirm_pending && now - self.last_activity > PRESENT_TIMEOUT {
            debug!("panel: idle, blanking");
            self.on = false;
            self.page = Page::Summary;
            self.item = 0;
        }
    }
}

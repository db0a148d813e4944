use std::collections::HashMap;

use log::{debug, info, warn};
use proximity_rs::{PresenceListener, Reason};

/// Logs every engine notification, using configured device names.
pub struct LogListener {
    names: HashMap<String, String>,
}

impl LogListener {
    pub fn new(names: HashMap<String, String>) -> Self {
        LogListener { names }
    }

    fn name<'a>(&'a self, device: &'a str) -> &'a str {
        self.names.get(device).map(String::as_str).unwrap_or(device)
    }
}

impl PresenceListener<String> for LogListener {
    fn on_presence_changed(&self, presence: bool, reason: Reason, device: Option<&String>) {
        let device = device.map(|d| self.name(d)).unwrap_or("unknown device");
        if presence {
            info!("Present ({reason}, {device})");
        } else {
            info!("Not present ({reason}, {device})");
        }
    }

    fn on_signal_updated(&self, device: &String, estimate: Option<i32>, active: bool) {
        let mode = if active { "active" } else { "passive" };
        match estimate {
            Some(rssi) => debug!("{}: {rssi}dBm ({mode})", self.name(device)),
            None => debug!("{}: no signal", self.name(device)),
        }
    }

    fn on_countdown(&self, seconds_remaining: u32, reason: Reason) {
        info!("Locking in {seconds_remaining}s ({reason})");
    }

    fn on_countdown_cancelled(&self, reason: Reason) {
        info!("Countdown cancelled ({reason})");
    }

    fn on_radio_power_warning(&self) {
        warn!("Bluetooth is powered off, presence cannot be detected");
    }
}

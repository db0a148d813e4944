use std::time::Instant;

use crate::estimator::RssiWindow;
use crate::timers::{TimerKind, TimerSlot};

/// State of the transport link to one device, as far as the engine knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// How readings for a device are being acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Passive mode is on: broadcasts only, never connect.
    ScanningOnly,
    /// Scanning, possibly with a connection attempt in flight.
    PassiveAcquire,
    /// Connected and polled by the active health timer.
    ActiveAcquire,
}

/// Everything the engine tracks for one entry of the monitored set.
#[derive(Debug)]
pub struct MonitoredDevice {
    pub(crate) presence: bool,
    pub(crate) window: RssiWindow,
    pub(crate) seen: bool,
    pub(crate) last_read_at: Option<Instant>,
    pub(crate) link: LinkState,
    pub(crate) departure: TimerSlot,
    pub(crate) loss: TimerSlot,
    pub(crate) watchdog: TimerSlot,
    pub(crate) health: TimerSlot,
}

impl Default for MonitoredDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoredDevice {
    pub fn new() -> Self {
        MonitoredDevice {
            presence: false,
            window: RssiWindow::new(),
            seen: false,
            last_read_at: None,
            link: LinkState::Disconnected,
            departure: TimerSlot::default(),
            loss: TimerSlot::default(),
            watchdog: TimerSlot::default(),
            health: TimerSlot::default(),
        }
    }

    pub fn presence(&self) -> bool {
        self.presence
    }

    pub fn seen(&self) -> bool {
        self.seen
    }

    pub fn estimate(&self) -> Option<i32> {
        self.window.estimate()
    }

    pub fn last_read_at(&self) -> Option<Instant> {
        self.last_read_at
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn timer(&self, kind: TimerKind) -> &TimerSlot {
        match kind {
            TimerKind::Departure => &self.departure,
            TimerKind::Loss => &self.loss,
            TimerKind::ConnectionWatchdog => &self.watchdog,
            TimerKind::ActiveHealth => &self.health,
        }
    }

    pub(crate) fn timer_mut(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Departure => &mut self.departure,
            TimerKind::Loss => &mut self.loss,
            TimerKind::ConnectionWatchdog => &mut self.watchdog,
            TimerKind::ActiveHealth => &mut self.health,
        }
    }

    /// Cancels all four timers. Returns whether a departure countdown was live.
    pub(crate) fn cancel_timers(&mut self) -> bool {
        let countdown = self.departure.cancel();
        self.loss.cancel();
        self.watchdog.cancel();
        self.health.cancel();
        countdown
    }
}

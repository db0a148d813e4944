use std::collections::BTreeMap;
use std::fmt::Debug;
use std::mem;
use std::time::Instant;

use log::{debug, trace};

use crate::device::{AcquisitionMode, LinkState, MonitoredDevice};
use crate::events::{Command, Notification};
use crate::presence::{LockThreshold, Settings};
use crate::timers::{Scheduler, TimerKind};

/// Proximity presence engine for a set of monitored devices.
///
/// The engine is driven entirely by its caller: transport callbacks, config
/// changes and [`advance`](Engine::advance) for due timers. It never reads
/// the clock and never blocks. Output is queued and collected with
/// [`drain_notifications`](Engine::drain_notifications) and
/// [`drain_commands`](Engine::drain_commands).
///
/// Calls must be serialised; the engine is not reentrant.
#[derive(Debug)]
pub struct Engine<D> {
    pub(crate) devices: BTreeMap<D, MonitoredDevice>,
    pub(crate) settings: Settings,
    pub(crate) scheduler: Scheduler<D>,
    pub(crate) powered_on: bool,
    pub(crate) power_warned: bool,
    pub(crate) suspended: bool,
    pub(crate) notifications: Vec<Notification<D>>,
    pub(crate) commands: Vec<Command<D>>,
}

impl<D> Default for Engine<D>
where
    D: Clone + Ord + Debug,
{
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl<D> Engine<D>
where
    D: Clone + Ord + Debug,
{
    pub fn new(settings: Settings) -> Self {
        Engine {
            devices: BTreeMap::new(),
            settings,
            scheduler: Scheduler::new(),
            powered_on: true,
            power_warned: false,
            suspended: false,
            notifications: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Raw signal sample for `device`, either from a broadcast
    /// (`connected_read == false`) or read over an open connection.
    pub fn on_sample(&mut self, now: Instant, device: &D, raw: i32, connected_read: bool) {
        if !self.powered_on || self.suspended {
            trace!("Dropping sample for {device:?}: monitoring inactive");
            return;
        }
        let passive = self.settings.passive_mode;
        let Some(dev) = self.devices.get(device) else {
            return;
        };
        if connected_read && passive {
            trace!("Dropping connected read for {device:?} in passive mode");
            return;
        }
        if connected_read && dev.link != LinkState::Connected {
            // read finished after its link was torn down
            trace!("Dropping connected read for {device:?} without a link");
            return;
        }
        if !connected_read && dev.health.is_live() {
            // active mode only trusts reads over the link
            return;
        }

        self.apply_sample(now, device, raw);

        if passive {
            return;
        }
        if connected_read {
            self.enter_active(now, device);
        } else {
            self.request_connection(now, device);
        }
    }

    /// Fires every timer due at or before `now`, in deadline order.
    pub fn advance(&mut self, now: Instant) {
        while let Some(due) = self.scheduler.pop_due(now) {
            let Some(dev) = self.devices.get_mut(&due.device) else {
                trace!("Ignoring {:?} timer for unmonitored {:?}", due.kind, due.device);
                continue;
            };
            let slot = dev.timer_mut(due.kind);
            if slot.generation() != Some(due.generation) {
                trace!("Ignoring stale {:?} timer for {:?}", due.kind, due.device);
                continue;
            }
            if due.kind.repeats() {
                self.scheduler.reschedule(&due);
            } else {
                slot.cancel();
            }

            match due.kind {
                TimerKind::Departure => self.departure_tick(&due.device),
                TimerKind::Loss => self.loss_tick(&due.device),
                TimerKind::ConnectionWatchdog => self.watchdog_fired(&due.device),
                TimerKind::ActiveHealth => self.health_tick(due.deadline, &due.device),
            }
        }
    }

    /// When [`advance`](Engine::advance) should next be called. May point at
    /// a timer that has since been cancelled; advancing then is harmless.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn set_lock_threshold(&mut self, threshold: LockThreshold) {
        debug!("Lock threshold set to {threshold:?}");
        self.settings.lock_threshold = threshold;
    }

    pub fn set_departure_timeout(&mut self, seconds: u32) {
        debug!("Departure timeout set to {seconds}s");
        self.settings.departure_timeout_seconds = seconds;
    }

    pub fn set_loss_timeout(&mut self, seconds: u32) {
        debug!("Loss timeout set to {seconds}s");
        self.settings.loss_timeout_seconds = seconds;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn device(&self, device: &D) -> Option<&MonitoredDevice> {
        self.devices.get(device)
    }

    pub fn monitored(&self) -> impl Iterator<Item = &D> {
        self.devices.keys()
    }

    pub fn mode(&self, device: &D) -> Option<AcquisitionMode> {
        let dev = self.devices.get(device)?;
        Some(if self.settings.passive_mode {
            AcquisitionMode::ScanningOnly
        } else if dev.health.is_live() {
            AcquisitionMode::ActiveAcquire
        } else {
            AcquisitionMode::PassiveAcquire
        })
    }

    pub fn is_powered_on(&self) -> bool {
        self.powered_on
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification<D>> {
        mem::take(&mut self.notifications)
    }

    pub fn drain_commands(&mut self) -> Vec<Command<D>> {
        mem::take(&mut self.commands)
    }
}

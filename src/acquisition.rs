//! Scanning versus connected acquisition, per device.
//!
//! ```text
//!   PassiveScan ──sample──► Connecting ──connected + read──► Active
//!        ▲                      │                              │
//!        └──── watchdog (60s) ──┘        no read for 10s ──────┘
//! ```
//!
//! Passive mode short-circuits all of it: no connections, no watchdogs, no
//! health timer and no loss timer.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::device::{LinkState, MonitoredDevice};
use crate::engine::Engine;
use crate::events::{Command, Notification, Reason};
use crate::timers::TimerKind;

/// Active mode falls back to scanning when no reading arrived for this long.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

impl<D> Engine<D>
where
    D: Clone + Ord + Debug,
{
    pub fn on_connected(&mut self, device: &D) {
        let refuse = self.settings.passive_mode || self.suspended || !self.powered_on;
        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        dev.watchdog.cancel();
        if refuse {
            debug!("Dropping unwanted connection to {device:?}");
            dev.link = LinkState::Disconnected;
            self.commands.push(Command::Disconnect(device.clone()));
            return;
        }
        debug!("Connected to {device:?}");
        dev.link = LinkState::Connected;
        self.commands.push(Command::ReadRssi(device.clone()));
    }

    pub fn on_disconnected(&mut self, device: &D) {
        if let Some(dev) = self.devices.get_mut(device) {
            debug!("Disconnected from {device:?}");
            dev.watchdog.cancel();
            dev.link = LinkState::Disconnected;
        }
    }

    /// Turning passive mode on tears down every link and drops every
    /// watchdog, health and loss timer. Turning it off changes nothing until
    /// the next sample.
    pub fn set_passive_mode(&mut self, passive: bool) {
        info!("Passive mode {}", if passive { "on" } else { "off" });
        self.settings.passive_mode = passive;
        if passive {
            for (id, dev) in self.devices.iter_mut() {
                dev.loss.cancel();
                tear_down(id, dev, &mut self.commands);
            }
        }
        self.commands.push(Command::StartScan);
    }

    pub fn on_power_state_changed(&mut self, powered_on: bool) {
        if powered_on {
            info!("Radio powered on");
            self.powered_on = true;
            self.power_warned = false;
            self.commands.push(Command::StartScan);
            return;
        }

        info!("Radio powered off");
        self.powered_on = false;
        let mut was_present = false;
        let mut countdown = false;
        for (id, dev) in self.devices.iter_mut() {
            countdown |= dev.cancel_timers();
            tear_down(id, dev, &mut self.commands);
            was_present |= dev.presence;
            dev.presence = false;
            dev.window.clear();
            if dev.seen {
                self.notifications.push(Notification::SignalUpdated {
                    device: id.clone(),
                    estimate: None,
                    active: false,
                });
            }
        }
        if countdown {
            self.notifications.push(Notification::CountdownCancelled {
                reason: Reason::Away,
            });
        }
        if was_present {
            let (presence, device) = self.evaluate(Reason::Lost, None);
            self.notifications.push(Notification::PresenceChanged {
                presence,
                reason: Reason::Lost,
                device,
            });
        }
        if !self.power_warned {
            self.power_warned = true;
            self.notifications.push(Notification::RadioPowerWarning);
        }
    }

    /// Pauses monitoring without touching presence. On resume every seen
    /// device gets a fresh loss timer, so one that vanished meanwhile is
    /// still reported lost.
    pub fn set_suspended(&mut self, now: Instant, suspended: bool) {
        if suspended == self.suspended {
            return;
        }
        self.suspended = suspended;

        if suspended {
            info!("Monitoring suspended");
            let mut countdown = false;
            for (id, dev) in self.devices.iter_mut() {
                countdown |= dev.cancel_timers();
                tear_down(id, dev, &mut self.commands);
                if dev.seen {
                    self.notifications.push(Notification::SignalUpdated {
                        device: id.clone(),
                        estimate: None,
                        active: false,
                    });
                }
            }
            if countdown {
                self.notifications.push(Notification::CountdownCancelled {
                    reason: Reason::Away,
                });
            }
            return;
        }

        info!("Monitoring resumed");
        if !self.settings.passive_mode {
            for (id, dev) in self.devices.iter_mut() {
                if dev.seen {
                    self.scheduler.arm(&mut dev.loss, id, TimerKind::Loss, now);
                }
            }
        }
        self.commands.push(Command::StartScan);
    }

    /// Opens a link to `device` unless one is already open or in flight.
    pub(crate) fn request_connection(&mut self, now: Instant, device: &D) {
        if self.settings.passive_mode || self.suspended || !self.powered_on {
            return;
        }
        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        if dev.link != LinkState::Disconnected {
            return;
        }
        debug!("Connecting to {device:?}");
        dev.link = LinkState::Connecting;
        self.scheduler
            .arm(&mut dev.watchdog, device, TimerKind::ConnectionWatchdog, now);
        self.commands.push(Command::Connect(device.clone()));
    }

    pub(crate) fn watchdog_fired(&mut self, device: &D) {
        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        if dev.link == LinkState::Connecting {
            warn!("Connection to {device:?} timed out");
            dev.link = LinkState::Disconnected;
            self.commands.push(Command::Disconnect(device.clone()));
        }
    }

    /// First read over a fresh connection switches the device to active mode.
    pub(crate) fn enter_active(&mut self, now: Instant, device: &D) {
        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        if dev.health.is_live() {
            return;
        }
        info!("{device:?} entering active mode");
        self.scheduler
            .arm(&mut dev.health, device, TimerKind::ActiveHealth, now);
    }

    pub(crate) fn health_tick(&mut self, now: Instant, device: &D) {
        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        let stale = dev
            .last_read_at
            .is_none_or(|at| now.saturating_duration_since(at) > STALE_AFTER);

        if stale {
            info!("{device:?} falling back to passive scanning");
            tear_down(device, dev, &mut self.commands);
            self.commands.push(Command::StartScan);
        } else if dev.link == LinkState::Connected {
            self.commands.push(Command::ReadRssi(device.clone()));
        } else {
            self.request_connection(now, device);
        }
    }
}

/// Drops watchdog and health timers and closes any open or pending link.
fn tear_down<D: Clone>(id: &D, dev: &mut MonitoredDevice, commands: &mut Vec<Command<D>>) {
    dev.watchdog.cancel();
    dev.health.cancel();
    if dev.link != LinkState::Disconnected {
        dev.link = LinkState::Disconnected;
        commands.push(Command::Disconnect(id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AcquisitionMode;
    use crate::presence::Settings;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn engine() -> Engine<&'static str> {
        let mut engine = Engine::new(Settings::default());
        engine.set_monitored_set(["phone"]);
        engine.drain_commands();
        engine
    }

    #[test]
    fn test_advertisement_starts_connection() {
        let now = Instant::now();
        let mut engine = engine();
        engine.on_sample(now, &"phone", -60, false);
        assert_eq!(engine.drain_commands(), vec![Command::Connect("phone")]);
        assert_eq!(engine.device(&"phone").unwrap().link(), LinkState::Connecting);

        // attempt already in flight
        engine.on_sample(now, &"phone", -60, false);
        assert!(engine.drain_commands().is_empty());
    }

    #[test]
    fn test_watchdog_aborts_stuck_connection() {
        let start = Instant::now();
        let mut engine = engine();
        engine.set_loss_timeout(120);
        engine.on_sample(start, &"phone", -60, false);
        engine.drain_commands();

        engine.advance(start + secs(59));
        assert!(engine.drain_commands().is_empty());
        engine.advance(start + secs(60));
        assert_eq!(engine.drain_commands(), vec![Command::Disconnect("phone")]);
        assert_eq!(engine.device(&"phone").unwrap().link(), LinkState::Disconnected);
    }

    #[test]
    fn test_connected_read_enters_active_mode() {
        let start = Instant::now();
        let mut engine = engine();
        engine.on_sample(start, &"phone", -60, false);
        engine.on_connected(&"phone");
        assert_eq!(
            engine.drain_commands(),
            vec![Command::Connect("phone"), Command::ReadRssi("phone")]
        );
        let dev = engine.device(&"phone").unwrap();
        assert!(!dev.timer(TimerKind::ConnectionWatchdog).is_live());

        engine.on_sample(start, &"phone", -58, true);
        assert_eq!(engine.mode(&"phone"), Some(AcquisitionMode::ActiveAcquire));

        // broadcasts are ignored once active
        engine.drain_notifications();
        engine.on_sample(start, &"phone", -99, false);
        assert!(engine.drain_notifications().is_empty());

        engine.advance(start + secs(2));
        assert_eq!(engine.drain_commands(), vec![Command::ReadRssi("phone")]);
    }

    #[test]
    fn test_active_mode_retries_lost_link() {
        let start = Instant::now();
        let mut engine = engine();
        engine.on_sample(start, &"phone", -60, false);
        engine.on_connected(&"phone");
        engine.on_sample(start, &"phone", -58, true);
        engine.on_disconnected(&"phone");
        engine.drain_commands();

        engine.advance(start + secs(2));
        assert_eq!(engine.drain_commands(), vec![Command::Connect("phone")]);
    }

    #[test]
    fn test_stale_active_mode_falls_back() {
        let start = Instant::now();
        let mut engine = engine();
        engine.on_sample(start, &"phone", -60, false);
        engine.on_connected(&"phone");
        engine.on_sample(start, &"phone", -58, true);
        engine.drain_commands();

        // health ticks at 2..10 still see a fresh read, 12 does not
        engine.advance(start + secs(10));
        assert!(engine
            .drain_commands()
            .iter()
            .all(|c| *c == Command::ReadRssi("phone")));
        engine.advance(start + secs(12));
        assert_eq!(
            engine.drain_commands(),
            vec![Command::Disconnect("phone"), Command::StartScan]
        );
        assert_eq!(engine.mode(&"phone"), Some(AcquisitionMode::PassiveAcquire));

        // broadcasts are accepted again
        engine.on_sample(start + secs(13), &"phone", -61, false);
        assert_eq!(engine.drain_commands(), vec![Command::Connect("phone")]);
    }

    #[test]
    fn test_late_read_after_fallback_is_dropped() {
        let start = Instant::now();
        let mut engine = engine();
        engine.on_sample(start, &"phone", -60, false);
        engine.on_connected(&"phone");
        engine.on_sample(start, &"phone", -58, true);
        engine.advance(start + secs(12));
        assert_eq!(engine.device(&"phone").unwrap().link(), LinkState::Disconnected);
        engine.drain_notifications();

        // a read issued before the fallback completes afterwards
        engine.on_sample(start + secs(12), &"phone", -58, true);
        assert_eq!(engine.mode(&"phone"), Some(AcquisitionMode::PassiveAcquire));
        assert!(engine.drain_notifications().is_empty());
        assert_eq!(engine.device(&"phone").unwrap().last_read_at(), Some(start));

        engine.on_sample(start + secs(13), &"phone", -90, false);
        assert_eq!(engine.device(&"phone").unwrap().estimate(), Some(-69));
    }

    #[test]
    fn test_read_without_connection_is_dropped() {
        let now = Instant::now();
        let mut engine = engine();
        engine.on_sample(now, &"phone", -60, false);
        engine.drain_notifications();
        engine.on_sample(now, &"phone", -58, true);
        assert!(engine.drain_notifications().is_empty());
        assert_eq!(engine.mode(&"phone"), Some(AcquisitionMode::PassiveAcquire));
    }

    #[test]
    fn test_passive_mode_tears_down() {
        let start = Instant::now();
        let mut engine = engine();
        engine.on_sample(start, &"phone", -60, false);
        engine.on_connected(&"phone");
        engine.on_sample(start, &"phone", -58, true);
        engine.drain_commands();

        engine.set_passive_mode(true);
        assert_eq!(
            engine.drain_commands(),
            vec![Command::Disconnect("phone"), Command::StartScan]
        );
        let dev = engine.device(&"phone").unwrap();
        for kind in [
            TimerKind::Loss,
            TimerKind::ConnectionWatchdog,
            TimerKind::ActiveHealth,
        ] {
            assert!(!dev.timer(kind).is_live());
        }

        // no connection attempts and connected reads are dropped
        engine.on_sample(start, &"phone", -60, false);
        assert!(engine.drain_commands().is_empty());
        engine.on_connected(&"phone");
        assert_eq!(engine.drain_commands(), vec![Command::Disconnect("phone")]);
    }

    #[test]
    fn test_power_off_forces_lost_once() {
        let start = Instant::now();
        let mut engine = engine();
        engine.set_monitored_set(["phone", "watch"]);
        engine.on_sample(start, &"phone", -60, false);
        engine.on_sample(start, &"watch", -60, false);
        engine.drain_notifications();
        engine.drain_commands();

        engine.on_power_state_changed(false);
        let notifications = engine.drain_notifications();
        let lost: Vec<_> = notifications
            .iter()
            .filter(|n| matches!(n, Notification::PresenceChanged { .. }))
            .collect();
        assert_eq!(
            lost,
            vec![&Notification::PresenceChanged {
                presence: false,
                reason: Reason::Lost,
                device: Some("phone"),
            }]
        );
        assert_eq!(notifications.last(), Some(&Notification::RadioPowerWarning));
        assert_eq!(
            engine.drain_commands(),
            vec![Command::Disconnect("phone"), Command::Disconnect("watch")]
        );
        assert!(engine.next_deadline().is_some());
        engine.advance(start + secs(600));
        assert!(engine.drain_notifications().is_empty());
    }

    #[test]
    fn test_power_warning_latched_per_cycle() {
        let mut engine = engine();
        let warnings = |engine: &mut Engine<&'static str>| {
            engine
                .drain_notifications()
                .iter()
                .filter(|n| **n == Notification::RadioPowerWarning)
                .count()
        };
        engine.on_power_state_changed(false);
        engine.on_power_state_changed(false);
        assert_eq!(warnings(&mut engine), 1);
        engine.on_power_state_changed(true);
        assert_eq!(engine.drain_commands(), vec![Command::StartScan]);
        engine.on_power_state_changed(false);
        assert_eq!(warnings(&mut engine), 1);
    }

    #[test]
    fn test_suspend_and_resume() {
        let start = Instant::now();
        let mut engine = engine();
        engine.set_loss_timeout(5);
        engine.on_sample(start, &"phone", -60, false);
        engine.drain_notifications();
        engine.drain_commands();

        engine.set_suspended(start, true);
        assert!(engine.is_suspended());
        assert_eq!(engine.drain_commands(), vec![Command::Disconnect("phone")]);
        engine.on_sample(start, &"phone", -60, false);
        engine.advance(start + secs(30));
        let notifications = engine.drain_notifications();
        assert_eq!(
            notifications,
            vec![Notification::SignalUpdated {
                device: "phone",
                estimate: None,
                active: false,
            }]
        );
        assert!(engine.device(&"phone").unwrap().presence());

        engine.set_suspended(start + secs(30), false);
        assert_eq!(engine.drain_commands(), vec![Command::StartScan]);
        engine.advance(start + secs(35));
        assert!(engine.drain_notifications().contains(&Notification::PresenceChanged {
            presence: false,
            reason: Reason::Lost,
            device: Some("phone"),
        }));
    }
}

//! Per-device presence state machine.
//!
//! ```text
//!   Unseen ──sample──► Absent ◄──────── away ─────────┐
//!                        │                            │
//!                 raw >= threshold                    │
//!                        ▼                            │
//!                     Present ──estimate < lock──► CountdownToAway
//!                        ▲                            │
//!                        └──── estimate >= threshold ─┘
//!
//!   Present / Absent ──no samples for loss timeout──► Lost (absent)
//! ```
//!
//! Arrival is judged on the raw sample against `lock + 15`, departure on the
//! smoothed estimate against `lock`. The gap between the two keeps a device
//! hovering around a single level from flapping.

use std::fmt::Debug;
use std::time::Instant;

use log::{debug, info};

use crate::engine::Engine;
use crate::events::{Notification, Reason};
use crate::timers::TimerKind;

/// Gap between the departure threshold and the level required to arrive.
pub const HYSTERESIS_MARGIN: i32 = 15;
/// Presence threshold used while locking is disabled.
pub const DISABLED_PRESENCE_THRESHOLD: i32 = -65;
/// Countdown notifications start this many seconds into a departure.
pub const EARLY_WARNING_SECONDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockThreshold {
    Disabled,
    Rssi(i32),
}

impl LockThreshold {
    /// Level a raw sample must reach for a device to count as arrived.
    pub fn presence_threshold(self) -> i32 {
        match self {
            LockThreshold::Disabled => DISABLED_PRESENCE_THRESHOLD,
            LockThreshold::Rssi(lock) => lock.saturating_add(HYSTERESIS_MARGIN),
        }
    }

    /// Whether `estimate` is weak enough to start a departure countdown.
    /// Never true while locking is disabled.
    pub fn is_below_lock(self, estimate: i32) -> bool {
        match self {
            LockThreshold::Disabled => false,
            LockThreshold::Rssi(lock) => estimate < lock,
        }
    }
}

/// Externally configured thresholds. Read by the engine, changed only
/// through its setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub lock_threshold: LockThreshold,
    pub departure_timeout_seconds: u32,
    pub loss_timeout_seconds: u32,
    pub passive_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            lock_threshold: LockThreshold::Rssi(-80),
            departure_timeout_seconds: 5,
            loss_timeout_seconds: 60,
            passive_mode: false,
        }
    }
}

impl<D> Engine<D>
where
    D: Clone + Ord + Debug,
{
    /// Runs an accepted sample through the estimator and the transition rules.
    pub(crate) fn apply_sample(&mut self, now: Instant, device: &D, raw: i32) {
        let lock = self.settings.lock_threshold;
        let threshold = lock.presence_threshold();
        let passive = self.settings.passive_mode;
        let rssi = crate::estimator::clamp(raw);

        let arrived = {
            let Some(dev) = self.devices.get_mut(device) else {
                return;
            };
            dev.seen = true;
            dev.last_read_at = Some(now);
            if rssi >= threshold && !dev.presence {
                dev.presence = true;
                // don't average across the jump that made it arrive
                dev.window.clear();
                if dev.departure.cancel() {
                    self.notifications.push(Notification::CountdownCancelled {
                        reason: Reason::Away,
                    });
                }
                true
            } else {
                false
            }
        };
        if arrived {
            info!("{device:?} is close");
            self.transition(Reason::Close, device);
        }

        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        let estimate = dev.window.observe(rssi);
        self.notifications.push(Notification::SignalUpdated {
            device: device.clone(),
            estimate: Some(estimate),
            active: dev.health.is_live(),
        });

        if estimate >= threshold {
            if dev.departure.cancel() {
                debug!("Departure countdown for {device:?} cancelled");
                self.notifications.push(Notification::CountdownCancelled {
                    reason: Reason::Away,
                });
            }
        } else if dev.presence && !dev.departure.is_live() && lock.is_below_lock(estimate) {
            debug!("Departure countdown for {device:?} started at {estimate}dBm");
            self.scheduler
                .arm(&mut dev.departure, device, TimerKind::Departure, now);
        }

        if passive {
            dev.loss.cancel();
        } else {
            self.scheduler.arm(&mut dev.loss, device, TimerKind::Loss, now);
        }
    }

    pub(crate) fn departure_tick(&mut self, device: &D) {
        let timeout = self.settings.departure_timeout_seconds;
        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        dev.departure.ticks += 1;
        let ticks = dev.departure.ticks;

        if ticks >= timeout {
            dev.departure.cancel();
            dev.presence = false;
            info!("{device:?} is away");
            self.transition(Reason::Away, device);
        } else if ticks >= EARLY_WARNING_SECONDS {
            self.notifications.push(Notification::Countdown {
                seconds_remaining: timeout - ticks,
                reason: Reason::Away,
            });
        }
    }

    pub(crate) fn loss_tick(&mut self, device: &D) {
        let timeout = self.settings.loss_timeout_seconds;
        let Some(dev) = self.devices.get_mut(device) else {
            return;
        };
        dev.loss.ticks += 1;
        if dev.loss.ticks < timeout {
            return;
        }

        dev.loss.cancel();
        dev.window.clear();
        let was_present = dev.presence;
        dev.presence = false;
        let countdown = dev.departure.cancel();
        info!("{device:?} signal lost");
        self.notifications.push(Notification::SignalUpdated {
            device: device.clone(),
            estimate: None,
            active: dev.health.is_live(),
        });
        if countdown {
            self.notifications.push(Notification::CountdownCancelled {
                reason: Reason::Away,
            });
        }
        if was_present {
            self.transition(Reason::Lost, device);
        }
    }

    /// Re-evaluates the aggregate after a per-device transition and tells
    /// listeners about it.
    pub(crate) fn transition(&mut self, reason: Reason, device: &D) {
        let (presence, attributed) = self.evaluate(reason, Some(device));
        debug!("Aggregate presence {presence} after {reason} from {device:?}");
        self.notifications.push(Notification::PresenceChanged {
            presence,
            reason,
            device: attributed,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn engine(lock: LockThreshold) -> Engine<&'static str> {
        let mut engine = Engine::new(Settings {
            lock_threshold: lock,
            departure_timeout_seconds: 8,
            loss_timeout_seconds: 60,
            passive_mode: true,
        });
        engine.set_monitored_set(["phone"]);
        engine
    }

    fn presence_events(notifications: &[Notification<&'static str>]) -> Vec<(bool, Reason)> {
        notifications
            .iter()
            .filter_map(|n| match n {
                Notification::PresenceChanged {
                    presence, reason, ..
                } => Some((*presence, *reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(LockThreshold::Rssi(-80).presence_threshold(), -65);
        assert_eq!(LockThreshold::Rssi(-70).presence_threshold(), -55);
        assert_eq!(LockThreshold::Disabled.presence_threshold(), -65);
        assert!(LockThreshold::Rssi(-80).is_below_lock(-81));
        assert!(!LockThreshold::Rssi(-80).is_below_lock(-80));
        assert!(!LockThreshold::Disabled.is_below_lock(-127));
        assert_eq!(LockThreshold::Rssi(i32::MAX - 5).presence_threshold(), i32::MAX);
    }

    #[test]
    fn test_lock_threshold_change_applies_to_next_sample() {
        let now = Instant::now();
        let mut engine = engine(LockThreshold::Rssi(-80));
        engine.set_lock_threshold(LockThreshold::Rssi(-60));
        assert_eq!(engine.settings().lock_threshold, LockThreshold::Rssi(-60));

        // -50 would arrive at the old level, not the new one
        engine.on_sample(now, &"phone", -50, false);
        assert!(!engine.device(&"phone").unwrap().presence());
        engine.on_sample(now, &"phone", -45, false);
        assert!(engine.device(&"phone").unwrap().presence());

        for _ in 0..3 {
            engine.on_sample(now, &"phone", -65, false);
        }
        assert!(!engine.device(&"phone").unwrap().timer(TimerKind::Departure).is_live());
        engine.on_sample(now, &"phone", -65, false);
        assert!(engine.device(&"phone").unwrap().timer(TimerKind::Departure).is_live());
    }

    #[test]
    fn test_weak_first_sample_does_not_arrive() {
        let mut engine = engine(LockThreshold::Rssi(-80));
        engine.on_sample(Instant::now(), &"phone", -70, false);
        let dev = engine.device(&"phone").unwrap();
        assert!(dev.seen());
        assert!(!dev.presence());
        assert!(presence_events(&engine.drain_notifications()).is_empty());
    }

    #[test]
    fn test_arrival_uses_raw_sample_and_resets_window() {
        let now = Instant::now();
        let mut engine = engine(LockThreshold::Rssi(-80));
        for _ in 0..4 {
            engine.on_sample(now, &"phone", -90, false);
        }
        engine.drain_notifications();

        // the mean would still be weak, the raw sample is what counts
        engine.on_sample(now, &"phone", -60, false);
        let notifications = engine.drain_notifications();
        assert_eq!(presence_events(&notifications), vec![(true, Reason::Close)]);
        assert_eq!(
            notifications.last(),
            Some(&Notification::SignalUpdated {
                device: "phone",
                estimate: Some(-60),
                active: false,
            })
        );
        assert_eq!(engine.device(&"phone").unwrap().estimate(), Some(-60));
    }

    #[test]
    fn test_departure_needs_estimate_below_lock() {
        let now = Instant::now();
        let mut engine = engine(LockThreshold::Rssi(-80));
        engine.on_sample(now, &"phone", -60, false);

        // between lock and lock + 15: neither arrival nor departure
        for _ in 0..5 {
            engine.on_sample(now, &"phone", -75, false);
        }
        assert!(!engine.device(&"phone").unwrap().timer(TimerKind::Departure).is_live());

        for _ in 0..5 {
            engine.on_sample(now, &"phone", -90, false);
        }
        assert!(engine.device(&"phone").unwrap().timer(TimerKind::Departure).is_live());
    }

    #[test]
    fn test_countdown_then_away() {
        let start = Instant::now();
        let mut engine = engine(LockThreshold::Rssi(-80));
        engine.on_sample(start, &"phone", -60, false);
        engine.on_sample(start, &"phone", -100, false);
        engine.on_sample(start, &"phone", -100, false);
        engine.drain_notifications();

        engine.advance(start + Duration::from_secs(8));
        let notifications = engine.drain_notifications();
        let countdown: Vec<u32> = notifications
            .iter()
            .filter_map(|n| match n {
                Notification::Countdown {
                    seconds_remaining, ..
                } => Some(*seconds_remaining),
                _ => None,
            })
            .collect();
        assert_eq!(countdown, vec![3, 2, 1]);
        assert_eq!(presence_events(&notifications), vec![(false, Reason::Away)]);
        assert!(!engine.presence());
    }

    #[test]
    fn test_recovery_cancels_countdown() {
        let start = Instant::now();
        let mut engine = engine(LockThreshold::Rssi(-80));
        engine.on_sample(start, &"phone", -60, false);
        engine.on_sample(start, &"phone", -100, false);
        engine.on_sample(start, &"phone", -100, false);
        engine.advance(start + Duration::from_secs(6));
        engine.drain_notifications();

        for _ in 0..5 {
            engine.on_sample(start + Duration::from_secs(6), &"phone", -50, false);
        }
        let notifications = engine.drain_notifications();
        assert_eq!(
            notifications
                .iter()
                .filter(|n| matches!(n, Notification::CountdownCancelled { .. }))
                .count(),
            1
        );

        engine.advance(start + Duration::from_secs(60));
        assert!(engine.drain_notifications().is_empty());
        assert!(engine.device(&"phone").unwrap().presence());
    }

    #[test]
    fn test_disabled_lock_never_counts_down() {
        let now = Instant::now();
        let mut engine = engine(LockThreshold::Disabled);
        engine.on_sample(now, &"phone", -60, false);
        for _ in 0..5 {
            engine.on_sample(now, &"phone", -120, false);
        }
        assert!(!engine.device(&"phone").unwrap().timer(TimerKind::Departure).is_live());
        assert!(engine.device(&"phone").unwrap().presence());
    }
}

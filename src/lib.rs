//! Proximity presence detection.
//!
//! Turns periodic signal-strength samples from one or more wireless peers into
//! presence transitions (`close`, `away`, `lost`) plus a smoothed signal
//! estimate. The [`Engine`] owns no I/O: a host feeds it transport events and
//! the current time, then forwards the queued [`Notification`]s to listeners
//! and the queued [`Command`]s to the radio.

pub mod acquisition;
pub mod aggregate;
pub mod device;
pub mod engine;
pub mod estimator;
pub mod events;
pub mod monitored;
pub mod presence;
pub mod timers;

pub use device::{AcquisitionMode, LinkState, MonitoredDevice};
pub use engine::Engine;
pub use estimator::RssiWindow;
pub use events::{Command, Notification, PresenceListener, Reason};
pub use presence::{LockThreshold, Settings};
pub use timers::TimerKind;

use std::fmt;

/// Why a presence transition or countdown happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Signal rose above the presence threshold.
    Close,
    /// The departure countdown ran out.
    Away,
    /// No samples arrived for the loss timeout, or the radio went off.
    Lost,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Close => "close",
            Reason::Away => "away",
            Reason::Lost => "lost",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events for listeners, queued by the engine in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<D> {
    PresenceChanged {
        presence: bool,
        reason: Reason,
        device: Option<D>,
    },
    SignalUpdated {
        device: D,
        estimate: Option<i32>,
        active: bool,
    },
    Countdown {
        seconds_remaining: u32,
        reason: Reason,
    },
    CountdownCancelled {
        reason: Reason,
    },
    RadioPowerWarning,
}

impl<D> Notification<D> {
    pub fn dispatch<L>(&self, listener: &L)
    where
        L: PresenceListener<D> + ?Sized,
    {
        match self {
            Notification::PresenceChanged {
                presence,
                reason,
                device,
            } => listener.on_presence_changed(*presence, *reason, device.as_ref()),
            Notification::SignalUpdated {
                device,
                estimate,
                active,
            } => listener.on_signal_updated(device, *estimate, *active),
            Notification::Countdown {
                seconds_remaining,
                reason,
            } => listener.on_countdown(*seconds_remaining, *reason),
            Notification::CountdownCancelled { reason } => listener.on_countdown_cancelled(*reason),
            Notification::RadioPowerWarning => listener.on_radio_power_warning(),
        }
    }
}

/// Receiver of engine notifications. Methods default to doing nothing so an
/// implementation only handles what it cares about.
pub trait PresenceListener<D> {
    fn on_presence_changed(&self, _presence: bool, _reason: Reason, _device: Option<&D>) {}

    fn on_signal_updated(&self, _device: &D, _estimate: Option<i32>, _active: bool) {}

    fn on_countdown(&self, _seconds_remaining: u32, _reason: Reason) {}

    fn on_countdown_cancelled(&self, _reason: Reason) {}

    fn on_radio_power_warning(&self) {}
}

/// Requests for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<D> {
    StartScan,
    Connect(D),
    Disconnect(D),
    ReadRssi(D),
}

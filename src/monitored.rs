use std::collections::BTreeSet;
use std::fmt::Debug;

use log::info;

use crate::device::{LinkState, MonitoredDevice};
use crate::engine::Engine;
use crate::events::{Command, Notification, Reason};

impl<D> Engine<D>
where
    D: Clone + Ord + Debug,
{
    /// Replaces the monitored set.
    ///
    /// Removed devices lose their timers, link and all accumulated state
    /// before their entry is dropped. New devices start unseen and absent.
    /// Devices in both sets are left exactly as they were.
    pub fn set_monitored_set<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = D>,
    {
        let wanted: BTreeSet<D> = ids.into_iter().collect();

        let removed: Vec<D> = self
            .devices
            .keys()
            .filter(|id| !wanted.contains(*id))
            .cloned()
            .collect();
        for id in removed {
            let Some(mut dev) = self.devices.remove(&id) else {
                continue;
            };
            info!("No longer monitoring {id:?}");
            if dev.cancel_timers() {
                self.notifications.push(Notification::CountdownCancelled {
                    reason: Reason::Away,
                });
            }
            if dev.link != LinkState::Disconnected {
                self.commands.push(Command::Disconnect(id));
            }
        }

        let mut added = false;
        for id in wanted {
            if !self.devices.contains_key(&id) {
                info!("Monitoring {id:?}");
                self.devices.insert(id, MonitoredDevice::new());
                added = true;
            }
        }
        if added && self.powered_on && !self.suspended {
            self.commands.push(Command::StartScan);
        }
    }
}

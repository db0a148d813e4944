use std::fmt::Debug;

use crate::engine::Engine;
use crate::events::Reason;

impl<D> Engine<D>
where
    D: Clone + Ord + Debug,
{
    /// System-wide presence: true unless some monitored device that has been
    /// seen is currently absent. Devices never seen don't count.
    pub fn presence(&self) -> bool {
        self.first_absent().is_none()
    }

    /// Aggregate presence plus the device a transition is attributed to.
    ///
    /// `close` is attributed to the triggering device. `away` and `lost` go to
    /// the triggering device if there is one, otherwise to the smallest
    /// identity among the seen-but-absent devices.
    pub fn evaluate(&self, reason: Reason, triggering: Option<&D>) -> (bool, Option<D>) {
        let first_absent = self.first_absent();
        let attributed = match reason {
            Reason::Close => triggering,
            Reason::Away | Reason::Lost => triggering.or(first_absent),
        };
        (first_absent.is_none(), attributed.cloned())
    }

    fn first_absent(&self) -> Option<&D> {
        self.devices
            .iter()
            .find(|(_, dev)| dev.seen && !dev.presence)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::presence::Settings;

    fn engine() -> Engine<&'static str> {
        let mut engine = Engine::new(Settings {
            passive_mode: true,
            ..Settings::default()
        });
        engine.set_monitored_set(["a", "b", "c"]);
        engine
    }

    #[test]
    fn test_nothing_seen_is_present() {
        let engine = engine();
        assert!(engine.presence());
        assert_eq!(engine.evaluate(Reason::Lost, None), (true, None));
        assert!(Engine::<u32>::default().presence());
    }

    #[test]
    fn test_unseen_device_does_not_count() {
        let mut engine = engine();
        engine.on_sample(Instant::now(), &"a", -50, false);
        assert!(engine.presence());
    }

    #[test]
    fn test_attribution_falls_back_to_smallest_absent() {
        let now = Instant::now();
        let mut engine = engine();
        engine.on_sample(now, &"a", -50, false);
        engine.on_sample(now, &"c", -95, false);
        engine.on_sample(now, &"b", -95, false);
        assert!(!engine.presence());
        assert_eq!(engine.evaluate(Reason::Lost, None), (false, Some("b")));
        assert_eq!(engine.evaluate(Reason::Away, Some(&"c")), (false, Some("c")));
        assert_eq!(engine.evaluate(Reason::Close, Some(&"a")), (false, Some("a")));
    }
}

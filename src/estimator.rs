use std::collections::VecDeque;

/// Number of raw samples averaged into the smoothed estimate.
pub const WINDOW_CAPACITY: usize = 5;

/// Real radio strength is never positive; anything above zero is a malformed reading.
pub fn clamp(raw: i32) -> i32 {
    raw.min(0)
}

/// Rolling window of the most recent signal samples for one device.
#[derive(Debug, Clone, Default)]
pub struct RssiWindow {
    samples: VecDeque<i32>,
}

impl RssiWindow {
    pub fn new() -> Self {
        RssiWindow {
            samples: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// Clamps `raw`, pushes it (evicting the oldest sample when full) and
    /// returns the mean of the window.
    pub fn observe(&mut self, raw: i32) -> i32 {
        let sample = clamp(raw);
        if self.samples.len() >= WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.estimate().unwrap_or(sample)
    }

    /// Arithmetic mean of the window, truncated toward zero. `None` when empty.
    pub fn estimate(&self) -> Option<i32> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i64 = self.samples.iter().map(|&s| i64::from(s)).sum();
        Some((sum / self.samples.len() as i64) as i32)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

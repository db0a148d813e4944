//! Cancellable per-device timers driven by a single deadline heap.
//!
//! Every armed timer gets a fresh generation number that is stored both in
//! the owning [`TimerSlot`] and in the heap entry. Cancelling a timer only
//! clears the slot; the heap entry is left behind and recognised as stale
//! when it comes due, because its generation no longer matches the slot (or
//! the slot's device is gone altogether).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// "About to leave" countdown, ticking once per second.
    Departure,
    /// No-sample countdown, ticking once per second.
    Loss,
    /// Aborts a connection attempt that never completed.
    ConnectionWatchdog,
    /// Keeps an active connection fed with reads, or falls back to scanning.
    ActiveHealth,
}

impl TimerKind {
    pub fn period(self) -> Duration {
        match self {
            TimerKind::Departure | TimerKind::Loss => Duration::from_secs(1),
            TimerKind::ConnectionWatchdog => Duration::from_secs(60),
            TimerKind::ActiveHealth => Duration::from_secs(2),
        }
    }

    pub fn repeats(self) -> bool {
        !matches!(self, TimerKind::ConnectionWatchdog)
    }
}

/// Handle for at most one live instance of a timer kind on one device.
#[derive(Debug, Default)]
pub struct TimerSlot {
    generation: Option<u64>,
    /// Ticks fired since the current instance was armed.
    pub ticks: u32,
}

impl TimerSlot {
    pub fn is_live(&self) -> bool {
        self.generation.is_some()
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Returns whether an instance was live. Cancelling an idle slot is a no-op.
    pub fn cancel(&mut self) -> bool {
        self.ticks = 0;
        self.generation.take().is_some()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry<D> {
    deadline: Instant,
    seq: u64,
    device: D,
    kind: TimerKind,
    generation: u64,
}

/// A timer that came due. The caller checks `generation` against the slot
/// before acting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Due<D> {
    pub deadline: Instant,
    pub device: D,
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug)]
pub struct Scheduler<D> {
    heap: BinaryHeap<Reverse<Entry<D>>>,
    next_generation: u64,
    next_seq: u64,
}

impl<D> Default for Scheduler<D>
where
    D: Clone + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Scheduler<D>
where
    D: Clone + Ord,
{
    pub fn new() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            next_generation: 1,
            next_seq: 0,
        }
    }

    /// Cancels whatever instance `slot` holds and arms a new one, first due
    /// one period after `now`.
    pub fn arm(&mut self, slot: &mut TimerSlot, device: &D, kind: TimerKind, now: Instant) {
        slot.cancel();
        let generation = self.next_generation;
        self.next_generation += 1;
        slot.generation = Some(generation);
        self.push(now + kind.period(), device.clone(), kind, generation);
    }

    /// Queues the next tick of a periodic timer.
    pub fn reschedule(&mut self, due: &Due<D>) {
        self.push(
            due.deadline + due.kind.period(),
            due.device.clone(),
            due.kind,
            due.generation,
        );
    }

    /// Earliest queued deadline, stale entries included.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<Due<D>> {
        if self.next_deadline()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(entry)| Due {
            deadline: entry.deadline,
            device: entry.device,
            kind: entry.kind,
            generation: entry.generation,
        })
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn push(&mut self, deadline: Instant, device: D, kind: TimerKind, generation: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            device,
            kind,
            generation,
        }));
    }
}

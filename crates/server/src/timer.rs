//! Tick-scheduled callbacks.
//!
//! Timers fire oldest-due first; timers due on the same tick fire in the order
//! they were scheduled.

use skirmish_core::SimTick;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Handle returned by the scheduling calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Callback invoked on the simulation thread.
pub type TimerCallback<Ctx> = Box<dyn FnMut(&mut Ctx) + Send>;

type QueueKey = (SimTick, u64);

struct TimerEntry<Ctx> {
    id: TimerId,
    interval: Option<u64>,
    callback: TimerCallback<Ctx>,
}

/// A timer popped for firing. Hand it back with [`TimerManager::finish`].
pub struct DueTimer<Ctx> {
    id: TimerId,
    due: SimTick,
    interval: Option<u64>,
    callback: TimerCallback<Ctx>,
}

impl<Ctx> DueTimer<Ctx> {
    /// Timer handle.
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Tick the timer was due.
    pub fn due(&self) -> SimTick {
        self.due
    }

    /// Run the callback.
    pub fn fire(&mut self, ctx: &mut Ctx) {
        (self.callback)(ctx);
    }
}

/// Ordered store of one-shot and repeating timers.
pub struct TimerManager<Ctx> {
    queue: BTreeMap<QueueKey, TimerEntry<Ctx>>,
    index: HashMap<TimerId, QueueKey>,
    in_flight: HashSet<TimerId>,
    cancelled_in_flight: HashSet<TimerId>,
    next_seq: u64,
    next_id: u64,
}

impl<Ctx> Default for TimerManager<Ctx> {
    fn default() -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            in_flight: HashSet::new(),
            cancelled_in_flight: HashSet::new(),
            next_seq: 0,
            next_id: 1,
        }
    }
}

impl<Ctx> TimerManager<Ctx> {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once at tick `at`.
    pub fn schedule_once(
        &mut self,
        at: SimTick,
        callback: impl FnMut(&mut Ctx) + Send + 'static,
    ) -> TimerId {
        let id = self.allocate_id();
        self.insert(at, id, None, Box::new(callback));
        id
    }

    /// Run `callback` at `first`, then every `interval` ticks until cancelled.
    pub fn schedule_repeating(
        &mut self,
        first: SimTick,
        interval: u64,
        callback: impl FnMut(&mut Ctx) + Send + 'static,
    ) -> TimerId {
        let id = self.allocate_id();
        self.insert(first, id, Some(interval.max(1)), Box::new(callback));
        id
    }

    /// Cancel a timer. Returns false if it already fired or never existed.
    ///
    /// Cancelling a repeating timer from inside its own callback stops it from
    /// being rescheduled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if let Some(key) = self.index.remove(&id) {
            self.queue.remove(&key);
            return true;
        }
        if self.in_flight.contains(&id) {
            return self.cancelled_in_flight.insert(id);
        }
        false
    }

    /// Pop every timer due at or before `now`, in firing order.
    pub fn take_due(&mut self, now: SimTick) -> Vec<DueTimer<Ctx>> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((at, _), timer) = entry.remove_entry();
            self.index.remove(&timer.id);
            self.in_flight.insert(timer.id);
            due.push(DueTimer {
                id: timer.id,
                due: at,
                interval: timer.interval,
                callback: timer.callback,
            });
        }
        due
    }

    /// Return a fired timer. Repeating timers are rescheduled unless cancelled.
    pub fn finish(&mut self, timer: DueTimer<Ctx>) {
        self.in_flight.remove(&timer.id);
        let cancelled = self.cancelled_in_flight.remove(&timer.id);
        if let (Some(interval), false) = (timer.interval, cancelled) {
            self.insert(timer.due.advance(interval), timer.id, Some(interval), timer.callback);
        }
    }

    /// Tick of the earliest pending timer.
    pub fn next_due(&self) -> Option<SimTick> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Whether `id` is still scheduled.
    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.index.contains_key(&id)
    }

    /// Pending timer count.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn allocate_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(
        &mut self,
        at: SimTick,
        id: TimerId,
        interval: Option<u64>,
        callback: TimerCallback<Ctx>,
    ) {
        let key = (at, self.next_seq);
        self.next_seq += 1;
        self.index.insert(id, key);
        self.queue.insert(
            key,
            TimerEntry {
                id,
                interval,
                callback,
            },
        );
    }
}

impl<Ctx> fmt::Debug for TimerManager<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.queue.len())
            .field("next_due", &self.next_due())
            .finish()
    }
}

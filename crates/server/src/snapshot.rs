//! Snapshot cadence.

use skirmish_core::SimTick;

/// Decides on which ticks a state snapshot goes out.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    interval: u64,
    last_sent: Option<SimTick>,
    forced: bool,
}

impl SnapshotSchedule {
    /// Emit every `interval` ticks (minimum 1).
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            last_sent: None,
            forced: false,
        }
    }

    /// Snapshot interval in ticks.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Check whether `tick` should carry a snapshot, and record it if so.
    pub fn should_send(&mut self, tick: SimTick) -> bool {
        let due = match self.last_sent {
            None => true,
            Some(last) => self.forced || tick.since(last) >= self.interval,
        };
        if due {
            self.last_sent = Some(tick);
            self.forced = false;
        }
        due
    }

    /// Send on the next check regardless of the interval (joins, teleports).
    pub fn force_next(&mut self) {
        self.forced = true;
    }
}

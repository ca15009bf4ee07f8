//! Tick traces: step a small simulation and capture state after every tick.
//!
//! Two runs with the same inputs must produce identical traces; compare them
//! directly or against a golden file with [`assert_json_snapshot`](crate::assert_json_snapshot).

use serde::{Deserialize, Serialize};
use skirmish_core::SimTick;

/// State captured at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceFrame<S> {
    /// Tick number.
    pub tick: u64,
    /// Captured state.
    pub state: S,
}

/// A named sequence of frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickTrace<S> {
    /// Trace name.
    pub name: String,
    /// Frames, starting at tick zero.
    pub frames: Vec<TraceFrame<S>>,
}

impl<S: PartialEq> TickTrace<S> {
    /// First tick where the two traces differ.
    pub fn first_divergence(&self, other: &TickTrace<S>) -> Option<u64> {
        let diverged = self
            .frames
            .iter()
            .zip(&other.frames)
            .find(|(a, b)| a != b)
            .map(|(a, _)| a.tick);
        match diverged {
            Some(tick) => Some(tick),
            None if self.frames.len() != other.frames.len() => {
                Some(self.frames.len().min(other.frames.len()) as u64)
            }
            None => None,
        }
    }
}

/// Capture `capture` at tick zero, then after each of `ticks` calls to `step`.
///
/// The trace holds `ticks + 1` frames.
pub fn record_trace<State, S>(
    name: &str,
    ticks: u64,
    state: &mut State,
    mut step: impl FnMut(SimTick, &mut State),
    mut capture: impl FnMut(SimTick, &State) -> S,
) -> TickTrace<S> {
    let mut frames = Vec::with_capacity(ticks as usize + 1);
    let mut tick = SimTick::ZERO;
    frames.push(TraceFrame {
        tick: tick.0,
        state: capture(tick, state),
    });
    for _ in 0..ticks {
        step(tick, state);
        tick = tick.advance(1);
        frames.push(TraceFrame {
            tick: tick.0,
            state: capture(tick, state),
        });
    }
    TickTrace {
        name: name.to_string(),
        frames,
    }
}

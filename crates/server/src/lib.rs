#![warn(missing_docs)]
//! Authoritative match host.
//!
//! [`SharedMatch`] owns the clock, terrain layers and timers; [`MatchHost`] feeds it
//! commands from a [`skirmish_net::SessionManager`] at step boundaries and sends
//! snapshots back out.

mod commands;
mod host;
mod shared_match;
mod snapshot;
mod terrain;
mod timer;

pub use commands::{editor_store, server_store};
pub use host::{HostFrame, HostSettings, MatchHost};
pub use shared_match::{MatchConfig, Outgoing, SharedMatch, StepHooks};
pub use snapshot::SnapshotSchedule;
pub use terrain::{LayerSpec, Terrain, TerrainLayer};
pub use timer::{DueTimer, TimerCallback, TimerId, TimerManager};

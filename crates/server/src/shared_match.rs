//! Fixed-step authoritative match state.

use crate::terrain::{LayerSpec, Terrain};
use crate::timer::{TimerId, TimerManager};
use anyhow::{bail, Context, Result};
use bevy_ecs::entity::Entity;
use serde::{Deserialize, Serialize};
use skirmish_core::{tick_duration, PeerId, SimTick, DEFAULT_TICK_RATE};
use skirmish_ecs::{Position, Tile};
use skirmish_net::protocol::{EntityState, LayerId, StateSnapshot, MAX_MOVE_STEP};
use skirmish_net::{Command, CommandError, DisconnectReason, Packet};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Match tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Simulation steps per second.
    pub tick_rate: u32,
    /// Seed for terrain generation.
    pub seed: u64,
    /// Terrain layers, in order.
    pub layers: Vec<LayerSpec>,
    /// Ticks between state snapshots.
    pub snapshot_interval: u64,
    /// Largest movement an avatar may have queued per axis.
    pub max_pending_move: i32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            seed: 0x5EED,
            layers: vec![LayerSpec::default(), LayerSpec::default()],
            snapshot_interval: 2,
            max_pending_move: MAX_MOVE_STEP * 4,
        }
    }
}

/// Per-step extension points, called from inside [`SharedMatch::step`].
pub trait StepHooks {
    /// Before terrain advances: apply commands received since the last step.
    fn before_step(&mut self, _world: &mut SharedMatch) {}
    /// After timers fired: emit snapshots and other outbound state.
    fn after_step(&mut self, _world: &mut SharedMatch) {}
}

impl StepHooks for () {}

/// Something the match wants the session layer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Send to one session.
    To {
        /// Recipient.
        peer: PeerId,
        /// Packet.
        packet: Packet,
    },
    /// Send to every connected session.
    Broadcast(Packet),
    /// Tear a session down.
    Disconnect {
        /// Session.
        peer: PeerId,
        /// Reason.
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy)]
struct AvatarSlot {
    layer: LayerId,
    entity: Entity,
}

/// Authoritative match: clock, terrain, timers and avatars.
///
/// Mutated only by the step loop and by command handlers invoked during a step.
pub struct SharedMatch {
    config: MatchConfig,
    tick: SimTick,
    sim_time: Duration,
    step: Duration,
    accumulator: Duration,
    terrain: Terrain,
    timers: TimerManager<SharedMatch>,
    avatars: BTreeMap<PeerId, AvatarSlot>,
    outbox: Vec<Outgoing>,
}

impl SharedMatch {
    /// Generate terrain and start at tick zero.
    pub fn new(config: MatchConfig) -> Result<Self> {
        let terrain = Terrain::generate(&config.layers, config.seed)
            .context("Failed to generate terrain")?;
        Ok(Self::with_terrain(config, terrain))
    }

    /// Start with prepared terrain.
    pub fn with_terrain(config: MatchConfig, terrain: Terrain) -> Self {
        let step = tick_duration(config.tick_rate);
        Self {
            config,
            tick: SimTick::ZERO,
            sim_time: Duration::ZERO,
            step,
            accumulator: Duration::ZERO,
            terrain,
            timers: TimerManager::new(),
            avatars: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    /// Next tick to be simulated.
    pub fn tick(&self) -> SimTick {
        self.tick
    }

    /// Simulated time so far.
    pub fn sim_time(&self) -> Duration {
        self.sim_time
    }

    /// Fixed step length.
    pub fn step_duration(&self) -> Duration {
        self.step
    }

    /// Elapsed time not yet consumed by a whole step.
    pub fn pending_time(&self) -> Duration {
        self.accumulator
    }

    /// Match configuration.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Terrain layers.
    pub fn terrain(&self) -> &Terrain {
        &self.terrain
    }

    /// Mutable terrain layers.
    pub fn terrain_mut(&mut self) -> &mut Terrain {
        &mut self.terrain
    }

    /// Timer queue.
    pub fn timers_mut(&mut self) -> &mut TimerManager<SharedMatch> {
        &mut self.timers
    }

    /// Feed wall-clock time; runs as many whole steps as fit and carries the rest.
    ///
    /// Catch-up always runs full steps, never a scaled one.
    #[instrument(skip(self, hooks), fields(tick = self.tick.0))]
    pub fn update(&mut self, elapsed: Duration, hooks: &mut impl StepHooks) -> u32 {
        self.accumulator += elapsed;
        let mut steps = 0;
        while self.accumulator >= self.step {
            self.accumulator -= self.step;
            self.step(hooks);
            steps += 1;
        }
        if steps > 1 {
            debug!(steps, "catching up");
        }
        steps
    }

    /// Run exactly one step.
    pub fn step(&mut self, hooks: &mut impl StepHooks) {
        trace!(tick = self.tick.0, "step");
        hooks.before_step(self);
        self.terrain.advance(self.tick);
        self.fire_timers();
        hooks.after_step(self);
        self.tick = self.tick.advance(1);
        self.sim_time += self.step;
    }

    fn fire_timers(&mut self) {
        for mut timer in self.timers.take_due(self.tick) {
            trace!(timer = timer.id().0, due = timer.due().0, "firing timer");
            timer.fire(self);
            self.timers.finish(timer);
        }
    }

    /// Run `callback` once, `delay` ticks from now.
    pub fn schedule_in(
        &mut self,
        delay: u64,
        callback: impl FnMut(&mut SharedMatch) + Send + 'static,
    ) -> TimerId {
        let at = self.tick.advance(delay);
        self.timers.schedule_once(at, callback)
    }

    /// Run `callback` every `interval` ticks, starting `interval` ticks from now.
    pub fn schedule_every(
        &mut self,
        interval: u64,
        callback: impl FnMut(&mut SharedMatch) + Send + 'static,
    ) -> TimerId {
        let first = self.tick.advance(interval.max(1));
        self.timers.schedule_repeating(first, interval, callback)
    }

    // === Avatars ===

    /// Spawn `peer`'s avatar on `layer` at the layer's spawn point.
    pub fn spawn_avatar(&mut self, peer: PeerId, layer: LayerId) -> Result<Position> {
        if self.avatars.contains_key(&peer) {
            bail!("{peer} already has an avatar");
        }
        let terrain_layer = self.terrain.require_mut(layer)?;
        let at = terrain_layer
            .spawn_point()
            .with_context(|| format!("layer {layer} has no walkable tile"))?;
        let entity = terrain_layer.spawn_avatar(peer, at);
        self.avatars.insert(peer, AvatarSlot { layer, entity });
        debug!(%peer, layer, x = at.x, y = at.y, "Avatar spawned");
        Ok(at)
    }

    /// Remove `peer`'s avatar. Returns false if it had none.
    pub fn despawn_avatar(&mut self, peer: PeerId) -> bool {
        let Some(slot) = self.avatars.remove(&peer) else {
            return false;
        };
        if let Some(layer) = self.terrain.layer_mut(slot.layer) {
            layer.despawn_avatar(slot.entity);
        }
        debug!(%peer, "Avatar despawned");
        true
    }

    /// Queue movement; walked one tile per axis per substep.
    pub fn queue_move(&mut self, peer: PeerId, dx: i32, dy: i32) -> Result<()> {
        let slot = self.slot(peer)?;
        let limit = self.config.max_pending_move;
        self.terrain
            .require_mut(slot.layer)?
            .push_move(slot.entity, dx, dy, limit)
    }

    /// Move `peer`'s avatar to another layer, keeping its tile if walkable there.
    pub fn move_avatar_to_layer(&mut self, peer: PeerId, layer: LayerId) -> Result<Position> {
        let slot = self.slot(peer)?;
        if slot.layer == layer {
            return self
                .terrain
                .require_mut(layer)?
                .position(slot.entity)
                .context("avatar has no position");
        }
        // Validate the target before touching the source layer.
        let target = self.terrain.require_mut(layer)?;
        let fallback = target.spawn_point();

        let from = self
            .terrain
            .require_mut(slot.layer)?
            .despawn_avatar(slot.entity);

        let target = self.terrain.require_mut(layer)?;
        let at = match from {
            Some(pos) if target.grid().is_walkable(pos.x, pos.y) => pos,
            _ => fallback.with_context(|| format!("layer {layer} has no walkable tile"))?,
        };
        let entity = target.spawn_avatar(peer, at);
        self.avatars.insert(peer, AvatarSlot { layer, entity });
        debug!(%peer, from = slot.layer, to = layer, "Avatar switched layer");
        Ok(at)
    }

    /// Place `peer`'s avatar at an exact tile, ignoring walkability.
    ///
    /// The tile must lie inside the target layer.
    pub fn teleport(&mut self, peer: PeerId, layer: LayerId, at: Position) -> Result<()> {
        let slot = self.slot(peer)?;
        let inside = self.terrain.require_mut(layer)?.grid().get(at.x, at.y).is_some();
        if !inside {
            bail!("tile ({}, {}) is outside layer {layer}", at.x, at.y);
        }
        if slot.layer != layer {
            self.move_avatar_to_layer(peer, layer)?;
        }
        let slot = self.slot(peer)?;
        self.terrain.require_mut(layer)?.place(slot.entity, at)
    }

    /// Overwrite one terrain tile.
    pub fn paint_tile(&mut self, layer: LayerId, x: i32, y: i32, tile: Tile) -> Result<()> {
        if !self.terrain.require_mut(layer)?.paint(x, y, tile) {
            bail!("tile ({x}, {y}) is outside layer {layer}");
        }
        Ok(())
    }

    /// Layer and tile of `peer`'s avatar.
    pub fn avatar_position(&self, peer: PeerId) -> Option<(LayerId, Position)> {
        let slot = self.avatars.get(&peer)?;
        let pos = self.terrain.layer(slot.layer)?.position(slot.entity)?;
        Some((slot.layer, pos))
    }

    /// Number of live avatars.
    pub fn avatar_count(&self) -> usize {
        self.avatars.len()
    }

    fn slot(&self, peer: PeerId) -> Result<AvatarSlot> {
        self.avatars
            .get(&peer)
            .copied()
            .with_context(|| format!("{peer} has no avatar"))
    }

    /// Snapshot of every avatar, ordered by owner.
    pub fn snapshot(&self) -> StateSnapshot {
        let entities = self
            .avatars
            .iter()
            .filter_map(|(peer, slot)| {
                let pos = self.terrain.layer(slot.layer)?.position(slot.entity)?;
                Some(EntityState {
                    owner: *peer,
                    layer: slot.layer,
                    x: pos.x,
                    y: pos.y,
                })
            })
            .collect();
        StateSnapshot {
            tick: self.tick,
            entities,
        }
    }

    // === Outbox ===

    /// Queue a packet for one session.
    pub fn send_to(&mut self, peer: PeerId, packet: Packet) {
        self.outbox.push(Outgoing::To { peer, packet });
    }

    /// Encode and queue a command for one session.
    pub fn send_command<C: Command>(&mut self, peer: PeerId, cmd: &C) -> Result<(), CommandError> {
        let packet = Packet::from_command(cmd)?;
        self.send_to(peer, packet);
        Ok(())
    }

    /// Queue a packet for every connected session.
    pub fn broadcast(&mut self, packet: Packet) {
        self.outbox.push(Outgoing::Broadcast(packet));
    }

    /// Encode and queue a command for every connected session.
    pub fn broadcast_command<C: Command>(&mut self, cmd: &C) -> Result<(), CommandError> {
        let packet = Packet::from_command(cmd)?;
        self.broadcast(packet);
        Ok(())
    }

    /// Ask the session layer to disconnect `peer`.
    pub fn request_disconnect(&mut self, peer: PeerId, reason: DisconnectReason) {
        self.outbox.push(Outgoing::Disconnect { peer, reason });
    }

    /// Take everything queued since the last drain, in order.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }
}

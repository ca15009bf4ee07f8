//! Terrain layers, each an independent `bevy_ecs` world.

use anyhow::{bail, Context, Result};
use bevy_ecs::entity::Entity;
use bevy_ecs::schedule::Schedules;
use bevy_ecs::world::World;
use rand::Rng;
use serde::{Deserialize, Serialize};
use skirmish_core::{scoped_rng, PeerId, SimTick};
use skirmish_ecs::{
    build_layer_schedule, run_substep, Avatar, PendingMove, Position, Tile, TileGrid,
};
use skirmish_net::protocol::LayerId;
use tracing::{debug, trace};

/// Generation parameters for one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerSpec {
    /// Width in tiles.
    pub width: u16,
    /// Height in tiles.
    pub height: u16,
    /// Schedule runs per tick.
    pub substeps: u32,
    /// Fraction of interior tiles that become walls.
    pub wall_density: f32,
    /// Fraction of interior tiles that become water.
    pub water_density: f32,
}

impl Default for LayerSpec {
    fn default() -> Self {
        Self {
            width: 48,
            height: 48,
            substeps: 2,
            wall_density: 0.08,
            water_density: 0.04,
        }
    }
}

/// One terrain layer: its own world, schedule and tile grid.
pub struct TerrainLayer {
    id: LayerId,
    world: World,
    schedules: Schedules,
    substeps: u32,
}

impl TerrainLayer {
    /// Generate a walled layer with scattered obstacles.
    ///
    /// The same `match_seed` and `id` always produce the same grid.
    pub fn generate(id: LayerId, spec: &LayerSpec, match_seed: u64) -> Self {
        let mut grid = TileGrid::filled(spec.width, spec.height, Tile::FLOOR);
        let mut rng = scoped_rng(match_seed, layer_hash(id), SimTick::ZERO);
        let (w, h) = (i32::from(spec.width), i32::from(spec.height));

        for y in 0..h {
            for x in 0..w {
                let tile = if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
                    Tile::WALL
                } else {
                    let roll: f32 = rng.gen();
                    if roll < spec.wall_density {
                        Tile::WALL
                    } else if roll < spec.wall_density + spec.water_density {
                        Tile::WATER
                    } else {
                        Tile::FLOOR
                    }
                };
                grid.set(x, y, tile);
            }
        }

        debug!(layer = id, width = w, height = h, "Generated terrain layer");
        Self::from_grid(id, grid, spec.substeps)
    }

    /// Wrap an existing grid.
    pub fn from_grid(id: LayerId, grid: TileGrid, substeps: u32) -> Self {
        let mut world = World::default();
        world.insert_resource(grid);
        Self {
            id,
            world,
            schedules: build_layer_schedule(),
            substeps: substeps.max(1),
        }
    }

    /// Layer index.
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Schedule runs per tick.
    pub fn substeps(&self) -> u32 {
        self.substeps
    }

    /// Run every substep for `tick`.
    pub fn advance(&mut self, tick: SimTick) {
        trace!(layer = self.id, tick = tick.0, "advancing layer");
        for substep in 0..self.substeps {
            run_substep(&mut self.world, &mut self.schedules, tick, substep);
        }
    }

    /// Tile grid.
    pub fn grid(&self) -> &TileGrid {
        self.world.resource::<TileGrid>()
    }

    /// Overwrite one tile. Returns false when out of bounds.
    pub fn paint(&mut self, x: i32, y: i32, tile: Tile) -> bool {
        self.world.resource_mut::<TileGrid>().set(x, y, tile)
    }

    /// First walkable tile, scanning outward from the centre row by row.
    pub fn spawn_point(&self) -> Option<Position> {
        let grid = self.grid();
        let (w, h) = (i32::from(grid.width()), i32::from(grid.height()));
        let (cx, cy) = (w / 2, h / 2);
        let radius = w.max(h);
        for r in 0..=radius {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx.abs() != r && dy.abs() != r {
                        continue;
                    }
                    if grid.is_walkable(cx + dx, cy + dy) {
                        return Some(Position {
                            x: cx + dx,
                            y: cy + dy,
                        });
                    }
                }
            }
        }
        None
    }

    /// Spawn an avatar at `at`.
    pub fn spawn_avatar(&mut self, owner: PeerId, at: Position) -> Entity {
        self.world
            .spawn((Avatar { owner }, at, PendingMove::default()))
            .id()
    }

    /// Remove an avatar. Returns its last position.
    pub fn despawn_avatar(&mut self, entity: Entity) -> Option<Position> {
        let pos = self.world.get::<Position>(entity).copied();
        self.world.despawn(entity);
        pos
    }

    /// Add to an avatar's pending movement.
    pub fn push_move(&mut self, entity: Entity, dx: i32, dy: i32, limit: i32) -> Result<()> {
        let mut pending = self
            .world
            .get_mut::<PendingMove>(entity)
            .context("avatar has no movement component")?;
        pending.dx = pending.dx.saturating_add(dx).clamp(-limit, limit);
        pending.dy = pending.dy.saturating_add(dy).clamp(-limit, limit);
        Ok(())
    }

    /// Place an avatar directly, cancelling its pending movement.
    pub fn place(&mut self, entity: Entity, at: Position) -> Result<()> {
        let mut entity_mut = self
            .world
            .get_entity_mut(entity)
            .context("avatar entity missing")?;
        entity_mut.insert((at, PendingMove::default()));
        Ok(())
    }

    /// Current position of an avatar.
    pub fn position(&self, entity: Entity) -> Option<Position> {
        self.world.get::<Position>(entity).copied()
    }

    /// Every avatar on this layer.
    pub fn avatars(&mut self) -> Vec<(PeerId, Position)> {
        let mut query = self.world.query::<(&Avatar, &Position)>();
        let mut out: Vec<(PeerId, Position)> = query
            .iter(&self.world)
            .map(|(avatar, pos)| (avatar.owner, *pos))
            .collect();
        out.sort_by_key(|(owner, _)| *owner);
        out
    }
}

/// Ordered collection of independent layers.
pub struct Terrain {
    layers: Vec<TerrainLayer>,
}

impl Terrain {
    /// Generate `specs.len()` layers from one match seed.
    pub fn generate(specs: &[LayerSpec], match_seed: u64) -> Result<Self> {
        if specs.is_empty() {
            bail!("terrain needs at least one layer");
        }
        if specs.len() > usize::from(LayerId::MAX) + 1 {
            bail!("too many terrain layers: {}", specs.len());
        }
        let layers = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| TerrainLayer::generate(i as LayerId, spec, match_seed))
            .collect();
        Ok(Self { layers })
    }

    /// Build from prepared layers.
    pub fn from_layers(layers: Vec<TerrainLayer>) -> Self {
        Self { layers }
    }

    /// Advance every layer, in order.
    pub fn advance(&mut self, tick: SimTick) {
        for layer in &mut self.layers {
            layer.advance(tick);
        }
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True when there are no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer by index.
    pub fn layer(&self, id: LayerId) -> Option<&TerrainLayer> {
        self.layers.get(usize::from(id))
    }

    /// Mutable layer by index.
    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut TerrainLayer> {
        self.layers.get_mut(usize::from(id))
    }

    /// Mutable layer by index, or an error naming the bad index.
    pub fn require_mut(&mut self, id: LayerId) -> Result<&mut TerrainLayer> {
        let count = self.layers.len();
        self.layers
            .get_mut(usize::from(id))
            .with_context(|| format!("layer {id} does not exist ({count} layers)"))
    }

    /// Iterate layers in order.
    pub fn layers(&self) -> impl Iterator<Item = &TerrainLayer> {
        self.layers.iter()
    }
}

fn layer_hash(id: LayerId) -> u64 {
    u64::from(id).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> LayerSpec {
        LayerSpec {
            width: 16,
            height: 12,
            substeps: 1,
            ..LayerSpec::default()
        }
    }

    #[test]
    fn generation_is_deterministic_per_seed_and_layer() {
        let a = TerrainLayer::generate(0, &small(), 42);
        let b = TerrainLayer::generate(0, &small(), 42);
        let c = TerrainLayer::generate(1, &small(), 42);
        assert_eq!(a.grid(), b.grid());
        assert_ne!(a.grid(), c.grid());
    }

    #[test]
    fn border_is_walled_and_spawn_is_walkable() {
        let layer = TerrainLayer::generate(0, &small(), 7);
        let grid = layer.grid();
        assert!(!grid.is_walkable(0, 5));
        assert!(!grid.is_walkable(15, 5));
        let spawn = layer.spawn_point().unwrap();
        assert!(grid.is_walkable(spawn.x, spawn.y));
    }

    #[test]
    fn avatar_moves_once_per_substep() {
        let grid = TileGrid::filled(10, 10, Tile::FLOOR);
        let mut layer = TerrainLayer::from_grid(0, grid, 2);
        let entity = layer.spawn_avatar(PeerId(1), Position { x: 2, y: 2 });
        layer.push_move(entity, 3, 0, 8).unwrap();

        layer.advance(SimTick(0));
        assert_eq!(layer.position(entity), Some(Position { x: 4, y: 2 }));
        layer.advance(SimTick(1));
        assert_eq!(layer.position(entity), Some(Position { x: 5, y: 2 }));
    }

    #[test]
    fn layers_advance_independently() {
        let specs = vec![small(), small()];
        let mut terrain = Terrain::generate(&specs, 3).unwrap();
        let l0 = terrain.layer_mut(0).unwrap();
        let spawn = l0.spawn_point().unwrap();
        l0.spawn_avatar(PeerId(1), spawn);

        terrain.advance(SimTick(0));
        assert_eq!(terrain.layer_mut(0).unwrap().avatars().len(), 1);
        assert!(terrain.layer_mut(1).unwrap().avatars().is_empty());
    }

    #[test]
    fn empty_terrain_is_rejected() {
        assert!(Terrain::generate(&[], 1).is_err());
        assert!(Terrain::generate(&[small()], 1).unwrap().require_mut(3).is_err());
    }
}

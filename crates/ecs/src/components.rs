//! Components and resources stored in each layer world.

use bevy_ecs::component::Component;
use bevy_ecs::system::Resource;
use serde::{Deserialize, Serialize};
use skirmish_core::{PeerId, SimTick};

/// Tile coordinate of an entity inside its layer.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

/// Movement still to be walked, one tile per axis per substep.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingMove {
    /// Remaining columns.
    pub dx: i32,
    /// Remaining rows.
    pub dy: i32,
}

impl PendingMove {
    /// True when nothing is left to walk.
    pub fn is_idle(&self) -> bool {
        self.dx == 0 && self.dy == 0
    }
}

/// Marks the entity controlled by a session.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Avatar {
    /// Owning session.
    pub owner: PeerId,
}

/// Tick and substep currently being simulated.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct SubstepClock {
    /// Simulation tick.
    pub tick: SimTick,
    /// Substep index within the tick.
    pub substep: u32,
}

/// Tile kind stored in a [`TileGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile(pub u16);

impl Tile {
    /// Walkable ground.
    pub const FLOOR: Self = Self(0);
    /// Solid wall.
    pub const WALL: Self = Self(1);
    /// Shallow water; walkable.
    pub const WATER: Self = Self(2);

    /// Whether entities may stand on this tile.
    pub fn is_walkable(self) -> bool {
        self != Self::WALL
    }
}

/// Row-major tile grid owned by one layer.
#[derive(Resource, Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    width: u16,
    height: u16,
    tiles: Vec<Tile>,
}

impl TileGrid {
    /// Grid of `width` x `height` tiles all set to `tile`.
    pub fn filled(width: u16, height: u16, tile: Tile) -> Self {
        Self {
            width,
            height,
            tiles: vec![tile; usize::from(width) * usize::from(height)],
        }
    }

    /// Grid width in tiles.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Grid height in tiles.
    pub fn height(&self) -> u16 {
        self.height
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= i32::from(self.width) || y >= i32::from(self.height) {
            return None;
        }
        Some(y as usize * usize::from(self.width) + x as usize)
    }

    /// Tile at `(x, y)`, or `None` outside the grid.
    pub fn get(&self, x: i32, y: i32) -> Option<Tile> {
        self.index(x, y).map(|i| self.tiles[i])
    }

    /// Overwrite the tile at `(x, y)`. Returns false when out of bounds.
    pub fn set(&mut self, x: i32, y: i32, tile: Tile) -> bool {
        match self.index(x, y) {
            Some(i) => {
                self.tiles[i] = tile;
                true
            }
            None => false,
        }
    }

    /// Out-of-bounds tiles count as walls.
    pub fn is_walkable(&self, x: i32, y: i32) -> bool {
        self.get(x, y).is_some_and(Tile::is_walkable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_is_not_walkable() {
        let grid = TileGrid::filled(4, 3, Tile::FLOOR);
        assert!(grid.is_walkable(0, 0));
        assert!(grid.is_walkable(3, 2));
        assert!(!grid.is_walkable(4, 0));
        assert!(!grid.is_walkable(-1, 1));
        assert!(!grid.is_walkable(0, 3));
    }

    #[test]
    fn set_rejects_out_of_bounds() {
        let mut grid = TileGrid::filled(2, 2, Tile::FLOOR);
        assert!(grid.set(1, 1, Tile::WATER));
        assert!(!grid.set(2, 0, Tile::WALL));
        assert_eq!(grid.get(1, 1), Some(Tile::WATER));
        assert!(grid.is_walkable(1, 1));
    }
}

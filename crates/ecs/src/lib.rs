#![warn(missing_docs)]
//! ECS schedule helpers wrapping `bevy_ecs` for deterministic per-layer substeps.

mod components;

pub use components::{Avatar, PendingMove, Position, SubstepClock, Tile, TileGrid};

use bevy_ecs::schedule::{Schedule, ScheduleLabel, Schedules};
use bevy_ecs::system::{Query, Res};
use bevy_ecs::world::World;
use skirmish_core::SimTick;

/// Label for the schedule every terrain layer runs once per substep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ScheduleLabel)]
pub struct LayerSchedule;

/// Build the baseline layer schedule with the movement system installed.
pub fn build_layer_schedule() -> Schedules {
    let mut schedules = Schedules::default();
    let mut schedule = Schedule::new(LayerSchedule);
    schedule.set_apply_final_deferred(true);
    schedule.add_systems(apply_pending_moves);
    schedules.insert(schedule);
    schedules
}

/// Run the layer schedule for one substep of `tick`.
pub fn run_substep(world: &mut World, schedules: &mut Schedules, tick: SimTick, substep: u32) {
    tracing::trace!(tick = tick.0, substep, "running layer schedule");
    world.insert_resource(SubstepClock { tick, substep });
    if let Some(schedule) = schedules.get_mut(LayerSchedule) {
        schedule.run(world);
    }
}

/// Walk every entity with a pending move one tile per axis towards its target.
///
/// An axis that runs into an unwalkable tile, or off the coordinate range,
/// drops the rest of its movement.
fn apply_pending_moves(grid: Res<TileGrid>, mut movers: Query<(&mut Position, &mut PendingMove)>) {
    for (mut pos, mut pending) in &mut movers {
        if pending.dx != 0 {
            let step = pending.dx.signum();
            match pos.x.checked_add(step).filter(|&x| grid.is_walkable(x, pos.y)) {
                Some(x) => {
                    pos.x = x;
                    pending.dx -= step;
                }
                None => pending.dx = 0,
            }
        }
        if pending.dy != 0 {
            let step = pending.dy.signum();
            match pos.y.checked_add(step).filter(|&y| grid.is_walkable(pos.x, y)) {
                Some(y) => {
                    pos.y = y;
                    pending.dy -= step;
                }
                None => pending.dy = 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skirmish_core::PeerId;

    fn open_world(width: u16, height: u16) -> World {
        let mut world = World::default();
        world.insert_resource(TileGrid::filled(width, height, Tile::FLOOR));
        world
    }

    #[test]
    fn pending_move_advances_one_tile_per_substep() {
        let mut world = open_world(32, 32);
        let mut schedules = build_layer_schedule();
        let entity = world
            .spawn((
                Avatar { owner: PeerId(1) },
                Position { x: 10, y: 10 },
                PendingMove { dx: 2, dy: -1 },
            ))
            .id();

        run_substep(&mut world, &mut schedules, SimTick::ZERO, 0);
        assert_eq!(*world.get::<Position>(entity).unwrap(), Position { x: 11, y: 9 });

        run_substep(&mut world, &mut schedules, SimTick::ZERO, 1);
        assert_eq!(*world.get::<Position>(entity).unwrap(), Position { x: 12, y: 9 });
        assert!(world.get::<PendingMove>(entity).unwrap().is_idle());
    }

    #[test]
    fn walls_cancel_the_blocked_axis() {
        let mut world = open_world(8, 8);
        world.resource_mut::<TileGrid>().set(4, 2, Tile::WALL);
        let mut schedules = build_layer_schedule();
        let entity = world
            .spawn((Position { x: 3, y: 2 }, PendingMove { dx: 3, dy: 1 }))
            .id();

        run_substep(&mut world, &mut schedules, SimTick(4), 0);
        assert_eq!(*world.get::<Position>(entity).unwrap(), Position { x: 3, y: 3 });
        assert_eq!(world.get::<PendingMove>(entity).unwrap().dx, 0);
    }

    #[test]
    fn movement_at_the_coordinate_limit_stops() {
        let mut world = open_world(4, 4);
        let mut schedules = build_layer_schedule();
        let entity = world
            .spawn((
                Position { x: i32::MAX, y: i32::MIN },
                PendingMove { dx: 1, dy: -1 },
            ))
            .id();

        run_substep(&mut world, &mut schedules, SimTick::ZERO, 0);
        assert_eq!(
            *world.get::<Position>(entity).unwrap(),
            Position { x: i32::MAX, y: i32::MIN }
        );
        assert!(world.get::<PendingMove>(entity).unwrap().is_idle());
    }

    #[test]
    fn substep_clock_is_published() {
        let mut world = open_world(4, 4);
        let mut schedules = build_layer_schedule();
        run_substep(&mut world, &mut schedules, SimTick(9), 2);
        let clock = world.resource::<SubstepClock>();
        assert_eq!(clock.tick, SimTick(9));
        assert_eq!(clock.substep, 2);
    }
}

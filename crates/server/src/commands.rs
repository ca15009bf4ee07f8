//! Handler tables for the host.
//!
//! Handlers run inside a step, so they only touch [`SharedMatch`] and its outbox.

use crate::shared_match::SharedMatch;
use anyhow::{ensure, Context};
use skirmish_core::PeerId;
use skirmish_ecs::{Position, Tile};
use skirmish_net::protocol::{
    Chat, ChatBroadcast, Leave, Move, PaintTile, Ping, Pong, SwitchLayer, Teleport,
};
use skirmish_net::{CommandStore, DisconnectReason, RegistrationError};
use tracing::{debug, info};

/// Commands any session may send.
pub fn server_store() -> Result<CommandStore<SharedMatch>, RegistrationError> {
    Ok(CommandStore::builder("server")
        .register(handle_move)?
        .register(handle_chat)?
        .register(handle_ping)?
        .register(handle_switch_layer)?
        .register(handle_leave)?
        .build())
}

/// Commands only accepted from the co-located editor session.
pub fn editor_store() -> Result<CommandStore<SharedMatch>, RegistrationError> {
    Ok(CommandStore::builder("editor")
        .register(handle_paint_tile)?
        .register(handle_teleport)?
        .build())
}

fn handle_move(world: &mut SharedMatch, peer: PeerId, cmd: Move) -> anyhow::Result<()> {
    world.queue_move(peer, cmd.dx, cmd.dy)
}

fn handle_chat(world: &mut SharedMatch, peer: PeerId, cmd: Chat) -> anyhow::Result<()> {
    let text = cmd.text.trim();
    ensure!(!text.is_empty(), "empty chat message");
    info!(%peer, text, "Chat");
    world.broadcast_command(&ChatBroadcast {
        from: peer,
        text: text.to_string(),
    })?;
    Ok(())
}

fn handle_ping(world: &mut SharedMatch, peer: PeerId, cmd: Ping) -> anyhow::Result<()> {
    let tick = world.tick();
    world.send_command(
        peer,
        &Pong {
            nonce: cmd.nonce,
            tick,
        },
    )?;
    Ok(())
}

fn handle_switch_layer(
    world: &mut SharedMatch,
    peer: PeerId,
    cmd: SwitchLayer,
) -> anyhow::Result<()> {
    world
        .move_avatar_to_layer(peer, cmd.layer)
        .with_context(|| format!("cannot switch to layer {}", cmd.layer))?;
    Ok(())
}

fn handle_leave(world: &mut SharedMatch, peer: PeerId, cmd: Leave) -> anyhow::Result<()> {
    debug!(%peer, reason = %cmd.reason, "Peer leaving");
    world.request_disconnect(peer, DisconnectReason::Requested(cmd.reason));
    Ok(())
}

fn handle_paint_tile(world: &mut SharedMatch, _peer: PeerId, cmd: PaintTile) -> anyhow::Result<()> {
    world.paint_tile(cmd.layer, cmd.x, cmd.y, Tile(cmd.tile))
}

fn handle_teleport(world: &mut SharedMatch, _peer: PeerId, cmd: Teleport) -> anyhow::Result<()> {
    world.teleport(cmd.peer, cmd.layer, Position { x: cmd.x, y: cmd.y })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_match::{MatchConfig, Outgoing};
    use crate::terrain::{Terrain, TerrainLayer};
    use skirmish_core::SimTick;
    use skirmish_ecs::TileGrid;
    use skirmish_net::protocol::SERVER_BOUND;
    use skirmish_net::{compute_schema_hash, DispatchError, Packet};

    fn world() -> SharedMatch {
        let layers = (0..2)
            .map(|id| TerrainLayer::from_grid(id, TileGrid::filled(10, 10, Tile::FLOOR), 1))
            .collect();
        let mut world =
            SharedMatch::with_terrain(MatchConfig::default(), Terrain::from_layers(layers));
        world.spawn_avatar(PeerId(1), 0).unwrap();
        world
    }

    #[test]
    fn stores_do_not_share_opcodes() {
        let server = server_store().unwrap();
        let editor = editor_store().unwrap();
        assert_eq!(server.len(), 5);
        assert_eq!(editor.len(), 2);
        assert!(server.opcodes().all(|op| !editor.contains(op)));
    }

    #[test]
    fn server_schema_matches_protocol_table() {
        let expected = compute_schema_hash(SERVER_BOUND.iter().copied());
        assert_eq!(server_store().unwrap().schema_hash(), expected);
    }

    #[test]
    fn ping_answers_with_pong() {
        let store = server_store().unwrap();
        let mut world = world();
        let packet = Packet::from_command(&Ping { nonce: 42 }).unwrap();
        store.dispatch(&mut world, PeerId(1), &packet).unwrap();

        let out = world.drain_outbox();
        let [Outgoing::To { peer, packet }] = out.as_slice() else {
            panic!("expected one reply, got {out:?}");
        };
        assert_eq!(*peer, PeerId(1));
        let pong: Pong = skirmish_net::decode_command(&packet.payload).unwrap();
        assert_eq!(pong.nonce, 42);
    }

    #[test]
    fn blank_chat_is_a_handler_failure() {
        let store = server_store().unwrap();
        let mut world = world();
        let packet = Packet::from_command(&Chat { text: "   ".into() }).unwrap();
        let err = store.dispatch(&mut world, PeerId(1), &packet).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerFailure { .. }));
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn editor_commands_are_unknown_to_server_store() {
        let store = server_store().unwrap();
        let mut world = world();
        let packet = Packet::from_command(&PaintTile { layer: 0, x: 1, y: 1, tile: 1 }).unwrap();
        let err = store.dispatch(&mut world, PeerId(1), &packet).unwrap_err();
        assert!(err.is_session_fatal());
    }

    #[test]
    fn editor_paints_and_teleports() {
        let store = editor_store().unwrap();
        let mut world = world();

        let paint = Packet::from_command(&PaintTile {
            layer: 1,
            x: 2,
            y: 3,
            tile: Tile::WALL.0,
        })
        .unwrap();
        store.dispatch(&mut world, PeerId(1), &paint).unwrap();
        assert_eq!(world.terrain().layer(1).unwrap().grid().get(2, 3), Some(Tile::WALL));

        let teleport = Packet::from_command(&Teleport {
            peer: PeerId(1),
            layer: 1,
            x: 4,
            y: 4,
        })
        .unwrap();
        store.dispatch(&mut world, PeerId(1), &teleport).unwrap();
        assert_eq!(world.avatar_position(PeerId(1)), Some((1, Position { x: 4, y: 4 })));
    }

    #[test]
    fn teleport_outside_the_layer_is_rejected_and_stepping_continues() {
        let editor = editor_store().unwrap();
        let server = server_store().unwrap();
        let mut world = world();
        let before = world.avatar_position(PeerId(1));

        let teleport = Packet::from_command(&Teleport {
            peer: PeerId(1),
            layer: 0,
            x: i32::MAX,
            y: 0,
        })
        .unwrap();
        let err = editor.dispatch(&mut world, PeerId(1), &teleport).unwrap_err();
        assert!(matches!(err, DispatchError::HandlerFailure { .. }));
        assert_eq!(world.avatar_position(PeerId(1)), before);

        let nudge = Packet::from_command(&Move { dx: 1, dy: 0 }).unwrap();
        server.dispatch(&mut world, PeerId(1), &nudge).unwrap();
        world.step(&mut ());
        assert_eq!(world.tick(), SimTick(1));
    }

    #[test]
    fn leave_requests_graceful_disconnect() {
        let store = server_store().unwrap();
        let mut world = world();
        let packet = Packet::from_command(&Leave { reason: "bye".into() }).unwrap();
        store.dispatch(&mut world, PeerId(1), &packet).unwrap();
        assert_eq!(
            world.drain_outbox(),
            vec![Outgoing::Disconnect {
                peer: PeerId(1),
                reason: DisconnectReason::Requested("bye".into())
            }]
        );
    }
}

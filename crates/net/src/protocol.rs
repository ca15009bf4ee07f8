//! Command definitions shared by host and client.
//!
//! Opcodes are partitioned so the three stores never overlap:
//! server-bound `0x0001..=0x00FF`, client-bound `0x0100..=0x01FF`,
//! editor-local `0x0200..=0x02FF`.

use crate::channel::ChannelId;
use crate::command::Command;
use crate::packet::{Opcode, PacketFlags};
use serde::{Deserialize, Serialize};
use skirmish_core::{PeerId, SimTick};

/// Maximum length of a chat message (bytes).
pub const MAX_CHAT_LEN: usize = 256;

/// Maximum length of a leave or notice reason (bytes).
pub const MAX_REASON_LEN: usize = 256;

/// Largest per-axis step a single `Move` may request.
pub const MAX_MOVE_STEP: i32 = 16;

/// Maximum entities in one snapshot.
pub const MAX_SNAPSHOT_ENTITIES: usize = 1024;

/// Terrain layer index.
pub type LayerId = u8;

macro_rules! command {
    ($ty:ty, $opcode:expr, $channel:expr, $flags:expr) => {
        impl Command for $ty {
            const OPCODE: Opcode = $opcode;
            const NAME: &'static str = stringify!($ty);
            const CHANNEL: ChannelId = $channel;
            const FLAGS: PacketFlags = $flags;

            fn verify(&self) -> Result<(), &'static str> {
                <$ty>::check(self)
            }
        }
    };
}

// === Server-bound ===

/// Request to move the sender's avatar by a tile offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Horizontal offset.
    pub dx: i32,
    /// Vertical offset.
    pub dy: i32,
}

impl Move {
    fn check(&self) -> Result<(), &'static str> {
        if self.dx.abs() > MAX_MOVE_STEP || self.dy.abs() > MAX_MOVE_STEP {
            return Err("Move step too large");
        }
        Ok(())
    }
}

/// Chat line from a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Message text.
    pub text: String,
}

impl Chat {
    fn check(&self) -> Result<(), &'static str> {
        if self.text.len() > MAX_CHAT_LEN {
            return Err("Chat message too long");
        }
        Ok(())
    }
}

/// Latency check, answered with `Pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Echoed back in `Pong`.
    pub nonce: u32,
}

impl Ping {
    fn check(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// Move the sender's avatar to another terrain layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchLayer {
    /// Target layer.
    pub layer: LayerId,
}

impl SwitchLayer {
    fn check(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// Graceful leave notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    /// Free-form reason.
    pub reason: String,
}

impl Leave {
    fn check(&self) -> Result<(), &'static str> {
        if self.reason.len() > MAX_REASON_LEN {
            return Err("Leave reason too long");
        }
        Ok(())
    }
}

command!(Move, 0x0001, ChannelId::INPUT, PacketFlags::RELIABLE_ORDERED);
command!(Chat, 0x0002, ChannelId::CHAT, PacketFlags::RELIABLE_ORDERED);
command!(Ping, 0x0003, ChannelId::CONTROL, PacketFlags::RELIABLE);
command!(SwitchLayer, 0x0004, ChannelId::INPUT, PacketFlags::RELIABLE_ORDERED);
command!(Leave, 0x0005, ChannelId::CONTROL, PacketFlags::RELIABLE_ORDERED);

// === Client-bound ===

/// First packet a host sends to a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Id the host assigned to the recipient.
    pub peer: PeerId,
    /// Host tick at the time of joining.
    pub tick: SimTick,
    /// Host tick rate.
    pub tick_rate: u32,
    /// Number of terrain layers.
    pub layer_count: u8,
    /// Hash of the host's server-bound command table.
    pub schema_hash: u64,
}

impl Welcome {
    fn check(&self) -> Result<(), &'static str> {
        if self.tick_rate == 0 {
            return Err("Tick rate must be positive");
        }
        Ok(())
    }
}

/// Replicated avatar state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    /// Controlling session.
    pub owner: PeerId,
    /// Layer the avatar stands on.
    pub layer: LayerId,
    /// Tile x.
    pub x: i32,
    /// Tile y.
    pub y: i32,
}

/// Periodic world snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Tick the snapshot describes.
    pub tick: SimTick,
    /// Avatars, ordered by owner.
    pub entities: Vec<EntityState>,
}

impl StateSnapshot {
    fn check(&self) -> Result<(), &'static str> {
        if self.entities.len() > MAX_SNAPSHOT_ENTITIES {
            return Err("Too many snapshot entities");
        }
        Ok(())
    }
}

/// Chat relayed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBroadcast {
    /// Original sender.
    pub from: PeerId,
    /// Message text.
    pub text: String,
}

impl ChatBroadcast {
    fn check(&self) -> Result<(), &'static str> {
        if self.text.len() > MAX_CHAT_LEN {
            return Err("Chat message too long");
        }
        Ok(())
    }
}

/// Reply to `Ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Nonce from the ping.
    pub nonce: u32,
    /// Host tick when the ping was handled.
    pub tick: SimTick,
}

impl Pong {
    fn check(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// Human-readable message from the host (rejections, kick reasons).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Message text.
    pub text: String,
}

impl Notice {
    fn check(&self) -> Result<(), &'static str> {
        if self.text.len() > MAX_REASON_LEN {
            return Err("Notice too long");
        }
        Ok(())
    }
}

command!(Welcome, 0x0100, ChannelId::CONTROL, PacketFlags::RELIABLE_ORDERED);
command!(StateSnapshot, 0x0101, ChannelId::STATE, PacketFlags::UNRELIABLE_SEQUENCED);
command!(ChatBroadcast, 0x0102, ChannelId::CHAT, PacketFlags::RELIABLE_ORDERED);
command!(Pong, 0x0103, ChannelId::CONTROL, PacketFlags::RELIABLE);
command!(Notice, 0x0104, ChannelId::CONTROL, PacketFlags::RELIABLE_ORDERED);

// === Editor-local ===

/// Overwrite one terrain tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaintTile {
    /// Target layer.
    pub layer: LayerId,
    /// Tile x.
    pub x: i32,
    /// Tile y.
    pub y: i32,
    /// New tile id.
    pub tile: u16,
}

impl PaintTile {
    fn check(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// Place an avatar directly, ignoring walkability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teleport {
    /// Avatar owner.
    pub peer: PeerId,
    /// Target layer.
    pub layer: LayerId,
    /// Tile x.
    pub x: i32,
    /// Tile y.
    pub y: i32,
}

impl Teleport {
    fn check(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

command!(PaintTile, 0x0200, ChannelId::EDITOR, PacketFlags::RELIABLE_ORDERED);
command!(Teleport, 0x0201, ChannelId::EDITOR, PacketFlags::RELIABLE_ORDERED);

/// Command names and opcodes of the server-bound table, for schema hashing.
pub const SERVER_BOUND: &[(Opcode, &str)] = &[
    (Move::OPCODE, Move::NAME),
    (Chat::OPCODE, Chat::NAME),
    (Ping::OPCODE, Ping::NAME),
    (SwitchLayer::OPCODE, SwitchLayer::NAME),
    (Leave::OPCODE, Leave::NAME),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::decode_command;
    use crate::packet::Packet;

    #[test]
    fn test_move_uses_opcode_one() {
        let packet = Packet::from_command(&Move { dx: 5, dy: -3 }).unwrap();
        assert_eq!(packet.opcode, 1);
        assert_eq!(packet.channel, ChannelId::INPUT);
        assert_eq!(decode_command::<Move>(&packet.payload).unwrap(), Move { dx: 5, dy: -3 });
    }

    #[test]
    fn test_opcode_partitions() {
        for (opcode, _) in SERVER_BOUND {
            assert!((0x0001..=0x00FF).contains(opcode));
        }
        let client_bound = [
            Welcome::OPCODE,
            StateSnapshot::OPCODE,
            ChatBroadcast::OPCODE,
            Pong::OPCODE,
            Notice::OPCODE,
        ];
        for opcode in client_bound {
            assert!((0x0100..=0x01FF).contains(&opcode));
        }
        for opcode in [PaintTile::OPCODE, Teleport::OPCODE] {
            assert!((0x0200..=0x02FF).contains(&opcode));
        }
    }

    #[test]
    fn test_move_too_large() {
        assert_eq!(Move { dx: MAX_MOVE_STEP + 1, dy: 0 }.verify(), Err("Move step too large"));
        assert!(Move { dx: -MAX_MOVE_STEP, dy: MAX_MOVE_STEP }.verify().is_ok());
    }

    #[test]
    fn test_chat_message_too_long() {
        let msg = Chat {
            text: "x".repeat(MAX_CHAT_LEN + 1),
        };
        assert_eq!(msg.verify().unwrap_err(), "Chat message too long");
    }

    #[test]
    fn test_snapshot_is_unreliable_on_state_channel() {
        let snapshot = StateSnapshot {
            tick: SimTick(3),
            entities: vec![EntityState {
                owner: PeerId(1),
                layer: 0,
                x: 2,
                y: 2,
            }],
        };
        let packet = Packet::from_command(&snapshot).unwrap();
        assert_eq!(packet.channel, ChannelId::STATE);
        assert!(!packet.is_reliable());
    }

    #[test]
    fn test_names_follow_types() {
        assert_eq!(Move::NAME, "Move");
        assert_eq!(Teleport::NAME, "Teleport");
    }
}

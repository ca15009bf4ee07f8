#![warn(missing_docs)]
//! Networked command/session layer shared by host and client.
//!
//! Packets carry typed commands through a [`CommandStore`]. Each peer is reached
//! through a [`SessionBridge`], either a QUIC connection driven by a background
//! [`NetworkDriver`] or an in-process loopback link, and a [`SessionManager`] pumps
//! both kinds into the simulation once per loop iteration.

mod bridge;
mod channel;
mod command;
mod driver;
mod error;
mod packet;
pub mod protocol;
mod session;
mod transport;

pub use bridge::{
    BridgeKind, LinkId, LocalSessionBridge, LoopbackEndpoint, LoopbackEvent, LoopbackHub,
    LoopbackSide, NetworkSessionBridge, SessionBridge,
};
pub use channel::{
    decode_datagram, encode_datagram, ChannelId, ChannelWriter, SequenceCounter, SequenceFilter,
    DATAGRAM_HEADER_LEN,
};
pub use command::{decode_command, Command, CommandStore, CommandStoreBuilder};
pub use driver::{ConnectionId, NetworkDriver, TransportCommand, TransportEvent};
pub use error::{
    CommandError, DispatchError, FrameError, RegistrationError, SendError, SessionError,
};
pub use packet::{
    compute_schema_hash, decode_frame, parse_header, read_frame, FrameHeader, Opcode, Packet,
    PacketFlags, FRAME_HEADER_LEN, MAX_DATAGRAM_PAYLOAD, MAX_FRAME_PAYLOAD, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};
pub use session::{
    ConnectionState, DisconnectReason, PeerInfo, PollStats, SessionConfig, SessionManager,
    SessionObserver, SessionRole,
};
pub use transport::{ClientEndpoint, ServerEndpoint, TransportConfig, ALPN};

pub use skirmish_core::{PeerId, SimTick};

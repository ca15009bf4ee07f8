//! Error taxonomy for framing, command tables and sessions.

use crate::packet::Opcode;
use skirmish_core::PeerId;
use thiserror::Error;

/// Failures while parsing or validating a packet frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the fixed header (or datagram header) needs.
    #[error("frame too short: {actual} bytes (minimum {minimum})")]
    TooShort {
        /// Bytes available.
        actual: usize,
        /// Bytes required.
        minimum: usize,
    },

    /// Peer speaks a different envelope version.
    #[error("protocol version mismatch: got {got}, expected {expected}")]
    VersionMismatch {
        /// Version byte found on the wire.
        got: u8,
        /// Version this build speaks.
        expected: u8,
    },

    /// Flag bits outside the known set.
    #[error("unknown packet flags {0:#04x}")]
    UnknownFlags(u8),

    /// Declared payload length disagrees with the bytes present.
    #[error("declared payload length {declared} does not match {actual} bytes present")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Length actually present.
        actual: usize,
    },

    /// Payload exceeds the limit for its delivery mode.
    #[error("payload of {len} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Payload length.
        len: usize,
        /// Applicable limit.
        limit: usize,
    },
}

/// Failures while building an outgoing packet from a typed command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command type is not part of this store's table.
    #[error("command {name} is not registered in store '{store}'")]
    Unregistered {
        /// Store label.
        store: &'static str,
        /// Command name.
        name: &'static str,
    },

    /// Serialization failed.
    #[error("failed to encode {name}: {reason}")]
    Encode {
        /// Command name.
        name: &'static str,
        /// Serializer diagnostic.
        reason: String,
    },

    /// The encoded packet violates envelope limits.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Registration conflicts, reported while the store is being built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Two command types claim the same opcode.
    #[error("store '{store}': opcode {opcode:#06x} already taken by {existing}, cannot register {attempted}")]
    DuplicateOpcode {
        /// Store label.
        store: &'static str,
        /// Contested opcode.
        opcode: Opcode,
        /// Command already holding the opcode.
        existing: &'static str,
        /// Command that tried to register.
        attempted: &'static str,
    },

    /// The same command type was registered twice.
    #[error("store '{store}': command {name} registered twice")]
    DuplicateType {
        /// Store label.
        store: &'static str,
        /// Command name.
        name: &'static str,
    },
}

/// Failures while dispatching an incoming packet. All are local to one session.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Opcode not present in the store in use.
    #[error("unknown opcode {opcode:#06x} for store '{store}'")]
    UnknownCommand {
        /// Store label.
        store: &'static str,
        /// Offending opcode.
        opcode: Opcode,
    },

    /// Payload could not be decoded into the command type.
    #[error("malformed payload for {name} (opcode {opcode:#06x}): {reason}")]
    MalformedPayload {
        /// Opcode of the packet.
        opcode: Opcode,
        /// Command the opcode maps to.
        name: &'static str,
        /// Decoder diagnostic.
        reason: String,
    },

    /// The handler returned an error or panicked.
    #[error("handler for {name} (opcode {opcode:#06x}) failed: {source}")]
    HandlerFailure {
        /// Opcode of the packet.
        opcode: Opcode,
        /// Command name.
        name: &'static str,
        /// What went wrong inside the handler.
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    /// Whether the offending session should be disconnected.
    ///
    /// Unknown and undecodable packets mean the peer is malformed or speaks another
    /// protocol revision; handler failures are ordinary gameplay rejections.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownCommand { .. } | DispatchError::MalformedPayload { .. }
        )
    }

    /// Opcode of the packet that failed.
    pub fn opcode(&self) -> Opcode {
        match self {
            DispatchError::UnknownCommand { opcode, .. }
            | DispatchError::MalformedPayload { opcode, .. }
            | DispatchError::HandlerFailure { opcode, .. } => *opcode,
        }
    }
}

/// Failures raised by a bridge when asked to send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The bridge has been disconnected.
    #[error("session is closed")]
    Closed,

    /// The transport side of the queue has shut down.
    #[error("transport queue is gone")]
    TransportGone,

    /// The packet violates envelope limits.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Failures surfaced by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No session with this id.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The session exists but is not connected.
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    /// The bridge refused the packet.
    #[error("send to {peer} failed: {source}")]
    Send {
        /// Target session.
        peer: PeerId,
        /// Bridge error.
        #[source]
        source: SendError,
    },
}

//! Packet envelope and frame encoding.
//!
//! Frame format (little endian):
//! `[version: u8][opcode: u16][channel: u8][flags: u8][payload_len: u32][payload]`

use crate::channel::ChannelId;
use crate::error::FrameError;
use bitflags::bitflags;

/// Envelope version carried in every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes mixed into the schema hash.
pub const PROTOCOL_MAGIC: &[u8; 8] = b"SKRM\x00\x01\x00\x00";

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Upper bound on any payload; checked before allocating.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// Largest payload allowed on unreliable channels.
///
/// Leaves room for the frame header, datagram header and QUIC overhead inside a
/// conservative 1200-byte path MTU.
pub const MAX_DATAGRAM_PAYLOAD: usize = 1024;

/// Integer tag identifying a command within a store's table.
pub type Opcode = u16;

bitflags! {
    /// Delivery guarantees requested for a packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// Retransmitted until acknowledged.
        const RELIABLE = 0b0000_0001;
        /// Never delivered out of send order within its channel.
        const ORDERED = 0b0000_0010;
    }
}

impl PacketFlags {
    /// Reliable, in-order delivery.
    pub const RELIABLE_ORDERED: Self = Self::RELIABLE.union(Self::ORDERED);
    /// Unreliable; stale packets are dropped rather than reordered.
    pub const UNRELIABLE_SEQUENCED: Self = Self::ORDERED;

    /// Whether the packet must be retransmitted until delivered.
    pub fn is_reliable(self) -> bool {
        self.contains(Self::RELIABLE)
    }

    /// Whether the packet participates in per-channel ordering.
    pub fn is_ordered(self) -> bool {
        self.contains(Self::ORDERED)
    }
}

/// One command on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command identifier.
    pub opcode: Opcode,
    /// Channel the packet travels on.
    pub channel: ChannelId,
    /// Delivery guarantees.
    pub flags: PacketFlags,
    /// Encoded command body.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Assemble a packet from parts.
    pub fn new(opcode: Opcode, channel: ChannelId, flags: PacketFlags, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            channel,
            flags,
            payload,
        }
    }

    /// Whether the packet uses reliable delivery.
    pub fn is_reliable(&self) -> bool {
        self.flags.is_reliable()
    }

    /// Enforce the size limit for this packet's delivery mode.
    pub fn check_limits(&self) -> Result<(), FrameError> {
        let limit = if self.is_reliable() {
            MAX_FRAME_PAYLOAD
        } else {
            MAX_DATAGRAM_PAYLOAD
        };
        if self.payload.len() > limit {
            return Err(FrameError::TooLarge {
                len: self.payload.len(),
                limit,
            });
        }
        Ok(())
    }

    /// Total encoded size including the header.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Encode into a standalone frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut frame);
        frame
    }

    /// Append the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&self.opcode.to_le_bytes());
        out.push(self.channel.0);
        out.push(self.flags.bits());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }
}

/// Parsed fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Command identifier.
    pub opcode: Opcode,
    /// Channel id.
    pub channel: ChannelId,
    /// Delivery flags.
    pub flags: PacketFlags,
    /// Declared payload length.
    pub payload_len: usize,
}

impl FrameHeader {
    /// Combine the header with its payload bytes.
    pub fn into_packet(self, payload: Vec<u8>) -> Packet {
        Packet::new(self.opcode, self.channel, self.flags, payload)
    }
}

/// Parse and validate the fixed header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader, FrameError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort {
            actual: data.len(),
            minimum: FRAME_HEADER_LEN,
        });
    }

    if data[0] != PROTOCOL_VERSION {
        return Err(FrameError::VersionMismatch {
            got: data[0],
            expected: PROTOCOL_VERSION,
        });
    }

    let opcode = u16::from_le_bytes([data[1], data[2]]);
    let channel = ChannelId(data[3]);
    let flags = PacketFlags::from_bits(data[4]).ok_or(FrameError::UnknownFlags(data[4]))?;
    let payload_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;

    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge {
            len: payload_len,
            limit: MAX_FRAME_PAYLOAD,
        });
    }

    Ok(FrameHeader {
        opcode,
        channel,
        flags,
        payload_len,
    })
}

/// Decode a buffer holding exactly one frame.
pub fn decode_frame(data: &[u8]) -> Result<Packet, FrameError> {
    let header = parse_header(data)?;
    let body = &data[FRAME_HEADER_LEN..];
    if body.len() != header.payload_len {
        return Err(FrameError::LengthMismatch {
            declared: header.payload_len,
            actual: body.len(),
        });
    }
    Ok(header.into_packet(body.to_vec()))
}

/// Decode the first frame of a byte stream.
///
/// Returns `Ok(None)` while the buffer holds only part of a frame, otherwise the
/// packet and the number of bytes it consumed.
pub fn read_frame(data: &[u8]) -> Result<Option<(Packet, usize)>, FrameError> {
    if data.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let header = parse_header(data)?;
    let total = FRAME_HEADER_LEN + header.payload_len;
    if data.len() < total {
        return Ok(None);
    }
    let payload = data[FRAME_HEADER_LEN..total].to_vec();
    Ok(Some((header.into_packet(payload), total)))
}

/// Compute a schema hash over the envelope version and a command table.
///
/// Both ends compare this to reject builds whose opcode tables disagree.
pub fn compute_schema_hash<'a>(commands: impl IntoIterator<Item = (Opcode, &'a str)>) -> u64 {
    let mut entries: Vec<(Opcode, &str)> = commands.into_iter().collect();
    entries.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&[PROTOCOL_VERSION]);
    hasher.update(PROTOCOL_MAGIC);
    for (opcode, name) in entries {
        hasher.update(&opcode.to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
    }

    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::new(
            0x0102,
            ChannelId::CHAT,
            PacketFlags::RELIABLE_ORDERED,
            b"hello".to_vec(),
        )
    }

    #[test]
    fn header_layout_is_stable() {
        let frame = sample().encode();
        assert_eq!(
            &frame[..FRAME_HEADER_LEN],
            &[PROTOCOL_VERSION, 0x02, 0x01, 3, 0b11, 5, 0, 0, 0]
        );
        assert_eq!(&frame[FRAME_HEADER_LEN..], b"hello");
    }

    #[test]
    fn decode_round_trips() {
        let packet = sample();
        assert_eq!(decode_frame(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let mut frame = sample().encode();
        frame[0] = PROTOCOL_VERSION + 1;
        assert_eq!(
            decode_frame(&frame),
            Err(FrameError::VersionMismatch {
                got: PROTOCOL_VERSION + 1,
                expected: PROTOCOL_VERSION
            })
        );
    }

    #[test]
    fn decode_rejects_unknown_flags() {
        let mut frame = sample().encode();
        frame[4] = 0x80;
        assert_eq!(decode_frame(&frame), Err(FrameError::UnknownFlags(0x80)));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let frame = sample().encode();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameError::LengthMismatch { declared: 5, actual: 4 })
        ));
        assert!(matches!(
            decode_frame(&frame[..3]),
            Err(FrameError::TooShort { actual: 3, .. })
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut frame = sample().encode();
        frame[5..9].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            parse_header(&frame),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn read_frame_handles_partial_and_back_to_back_frames() {
        let a = sample();
        let b = Packet::new(7, ChannelId::INPUT, PacketFlags::empty(), vec![1, 2, 3]);
        let mut stream = a.encode();
        stream.extend_from_slice(&b.encode());

        assert_eq!(read_frame(&stream[..4]).unwrap(), None);
        assert_eq!(read_frame(&stream[..a.encoded_len() - 1]).unwrap(), None);

        let (first, used) = read_frame(&stream).unwrap().unwrap();
        assert_eq!(first, a);
        let (second, used_b) = read_frame(&stream[used..]).unwrap().unwrap();
        assert_eq!(second, b);
        assert_eq!(used + used_b, stream.len());
    }

    #[test]
    fn unreliable_payloads_respect_datagram_limit() {
        let ok = Packet::new(
            1,
            ChannelId::STATE,
            PacketFlags::UNRELIABLE_SEQUENCED,
            vec![0; MAX_DATAGRAM_PAYLOAD],
        );
        assert!(ok.check_limits().is_ok());

        let too_big = Packet::new(
            1,
            ChannelId::STATE,
            PacketFlags::UNRELIABLE_SEQUENCED,
            vec![0; MAX_DATAGRAM_PAYLOAD + 1],
        );
        assert!(matches!(too_big.check_limits(), Err(FrameError::TooLarge { .. })));

        let reliable = Packet::new(
            1,
            ChannelId::STATE,
            PacketFlags::RELIABLE_ORDERED,
            vec![0; MAX_DATAGRAM_PAYLOAD + 1],
        );
        assert!(reliable.check_limits().is_ok());
    }

    #[test]
    fn schema_hash_ignores_table_order_but_not_content() {
        let a = compute_schema_hash([(1, "Move"), (2, "Chat")]);
        let b = compute_schema_hash([(2, "Chat"), (1, "Move")]);
        let c = compute_schema_hash([(1, "Move"), (3, "Chat")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, 0);
    }
}

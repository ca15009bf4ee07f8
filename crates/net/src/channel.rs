//! Channel multiplexing for packets over QUIC.
//!
//! Reliable ordered channels each get one long-lived unidirectional stream that carries
//! frames back to back; reliable unordered packets get a fresh stream each. Unreliable
//! packets travel as datagrams with a per-channel sequence number so stale datagrams
//! can be dropped instead of being delivered out of order.

use crate::error::FrameError;
use crate::packet::{parse_header, Packet, FRAME_HEADER_LEN};
use anyhow::{Context, Result};
use quinn::{Connection, RecvStream, SendStream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Numbered channel a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Session control traffic (welcome, notices, leave).
    pub const CONTROL: Self = Self(0);
    /// Player input.
    pub const INPUT: Self = Self(1);
    /// State snapshots.
    pub const STATE: Self = Self(2);
    /// Chat.
    pub const CHAT: Self = Self(3);
    /// Editor-only commands from co-located peers.
    pub const EDITOR: Self = Self(4);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Size of the datagram header: `[channel: u8][seq: u16]`.
pub const DATAGRAM_HEADER_LEN: usize = 3;

/// Prefix an encoded frame with the datagram header.
pub fn encode_datagram(channel: ChannelId, seq: u16, frame: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(DATAGRAM_HEADER_LEN + frame.len());
    datagram.push(channel.0);
    datagram.extend_from_slice(&seq.to_le_bytes());
    datagram.extend_from_slice(frame);
    datagram
}

/// Split a datagram into channel, sequence number and frame bytes.
pub fn decode_datagram(data: &[u8]) -> Result<(ChannelId, u16, &[u8]), FrameError> {
    if data.len() < DATAGRAM_HEADER_LEN {
        return Err(FrameError::TooShort {
            actual: data.len(),
            minimum: DATAGRAM_HEADER_LEN,
        });
    }
    let seq = u16::from_le_bytes([data[1], data[2]]);
    Ok((ChannelId(data[0]), seq, &data[DATAGRAM_HEADER_LEN..]))
}

/// Whether `a` is newer than `b` in wrapping u16 sequence space.
fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Outgoing per-channel sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: HashMap<ChannelId, u16>,
}

impl SequenceCounter {
    /// Take the next sequence number for `channel`.
    pub fn next(&mut self, channel: ChannelId) -> u16 {
        let slot = self.next.entry(channel).or_insert(0);
        let seq = *slot;
        *slot = slot.wrapping_add(1);
        seq
    }
}

/// Drops unreliable datagrams that arrive after a newer one on the same channel.
#[derive(Debug, Default)]
pub struct SequenceFilter {
    latest: HashMap<ChannelId, u16>,
}

impl SequenceFilter {
    /// Returns true if the datagram should be delivered.
    pub fn accept(&mut self, channel: ChannelId, seq: u16) -> bool {
        match self.latest.get_mut(&channel) {
            None => {
                self.latest.insert(channel, seq);
                true
            }
            Some(latest) if seq_newer(seq, *latest) => {
                *latest = seq;
                true
            }
            Some(_) => false,
        }
    }
}

/// Per-connection sending half: owns the long-lived channel streams.
pub struct ChannelWriter {
    connection: Connection,
    streams: HashMap<ChannelId, SendStream>,
    sequences: SequenceCounter,
}

impl ChannelWriter {
    /// Create a writer for the given connection.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            streams: HashMap::new(),
            sequences: SequenceCounter::default(),
        }
    }

    /// Send a packet using the delivery mode its flags request.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        if !packet.is_reliable() {
            return self.send_unreliable(packet);
        }
        if packet.flags.is_ordered() {
            self.send_ordered(packet).await
        } else {
            self.send_unordered(packet).await
        }
    }

    async fn send_ordered(&mut self, packet: &Packet) -> Result<()> {
        let channel = packet.channel;
        if !self.streams.contains_key(&channel) {
            let mut stream = self
                .connection
                .open_uni()
                .await
                .context("Failed to open channel stream")?;
            stream
                .write_all(&[channel.0])
                .await
                .context("Failed to write channel header")?;
            self.streams.insert(channel, stream);
        }

        let frame = packet.encode();
        if let Some(stream) = self.streams.get_mut(&channel) {
            stream
                .write_all(&frame)
                .await
                .context("Failed to write frame")?;
        }

        trace!(%channel, bytes = frame.len(), "sent reliable ordered frame");
        Ok(())
    }

    async fn send_unordered(&mut self, packet: &Packet) -> Result<()> {
        let mut stream = self
            .connection
            .open_uni()
            .await
            .context("Failed to open unidirectional stream")?;
        stream
            .write_all(&[packet.channel.0])
            .await
            .context("Failed to write channel header")?;
        stream
            .write_all(&packet.encode())
            .await
            .context("Failed to write frame")?;
        stream.finish().context("Failed to finish stream")?;

        trace!(channel = %packet.channel, "sent reliable unordered frame");
        Ok(())
    }

    fn send_unreliable(&mut self, packet: &Packet) -> Result<()> {
        packet.check_limits()?;
        let seq = self.sequences.next(packet.channel);
        let datagram = encode_datagram(packet.channel, seq, &packet.encode());
        self.connection
            .send_datagram(datagram.into())
            .context("Failed to send datagram")?;

        trace!(channel = %packet.channel, seq, "sent datagram");
        Ok(())
    }

    /// Finish all open channel streams.
    pub fn finish(&mut self) {
        for (_, mut stream) in self.streams.drain() {
            let _ = stream.finish();
        }
    }
}

/// Read the channel header of a freshly accepted stream.
pub async fn read_stream_channel(recv: &mut RecvStream) -> Result<ChannelId> {
    let mut channel = [0u8; 1];
    recv.read_exact(&mut channel)
        .await
        .context("Failed to read channel header")?;
    Ok(ChannelId(channel[0]))
}

/// Read the next frame from a channel stream.
///
/// Returns `Ok(None)` when the sender finished the stream on a frame boundary.
pub async fn read_stream_frame(recv: &mut RecvStream) -> Result<Option<Packet>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match recv.read_exact(&mut header).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(err) => return Err(err).context("Failed to read frame header"),
    }

    let header = parse_header(&header)?;
    let mut payload = vec![0u8; header.payload_len];
    recv.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok(Some(header.into_packet(payload)))
}

//! Media packet framing.
//!
//! Wire layout: `[type: u8][sequence: u64 BE][sealed payload]`, where the
//! sealed payload is `[12-byte nonce][ciphertext ‖ 16-byte tag]` produced by
//! the secure transport. The 9-byte header is authenticated as associated data.

/// Header length in bytes.
pub const HEADER_LEN: usize = 9;

/// Packet type tags. Distinct one-byte values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Encoded audio frame.
    Audio = 0x01,
    /// XOR redundancy covering one FEC group.
    FecRedundancy = 0x02,
    /// Keepalive ping/pong, used for RTT measurement.
    Keepalive = 0x03,
    /// Opaque encoded video frame.
    Video = 0x04,
    /// Encrypted signaling envelope (not a media packet).
    Signaling = 0x10,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Audio),
            0x02 => Ok(Self::FecRedundancy),
            0x03 => Ok(Self::Keepalive),
            0x04 => Ok(Self::Video),
            0x10 => Ok(Self::Signaling),
            _ => Err(value),
        }
    }
}

/// Media packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaHeader {
    pub packet_type: PacketType,
    /// Stream sequence number. For FEC redundancy packets this is the group start.
    pub sequence: u64,
}

impl MediaHeader {
    pub fn new(packet_type: PacketType, sequence: u64) -> Self {
        Self {
            packet_type,
            sequence,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.packet_type as u8;
        buf[1..].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// Parse a header. Signaling tags are not media and yield `None`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let packet_type = PacketType::try_from(buf[0]).ok()?;
        if packet_type == PacketType::Signaling {
            return None;
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[1..HEADER_LEN]);
        Some(Self {
            packet_type,
            sequence: u64::from_be_bytes(seq),
        })
    }
}

/// A framed media packet borrowing its sealed payload.
#[derive(Debug, Clone, Copy)]
pub struct MediaPacket<'a> {
    pub header: MediaHeader,
    /// Header bytes as received; used as AEAD associated data.
    pub header_bytes: &'a [u8],
    pub sealed: &'a [u8],
}

impl<'a> MediaPacket<'a> {
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        let header = MediaHeader::decode(buf)?;
        Some(Self {
            header,
            header_bytes: &buf[..HEADER_LEN],
            sealed: &buf[HEADER_LEN..],
        })
    }
}

/// Assemble a packet from a header and sealed payload.
pub fn assemble(header: &[u8; HEADER_LEN], sealed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
    out.extend_from_slice(header);
    out.extend_from_slice(sealed);
    out
}

/// Whether raw bytes are a signaling envelope rather than media.
pub fn is_signaling(buf: &[u8]) -> bool {
    buf.first() == Some(&(PacketType::Signaling as u8))
}

/// Per-stream sequence allocator.
#[derive(Debug, Clone)]
pub struct StreamSequencer {
    next: u64,
}

impl StreamSequencer {
    /// Create a sequencer whose first value is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for StreamSequencer {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

//! The in-progress outbound packet and the stream header that wraps it on the
//! wire.
//!
//! Wire layout of one stream packet:
//!
//! ```text
//! [packet_type u8][flags u8][sequence u32 LE][sent_at_usecs u64 LE][payload…]
//! ```
//!
//! In compressed mode the payload is a run of sections, each prefixed with
//! its length as a `u16` (little-endian) and holding one LZ4 block.

use lz4_flex::decompress_size_prepended;

/// Default datagram size budget in bytes.
pub const DEFAULT_MTU: usize = 1450;

/// Bytes taken by the stream header in front of every payload.
pub const STREAM_HEADER_LEN: usize = 1 + 1 + 4 + 8;

/// Bytes taken by the length prefix of a compressed section.
pub const SECTION_PREFIX_LEN: usize = 2;

const FLAG_COLOR: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x02;

/// Format flags locked into a packet when it is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags {
    pub color: bool,
    pub compressed: bool,
}

impl PacketFlags {
    pub fn new(color: bool, compressed: bool) -> Self {
        Self { color, compressed }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.color {
            byte |= FLAG_COLOR;
        }
        if self.compressed {
            byte |= FLAG_COMPRESSED;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            color: byte & FLAG_COLOR != 0,
            compressed: byte & FLAG_COMPRESSED != 0,
        }
    }
}

// ---------------------------------------------------------------------------
// OutboundPacket
// ---------------------------------------------------------------------------

/// One wire unit being filled for a client.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    mtu: usize,
    flags: PacketFlags,
    sequence: u32,
    payload: Vec<u8>,
}

impl OutboundPacket {
    /// An empty packet sized for `mtu`-byte datagrams.
    pub fn new(mtu: usize, flags: PacketFlags, sequence: u32) -> Self {
        Self {
            mtu,
            flags,
            sequence,
            payload: Vec::with_capacity(mtu.saturating_sub(STREAM_HEADER_LEN)),
        }
    }

    /// Start over with new flags and sequence number. Returns the payload the
    /// packet held before.
    pub fn reset(&mut self, flags: PacketFlags, sequence: u32) -> Vec<u8> {
        self.flags = flags;
        self.sequence = sequence;
        std::mem::take(&mut self.payload)
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Accumulated payload, without the stream header.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the packet holds content waiting to be sent.
    pub fn is_waiting(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Wire length including the stream header.
    pub fn len(&self) -> usize {
        STREAM_HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes still free in the datagram.
    pub fn available(&self) -> usize {
        self.mtu.saturating_sub(self.len())
    }

    /// Largest payload an empty packet can carry.
    pub fn capacity(&self) -> usize {
        self.mtu.saturating_sub(STREAM_HEADER_LEN)
    }

    /// Append one finalized segment. Compressed packets get a length prefix
    /// per segment. Returns `false` and leaves the packet untouched if the
    /// segment does not fit.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let prefix = if self.flags.compressed {
            SECTION_PREFIX_LEN
        } else {
            0
        };
        if bytes.len() + prefix > self.available() {
            return false;
        }
        if self.flags.compressed {
            let Ok(len) = u16::try_from(bytes.len()) else {
                return false;
            };
            self.payload.extend_from_slice(&len.to_le_bytes());
        }
        self.payload.extend_from_slice(bytes);
        true
    }

    /// Serialize header and payload for the transport.
    pub fn to_wire(&self, packet_type: u8, sent_at_usecs: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.push(packet_type);
        out.push(self.flags.to_byte());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&sent_at_usecs.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

// ---------------------------------------------------------------------------
// Reading packets back
// ---------------------------------------------------------------------------

/// Decoded stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub flags: PacketFlags,
    pub sequence: u32,
    pub sent_at_usecs: u64,
}

/// Errors from reading a stream packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketDecodeError {
    /// Fewer bytes than a stream header.
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    /// A section length prefix points past the end of the payload.
    #[error("section of {len} bytes overruns payload at offset {offset}")]
    SectionOverrun { offset: usize, len: usize },
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    Lz4(String),
    /// The leading packet type byte is not the one expected.
    #[error("expected packet type {expected:#04x}, found {found:#04x}")]
    UnexpectedType { expected: u8, found: u8 },
    /// A postcard body failed to decode.
    #[error("malformed packet body: {0}")]
    Body(#[from] postcard::Error),
}

/// Split a wire packet into its header and payload.
pub fn parse_packet(bytes: &[u8]) -> Result<(PacketHeader, &[u8]), PacketDecodeError> {
    if bytes.len() < STREAM_HEADER_LEN {
        return Err(PacketDecodeError::TooShort(bytes.len()));
    }
    let mut sequence = [0u8; 4];
    sequence.copy_from_slice(&bytes[2..6]);
    let mut sent_at = [0u8; 8];
    sent_at.copy_from_slice(&bytes[6..14]);
    let header = PacketHeader {
        packet_type: bytes[0],
        flags: PacketFlags::from_byte(bytes[1]),
        sequence: u32::from_le_bytes(sequence),
        sent_at_usecs: u64::from_le_bytes(sent_at),
    };
    Ok((header, &bytes[STREAM_HEADER_LEN..]))
}

/// Recover the encoded segments of a payload, decompressing when `flags` say
/// the packet is compressed.
pub fn read_sections(payload: &[u8], flags: PacketFlags) -> Result<Vec<Vec<u8>>, PacketDecodeError> {
    if !flags.compressed {
        return Ok(vec![payload.to_vec()]);
    }

    let mut sections = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        if offset + SECTION_PREFIX_LEN > payload.len() {
            return Err(PacketDecodeError::SectionOverrun {
                offset,
                len: SECTION_PREFIX_LEN,
            });
        }
        let len = u16::from_le_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += SECTION_PREFIX_LEN;
        let Some(block) = payload.get(offset..offset + len) else {
            return Err(PacketDecodeError::SectionOverrun { offset, len });
        };
        let section =
            decompress_size_prepended(block).map_err(|e| PacketDecodeError::Lz4(e.to_string()))?;
        sections.push(section);
        offset += len;
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_byte_roundtrip() {
        for flags in [
            PacketFlags::new(false, false),
            PacketFlags::new(true, false),
            PacketFlags::new(false, true),
            PacketFlags::new(true, true),
        ] {
            assert_eq!(PacketFlags::from_byte(flags.to_byte()), flags);
        }
    }

    #[test]
    fn test_write_respects_available_space() {
        let mut packet = OutboundPacket::new(STREAM_HEADER_LEN + 10, PacketFlags::default(), 0);
        assert_eq!(packet.available(), 10);
        assert!(packet.write(&[1; 6]));
        assert_eq!(packet.available(), 4);
        assert!(!packet.write(&[2; 5]));
        assert_eq!(packet.payload(), &[1; 6]);
        assert!(packet.write(&[3; 4]));
        assert_eq!(packet.available(), 0);
    }

    #[test]
    fn test_compressed_write_adds_section_prefix() {
        let mut packet = OutboundPacket::new(DEFAULT_MTU, PacketFlags::new(true, true), 0);
        assert!(packet.write(&[9; 3]));
        assert_eq!(packet.payload(), &[3, 0, 9, 9, 9]);
    }

    #[test]
    fn test_reset_returns_previous_payload() {
        let mut packet = OutboundPacket::new(DEFAULT_MTU, PacketFlags::default(), 4);
        packet.write(b"abc");
        let previous = packet.reset(PacketFlags::new(true, false), 5);
        assert_eq!(previous, b"abc");
        assert!(!packet.is_waiting());
        assert_eq!(packet.sequence(), 5);
        assert!(packet.flags().color);
    }

    #[test]
    fn test_wire_header_parses_back() {
        let mut packet = OutboundPacket::new(DEFAULT_MTU, PacketFlags::new(true, false), 77);
        packet.write(b"voxels");
        let wire = packet.to_wire(3, 123_456);
        assert_eq!(wire.len(), packet.len());

        let (header, payload) = parse_packet(&wire).unwrap();
        assert_eq!(header.packet_type, 3);
        assert_eq!(header.sequence, 77);
        assert_eq!(header.sent_at_usecs, 123_456);
        assert!(header.flags.color);
        assert_eq!(payload, b"voxels");
    }

    #[test]
    fn test_short_packet_is_rejected() {
        assert!(matches!(
            parse_packet(&[0; 5]),
            Err(PacketDecodeError::TooShort(5))
        ));
    }

    #[test]
    fn test_read_compressed_sections() {
        let flags = PacketFlags::new(true, true);
        let mut packet = OutboundPacket::new(DEFAULT_MTU, flags, 0);
        let a = lz4_flex::compress_prepend_size(&[1u8; 64]);
        let b = lz4_flex::compress_prepend_size(b"second section");
        assert!(packet.write(&a));
        assert!(packet.write(&b));

        let sections = read_sections(packet.payload(), flags).unwrap();
        assert_eq!(sections, vec![vec![1u8; 64], b"second section".to_vec()]);
    }

    #[test]
    fn test_truncated_section_is_rejected() {
        let flags = PacketFlags::new(false, true);
        let result = read_sections(&[10, 0, 1, 2], flags);
        assert!(matches!(
            result,
            Err(PacketDecodeError::SectionOverrun { offset: 2, len: 10 })
        ));
    }
}

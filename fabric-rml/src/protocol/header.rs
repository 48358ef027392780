use crate::types::{ChannelId, ProcessName, Tag};

/// Size of the wire header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Current header version.
pub const HEADER_VERSION: u8 = 1;

/// Bit position of the message kind inside a 64-bit fabric tag.
const KIND_SHIFT: u32 = 56;

/// Kind of message that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Application payload addressed by tag.
    Data = 0,
    /// Header-only liveness probe.
    Probe = 1,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageKind::Data),
            1 => Some(MessageKind::Probe),
            _ => None,
        }
    }
}

/// Build the 64-bit fabric tag: message kind in the top byte, application tag in the low 32 bits.
pub const fn fabric_tag(kind: MessageKind, tag: Tag) -> u64 {
    ((kind as u64) << KIND_SHIFT) | tag as u64
}

/// 16-byte header prepended to every message.
///
/// ```text
/// [0]      version: u8
/// [1]      kind: u8
/// [2..4]   reserved: u16 (must be 0)
/// [4..8]   src jobid: u32 LE
/// [8..12]  src vpid: u32 LE
/// [12..16] channel: u32 LE (0 = none)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub src: ProcessName,
    pub channel: Option<ChannelId>,
}

impl Header {
    pub fn data(src: ProcessName, channel: Option<ChannelId>) -> Self {
        Self {
            kind: MessageKind::Data,
            src,
            channel,
        }
    }

    pub fn probe(src: ProcessName) -> Self {
        Self {
            kind: MessageKind::Probe,
            src,
            channel: None,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = HEADER_VERSION;
        buf[1] = self.kind as u8;
        // buf[2..4] reserved = 0
        buf[4..8].copy_from_slice(&self.src.jobid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.src.vpid.to_le_bytes());
        let channel = self.channel.map_or(0, |c| c.0);
        buf[12..16].copy_from_slice(&channel.to_le_bytes());
        buf
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `None` if the buffer is short, the version is unknown, or the kind byte is invalid.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || buf[0] != HEADER_VERSION {
            return None;
        }
        let kind = MessageKind::from_u8(buf[1])?;
        let jobid = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let vpid = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let channel = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        Some(Header {
            kind,
            src: ProcessName::new(jobid, vpid),
            channel: (channel != 0).then_some(ChannelId(channel)),
        })
    }

    /// Gather header and payload regions into one contiguous message.
    pub fn frame(&self, regions: &[&[u8]]) -> Vec<u8> {
        let total: usize = regions.iter().map(|r| r.len()).sum();
        let mut out = Vec::with_capacity(HEADER_SIZE + total);
        out.extend_from_slice(&self.encode());
        for r in regions {
            out.extend_from_slice(r);
        }
        out
    }
}

//! The binary "tank" packet family (`GAME_PACKET` frames).
//!
//! Every tank frame starts with a fixed 60 byte header; `CALL_FUNCTION`
//! packets append a variant argument list whose length is recorded at
//! header offset 56. Header bytes the proxy does not interpret are kept
//! as opaque reserved runs and preserved verbatim on rewrite.

use std::io::Cursor;

use binrw::{BinRead, BinWrite, Endian};
use bitflags::bitflags;
use thiserror::Error;

pub const TANK_HEADER_LEN: usize = 60;

pub const PACKET_CALL_FUNCTION: u8 = 1;
pub const PACKET_DISCONNECT: u8 = 26;

bitflags! {
    /// State-flags word at header offset 16. Unknown bits are retained.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TankFlags: u32 {
        const UNKNOWN_0 = 1 << 0;
        const UNKNOWN_1 = 1 << 1;
        const UNKNOWN_2 = 1 << 2;
        const EXTRA_DATA = 1 << 3;
    }
}

#[derive(Debug, Error)]
pub enum TankError {
    #[error("tank frame shorter than the {TANK_HEADER_LEN} byte header")]
    TooShort,
    #[error("tank header encode failed: {0}")]
    Encode(#[from] binrw::Error),
}

#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct TankHeader {
    pub kind: u32,
    pub packet_type: u8,
    pub reserved_a: [u8; 3],
    pub origin_net_id: i32,
    pub target_net_id: i32,
    pub state: u32,
    pub reserved_b: [u8; 4],
    pub info: i32,
    pub reserved_c: [u8; 28],
    pub extra_len: u32,
}

impl Default for TankHeader {
    fn default() -> Self {
        Self {
            kind: crate::packet::MSG_GAME_PACKET,
            packet_type: 0,
            reserved_a: [0; 3],
            origin_net_id: -1,
            target_net_id: 0,
            state: 0,
            reserved_b: [0; 4],
            info: 0,
            reserved_c: [0; 28],
            extra_len: 0,
        }
    }
}

impl TankHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, TankError> {
        if buf.len() < TANK_HEADER_LEN {
            return Err(TankError::TooShort);
        }
        let mut cursor = Cursor::new(buf);
        Ok(Self::read_options(&mut cursor, Endian::Little, ())?)
    }

    pub fn flags(&self) -> TankFlags {
        TankFlags::from_bits_retain(self.state)
    }
}

/// A tank frame as kept on the wire: header, appended extra payload, and
/// whether the original datagram carried a trailing NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TankPacket {
    pub header: TankHeader,
    pub extra: Vec<u8>,
    pub trailing_nul: bool,
}

impl TankPacket {
    /// Parses an already NUL-stripped frame. The extra slice is clamped
    /// to what the buffer actually holds.
    pub fn parse(buf: &[u8], trailing_nul: bool) -> Result<Self, TankError> {
        let header = TankHeader::parse(buf)?;
        let available = buf.len() - TANK_HEADER_LEN;
        let take = (header.extra_len as usize).min(available);
        Ok(Self {
            extra: buf[TANK_HEADER_LEN..TANK_HEADER_LEN + take].to_vec(),
            header,
            trailing_nul,
        })
    }

    /// Re-emits the frame, patching the extra-length field to match the
    /// payload actually appended and restoring the trailing NUL if the
    /// original carried one.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TankError> {
        let mut header = self.header.clone();
        header.extra_len = self.extra.len() as u32;

        let mut out = Vec::with_capacity(TANK_HEADER_LEN + self.extra.len() + 1);
        let mut cursor = Cursor::new(&mut out);
        header.write_options(&mut cursor, Endian::Little, ())?;
        out.extend_from_slice(&self.extra);
        if self.trailing_nul {
            out.push(0);
        }
        Ok(out)
    }
}

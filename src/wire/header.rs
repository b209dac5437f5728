use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, BytesMut};

use crate::util::buf_ext::BufExt;


pub const DECI_VERSION: u8 = 0x41;

pub const BASE_HEADER_LEN: usize = 12;
/// sequence number, fragment info and message type - common to all sub-headers
pub const ULP_HEADER_LEN: usize = 8;
/// offset of the i32 total length inside the base header
pub const LENGTH_OFFSET: usize = 4;

pub const COMMAND_HEADER_LEN: usize = BASE_HEADER_LEN + ULP_HEADER_LEN;
pub const RESPONSE_HEADER_LEN: usize = COMMAND_HEADER_LEN + 8;
pub const NOTIFICATION_HEADER_LEN: usize = COMMAND_HEADER_LEN + 8;


/// Identifies a DECI4 sub-protocol. Every frame carries it in its base header.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolId(pub u32);

impl ProtocolId {
    pub const NETMP: ProtocolId = ProtocolId(0x40001000);
    pub const CTRLP: ProtocolId = ProtocolId(0x0002c000);
    pub const TTYP: ProtocolId = ProtocolId(0x80003000);
    pub const TSMP: ProtocolId = ProtocolId(0x80004000);

    pub fn name(&self) -> Option<&'static str> {
        match *self {
            Self::NETMP => Some("NETMP"),
            Self::CTRLP => Some("CTRLP"),
            Self::TTYP => Some("TTYP"),
            Self::TSMP => Some("TSMP"),
            _ => None,
        }
    }

    /// Protocols with the high bit set are system protocols that any number of clients may
    ///  register. The others are handed out to one client at a time.
    pub fn is_system(&self) -> bool {
        self.0 & 0x80000000 != 0
    }
}

impl Debug for ProtocolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}({})", self.0, self.name().unwrap_or("?"))
    }
}


/// The fragment info of a frame's sub-header
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct FragInfo(pub u16);

impl FragInfo {
    pub const MORE: u16 = 0x8000;
    pub const EARLY: u16 = 0x4000;
    pub const INDEX_MASK: u16 = 0x3fff;

    pub const NONE: FragInfo = FragInfo(0);

    pub fn new(more: bool, early: bool, index: u16) -> FragInfo {
        let mut raw = index & Self::INDEX_MASK;
        if more {
            raw |= Self::MORE;
        }
        if early {
            raw |= Self::EARLY;
        }
        FragInfo(raw)
    }

    pub fn more(&self) -> bool {
        self.0 & Self::MORE != 0
    }

    pub fn early(&self) -> bool {
        self.0 & Self::EARLY != 0
    }

    pub fn index(&self) -> u16 {
        self.0 & Self::INDEX_MASK
    }

    /// a logical response is complete with this fragment
    pub fn is_last(&self) -> bool {
        !self.more() || self.early()
    }
}

impl Debug for FragInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.index())?;
        if self.more() {
            write!(f, "+more")?;
        }
        if self.early() {
            write!(f, "+early")?;
        }
        Ok(())
    }
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeciHeader {
    pub version: u8,
    pub length: i32,
    pub protocol: ProtocolId,
}

impl DeciHeader {
    pub fn new(length: usize, protocol: ProtocolId) -> DeciHeader {
        DeciHeader {
            version: DECI_VERSION,
            length: length as i32,
            protocol,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_bytes(0, 3);
        buf.put_i32_le(self.length);
        buf.put_u32_le(self.protocol.0);
    }

    pub fn try_deser(buf: &mut impl BufExt) -> anyhow::Result<DeciHeader> {
        let version = buf.checked_get_u8()?;
        if version != DECI_VERSION {
            bail!("unsupported DECI version 0x{:02x}", version);
        }
        buf.checked_advance(3)?;
        let length = buf.checked_get_i32_le()?;
        let protocol = ProtocolId(buf.checked_get_u32_le()?);
        Ok(DeciHeader {
            version,
            length,
            protocol,
        })
    }
}


/// The part of the sub-header that commands, responses and notifications share
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UlpHeader {
    pub seq: u16,
    pub frag: FragInfo,
    pub msg_type: i32,
}

impl UlpHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.seq);
        buf.put_u16_le(self.frag.0);
        buf.put_i32_le(self.msg_type);
    }

    pub fn try_deser(buf: &mut impl BufExt) -> anyhow::Result<UlpHeader> {
        let seq = buf.checked_get_u16_le()?;
        let frag = FragInfo(buf.checked_get_u16_le()?);
        let msg_type = buf.checked_get_i32_le()?;
        Ok(UlpHeader {
            seq,
            frag,
            msg_type,
        })
    }
}

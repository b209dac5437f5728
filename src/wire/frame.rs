use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::util::buf_ext::BufExt;
use crate::wire::header::{DeciHeader, FragInfo, ProtocolId, UlpHeader, COMMAND_HEADER_LEN, NOTIFICATION_HEADER_LEN, RESPONSE_HEADER_LEN};


/// CTRLP's recorded-data message is a notification although its type is below 0x80
pub const CTRLP_REC_DATA: i32 = 0x7;

pub fn is_notification(protocol: ProtocolId, msg_type: i32) -> bool {
    msg_type >= 0x80 || (protocol == ProtocolId::CTRLP && msg_type == CTRLP_REC_DATA)
}


/// One complete frame as it was read from the wire, with the headers shared by all frame kinds
///  already parsed
#[derive(Clone)]
pub struct Frame {
    pub header: DeciHeader,
    pub ulp: UlpHeader,
    raw: Bytes,
}

impl Frame {
    pub fn parse(raw: Bytes) -> anyhow::Result<Frame> {
        let mut buf = &raw[..];
        let header = DeciHeader::try_deser(&mut buf)?;
        if header.length < 0 || header.length as usize != raw.len() {
            bail!("frame length field {} does not match actual length {}", header.length, raw.len());
        }
        let ulp = UlpHeader::try_deser(&mut buf)?;
        Ok(Frame {
            header,
            ulp,
            raw,
        })
    }

    pub fn protocol(&self) -> ProtocolId {
        self.header.protocol
    }

    pub fn seq(&self) -> u16 {
        self.ulp.seq
    }

    pub fn frag(&self) -> FragInfo {
        self.ulp.frag
    }

    pub fn msg_type(&self) -> i32 {
        self.ulp.msg_type
    }

    pub fn is_notification(&self) -> bool {
        is_notification(self.protocol(), self.msg_type())
    }

    /// the complete frame including all headers
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// everything after the common command sub-header
    pub fn after_ulp_header(&self) -> Bytes {
        self.raw.slice(COMMAND_HEADER_LEN..)
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame{{{:?} seq={:#06x} frag={:?} type={:#x} len={}}}",
               self.protocol(), self.seq(), self.frag(), self.msg_type(), self.raw.len())
    }
}


#[derive(Clone, Debug)]
pub struct Response {
    pub protocol: ProtocolId,
    pub seq: u16,
    pub frag: FragInfo,
    pub msg_type: i32,
    pub result: i32,
    pub aux_error_code: i32,
    /// payload after the response sub-header
    pub body: Bytes,
}

impl Response {
    pub fn from_frame(frame: &Frame) -> anyhow::Result<Response> {
        let mut buf = frame.after_ulp_header();
        let result = buf.checked_get_i32_le()?;
        let aux_error_code = buf.checked_get_i32_le()?;
        Ok(Response {
            protocol: frame.protocol(),
            seq: frame.seq(),
            frag: frame.frag(),
            msg_type: frame.msg_type(),
            result,
            aux_error_code,
            body: buf,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.result == 0
    }
}


#[derive(Clone, Debug)]
pub struct Notification {
    pub protocol: ProtocolId,
    pub msg_type: i32,
    pub timestamp: u64,
    /// payload after the notification sub-header
    pub body: Bytes,
}

impl Notification {
    pub fn from_frame(frame: &Frame) -> anyhow::Result<Notification> {
        let mut buf = frame.after_ulp_header();
        let timestamp = buf.checked_get_u64_le()?;
        Ok(Notification {
            protocol: frame.protocol(),
            msg_type: frame.msg_type(),
            timestamp,
            body: buf,
        })
    }
}


fn frame_buf(header_len: usize, payload_len: usize, protocol: ProtocolId, ulp: UlpHeader) -> BytesMut {
    let total_len = header_len + payload_len;
    let mut buf = BytesMut::with_capacity(total_len);
    DeciHeader::new(total_len, protocol).ser(&mut buf);
    ulp.ser(&mut buf);
    buf
}

pub fn build_command(protocol: ProtocolId, seq: u16, msg_type: i32, payload: &[u8]) -> Bytes {
    let mut buf = frame_buf(COMMAND_HEADER_LEN, payload.len(), protocol, UlpHeader { seq, frag: FragInfo::NONE, msg_type });
    buf.put_slice(payload);
    buf.freeze()
}

pub fn build_response(protocol: ProtocolId, seq: u16, frag: FragInfo, msg_type: i32, result: i32, aux_error_code: i32, payload: &[u8]) -> Bytes {
    let mut buf = frame_buf(RESPONSE_HEADER_LEN, payload.len(), protocol, UlpHeader { seq, frag, msg_type });
    buf.put_i32_le(result);
    buf.put_i32_le(aux_error_code);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn build_notification(protocol: ProtocolId, msg_type: i32, timestamp: u64, payload: &[u8]) -> Bytes {
    let mut buf = frame_buf(NOTIFICATION_HEADER_LEN, payload.len(), protocol, UlpHeader { seq: 0, frag: FragInfo::NONE, msg_type });
    buf.put_u64_le(timestamp);
    buf.put_slice(payload);
    buf.freeze()
}

/// Reads the sequence number embedded in an encoded frame
pub fn sequence_of(raw: &[u8]) -> Option<u16> {
    let bytes = raw.get(COMMAND_HEADER_LEN - 8..COMMAND_HEADER_LEN - 6)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

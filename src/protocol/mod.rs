//! Message catalogs for the DECI4 sub-protocols. Each protocol has a command enum that knows its
//!  message type, the response type it expects and how to write its payload, plus parse functions
//!  for the typed content of the responses and notifications.

use bytes::{Bytes, BytesMut};

use crate::error::DeciError;
use crate::wire::frame::{build_command, Frame, Response};
use crate::wire::header::ProtocolId;
use crate::wire::record::{decode, encode_into, Field, Record, RecordDef};

pub mod ctrlp;
pub mod netmp;
pub mod tsmp;
pub mod ttyp;


pub trait DeciCommand {
    const PROTOCOL: ProtocolId;

    fn msg_type(&self) -> i32;

    /// the message type of the matching response
    fn response_type(&self) -> i32;

    fn ser_payload(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Encodes the complete frame: base header, command sub-header with the given sequence
    ///  number, payload
    fn build_frame(&self, seq: u16) -> anyhow::Result<Bytes> {
        let mut payload = BytesMut::new();
        self.ser_payload(&mut payload)?;
        Ok(build_command(Self::PROTOCOL, seq, self.msg_type(), &payload))
    }
}


/// Checks that a frame is the response that was asked for and parses its sub-header.
///
/// When the device refuses to route a sub-protocol command, NETMP answers on its behalf; that is
///  reported as [DeciError::Rejected] rather than as a mismatch.
pub fn expect_response(frame: &Frame, protocol: ProtocolId, response_type: i32) -> anyhow::Result<Response> {
    if frame.protocol() != protocol && frame.protocol() == ProtocolId::NETMP {
        let response = Response::from_frame(frame)?;
        return Err(DeciError::Rejected {
            msg_type: response.msg_type,
            result: response.result,
        }.into());
    }
    if frame.protocol() != protocol || frame.msg_type() != response_type {
        return Err(DeciError::ProtocolMismatch {
            actual_protocol: frame.protocol(),
            actual_msg_type: frame.msg_type(),
            expected_protocol: protocol,
            expected_msg_type: response_type,
        }.into());
    }
    Response::from_frame(frame)
}

/// Turns a non-zero result code into [DeciError::CommandFailed]
pub fn check_result(response: Response) -> anyhow::Result<Response> {
    if response.is_ok() {
        return Ok(response);
    }
    Err(DeciError::CommandFailed {
        protocol: response.protocol,
        msg_type: response.msg_type,
        result: response.result,
        aux_error_code: response.aux_error_code,
    }.into())
}


pub const COMMON_CONFIG: RecordDef = &[
    Field::i32("payload_length"),
    Field::i32("feature_number"),
    Field::i32("min_feature_number"),
    Field::i32("max_size_to_host"),
    Field::i32("max_size_to_target"),
    Field::i32("flags"),
];

/// appended to the common configuration by the protocols that have an input buffer
pub const IN_BUF_SIZE: RecordDef = &[
    Field::i32("in_buf_size"),
];

/// What a protocol's GET_CONF returns
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ProtocolConf {
    pub payload_length: i32,
    pub feature_number: i32,
    pub min_feature_number: i32,
    pub max_size_to_host: i32,
    pub max_size_to_target: i32,
    pub flags: i32,
    pub in_buf_size: Option<i32>,
}

impl ProtocolConf {
    pub fn parse(response: &Response, with_in_buf_size: bool) -> anyhow::Result<ProtocolConf> {
        let mut body = response.body.clone();
        let common = decode(COMMON_CONFIG, &mut body)?;
        let in_buf_size = if with_in_buf_size {
            Some(decode(IN_BUF_SIZE, &mut body)?.i32("in_buf_size")?)
        }
        else {
            None
        };

        Ok(ProtocolConf {
            payload_length: common.i32("payload_length")?,
            feature_number: common.i32("feature_number")?,
            min_feature_number: common.i32("min_feature_number")?,
            max_size_to_host: common.i32("max_size_to_host")?,
            max_size_to_target: common.i32("max_size_to_target")?,
            flags: common.i32("flags")?,
            in_buf_size,
        })
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new()
            .with("payload_length", self.payload_length)
            .with("feature_number", self.feature_number)
            .with("min_feature_number", self.min_feature_number)
            .with("max_size_to_host", self.max_size_to_host)
            .with("max_size_to_target", self.max_size_to_target)
            .with("flags", self.flags);
        if let Some(in_buf_size) = self.in_buf_size {
            record.set("in_buf_size", in_buf_size);
        }
        record
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let record = self.to_record();
        encode_into(COMMON_CONFIG, &record, buf)?;
        if self.in_buf_size.is_some() {
            encode_into(IN_BUF_SIZE, &record, buf)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use crate::wire::frame::{build_response, Frame};
    use crate::wire::header::FragInfo;
    use super::*;

    fn frame(protocol: ProtocolId, msg_type: i32, result: i32) -> Frame {
        Frame::parse(build_response(protocol, 1, FragInfo::NONE, msg_type, result, 0, b"")).unwrap()
    }

    #[test]
    fn test_expect_response_ok() {
        let response = expect_response(&frame(ProtocolId::TSMP, 7, 0), ProtocolId::TSMP, 7).unwrap();
        assert_eq!(response.msg_type, 7);
    }

    #[rstest]
    #[case::wrong_type(ProtocolId::TSMP, 5)]
    #[case::wrong_protocol(ProtocolId::TTYP, 7)]
    fn test_expect_response_mismatch(#[case] protocol: ProtocolId, #[case] msg_type: i32) {
        let err = expect_response(&frame(protocol, msg_type, 0), ProtocolId::TSMP, 7).unwrap_err();
        assert_eq!(DeciError::of(&err), Some(&DeciError::ProtocolMismatch {
            actual_protocol: protocol,
            actual_msg_type: msg_type,
            expected_protocol: ProtocolId::TSMP,
            expected_msg_type: 7,
        }));
    }

    #[test]
    fn test_expect_response_netmp_rejection() {
        let err = expect_response(&frame(ProtocolId::NETMP, 0xe2, 0x1002), ProtocolId::CTRLP, 0xd).unwrap_err();
        assert_eq!(DeciError::of(&err), Some(&DeciError::Rejected { msg_type: 0xe2, result: 0x1002 }));
    }

    #[test]
    fn test_check_result() {
        let ok = expect_response(&frame(ProtocolId::CTRLP, 0xd, 0), ProtocolId::CTRLP, 0xd).unwrap();
        assert!(check_result(ok).is_ok());

        let failed = expect_response(&frame(ProtocolId::CTRLP, 0xd, 1), ProtocolId::CTRLP, 0xd).unwrap();
        let err = check_result(failed).unwrap_err();
        assert!(matches!(DeciError::of(&err), Some(DeciError::CommandFailed { result: 1, .. })));
    }

    #[rstest]
    #[case::common(None)]
    #[case::with_in_buf_size(Some(4096))]
    fn test_protocol_conf(#[case] in_buf_size: Option<i32>) {
        let conf = ProtocolConf {
            payload_length: 24,
            feature_number: 3,
            min_feature_number: 1,
            max_size_to_host: 65536,
            max_size_to_target: 8192,
            flags: 0,
            in_buf_size,
        };
        let mut payload = BytesMut::new();
        conf.ser(&mut payload).unwrap();
        let raw = build_response(ProtocolId::TTYP, 1, FragInfo::NONE, 1, 0, 0, &payload);
        let response = Response::from_frame(&Frame::parse(raw).unwrap()).unwrap();

        assert_eq!(ProtocolConf::parse(&response, in_buf_size.is_some()).unwrap(), conf);
    }
}

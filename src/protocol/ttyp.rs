use std::fmt::{Display, Formatter};

use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::DeciCommand;
use crate::wire::frame::{Notification, Response};
use crate::wire::header::ProtocolId;
use crate::wire::record::{decode, decode_list, Field, Record, RecordDef};


#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum TtypMsgType {
    GetConfCmd = 0x0,
    GetConfRes = 0x1,
    TtyInCmd = 0x2,
    TtyInRes = 0x3,
    GetPortStatesCmd = 0x4,
    GetPortStatesRes = 0x5,
    SetPortStatesCmd = 0x7,
    SetPortStatesRes = 0x8,
    TtyOutNotification = 0x80,
    InBuffReadyNotification = 0x81,
    InCloseNotification = 0x82,
    FatalHeadNotification = 0xe0,
    InvalHeadNotification = 0xe1,
    InvalProtoNotification = 0xe2,
}

pub const TTY_OUT: RecordDef = &[
    Field::u32("port"),
    Field::u32("category"),
    Field::u32("pid"),
    Field::u32("tid"),
    Field::tty_stream("message"),
];

pub const PORT_STATE: RecordDef = &[
    Field::u32("size"),
    Field::u32("port"),
    Field::u32("mask"),
    Field::u32("state"),
];


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtypCommand {
    GetConf,
    GetPortStates,
}

impl TtypCommand {
    fn types(&self) -> (TtypMsgType, TtypMsgType) {
        match self {
            TtypCommand::GetConf => (TtypMsgType::GetConfCmd, TtypMsgType::GetConfRes),
            TtypCommand::GetPortStates => (TtypMsgType::GetPortStatesCmd, TtypMsgType::GetPortStatesRes),
        }
    }
}

impl DeciCommand for TtypCommand {
    const PROTOCOL: ProtocolId = ProtocolId::TTYP;

    fn msg_type(&self) -> i32 {
        self.types().0.into()
    }

    fn response_type(&self) -> i32 {
        self.types().1.into()
    }

    fn ser_payload(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortState {
    pub port: u32,
    pub mask: u32,
    pub state: u32,
}

impl PortState {
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("size", PORT_STATE_LEN as u32)
            .with("port", self.port)
            .with("mask", self.mask)
            .with("state", self.state)
    }
}

pub const PORT_STATE_LEN: usize = 16;

pub fn parse_port_states(response: &Response) -> anyhow::Result<Vec<PortState>> {
    decode_list(PORT_STATE, &mut response.body.clone())?
        .into_iter()
        .map(|r| Ok(PortState {
            port: r.u32("port")?,
            mask: r.u32("mask")?,
            state: r.u32("state")?,
        }))
        .collect()
}


/// One chunk of console output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyOutput {
    pub port: u32,
    pub category: u32,
    pub pid: u32,
    pub tid: u32,
    pub message: String,
}

impl TtyOutput {
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("port", self.port)
            .with("category", self.category)
            .with("pid", self.pid)
            .with("tid", self.tid)
            .with("message", self.message.as_str())
    }
}

impl Display for TtyOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{:x}:{:x}:{}", self.port, self.category, self.tid, self.pid, self.message)
    }
}

/// Everything that arrives unsolicited on a TTYP stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtyEvent {
    Output(TtyOutput),
    /// the device's TTY input buffer accepts data again
    InBuffReady,
    InClose,
    /// the device could not make sense of something this client sent
    HeaderError(TtypMsgType),
    Other(i32),
}

pub fn parse_notification(notification: &Notification) -> anyhow::Result<TtyEvent> {
    let event = match TtypMsgType::try_from(notification.msg_type) {
        Ok(TtypMsgType::TtyOutNotification) => {
            let r = decode(TTY_OUT, &mut notification.body.clone())?;
            TtyEvent::Output(TtyOutput {
                port: r.u32("port")?,
                category: r.u32("category")?,
                pid: r.u32("pid")?,
                tid: r.u32("tid")?,
                message: r.str("message")?.to_string(),
            })
        }
        Ok(TtypMsgType::InBuffReadyNotification) => TtyEvent::InBuffReady,
        Ok(TtypMsgType::InCloseNotification) => TtyEvent::InClose,
        Ok(t @ (TtypMsgType::FatalHeadNotification | TtypMsgType::InvalHeadNotification | TtypMsgType::InvalProtoNotification)) => TtyEvent::HeaderError(t),
        _ => TtyEvent::Other(notification.msg_type),
    };
    Ok(event)
}


#[cfg(test)]
mod test {
    use bytes::BufMut;
    use rstest::rstest;
    use crate::wire::frame::{build_notification, build_response, Frame};
    use crate::wire::header::FragInfo;
    use crate::wire::record::encode_into;
    use super::*;

    fn notification(msg_type: i32, payload: &[u8]) -> Notification {
        Notification::from_frame(&Frame::parse(build_notification(ProtocolId::TTYP, msg_type, 0, payload)).unwrap()).unwrap()
    }

    #[test]
    fn test_tty_out() {
        let output = TtyOutput { port: 1, category: 2, pid: 0x3e, tid: 0xab, message: "hello world\n".to_string() };
        let mut payload = BytesMut::new();
        encode_into(TTY_OUT, &output.to_record(), &mut payload).unwrap();

        let event = parse_notification(&notification(0x80, &payload)).unwrap();
        assert_eq!(event, TtyEvent::Output(output.clone()));
        assert_eq!(output.to_string(), "1:2:ab:3e:hello world\n");
    }

    #[test]
    fn test_tty_out_invalid_utf8_is_lossy() {
        let payload = b"\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x03\0\0\0a\xffb\0";
        match parse_notification(&notification(0x80, payload)).unwrap() {
            TtyEvent::Output(output) => assert_eq!(output.message, "a\u{fffd}b"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[rstest]
    #[case::ready(0x81, TtyEvent::InBuffReady)]
    #[case::close(0x82, TtyEvent::InClose)]
    #[case::fatal(0xe0, TtyEvent::HeaderError(TtypMsgType::FatalHeadNotification))]
    #[case::invalid_proto(0xe2, TtyEvent::HeaderError(TtypMsgType::InvalProtoNotification))]
    #[case::unknown(0x99, TtyEvent::Other(0x99))]
    fn test_other_notifications(#[case] msg_type: i32, #[case] expected: TtyEvent) {
        assert_eq!(parse_notification(&notification(msg_type, b"")).unwrap(), expected);
    }

    #[test]
    fn test_port_states() {
        let states = vec![
            PortState { port: 0, mask: 0xff, state: 1 },
            PortState { port: 3, mask: 0x0f, state: 0 },
        ];
        let mut payload = BytesMut::new();
        for s in &states {
            encode_into(PORT_STATE, &s.to_record(), &mut payload).unwrap();
        }
        payload.put_i32_le(0);

        let raw = build_response(ProtocolId::TTYP, 1, FragInfo::NONE, 5, 0, 0, &payload);
        let response = Response::from_frame(&Frame::parse(raw).unwrap()).unwrap();
        assert_eq!(parse_port_states(&response).unwrap(), states);
    }
}

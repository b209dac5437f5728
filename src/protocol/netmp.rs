use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::DeciCommand;
use crate::wire::frame::Response;
use crate::wire::header::ProtocolId;
use crate::wire::record::{decode, decode_list, encode_into, Field, Record, RecordDef};


/// result code of REGISTER when the protocol is held exclusively by another client
pub const ERROR_INUSE: i32 = 0x1006;

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum NetmpMsgType {
    GetConfCmd = 0x0,
    GetConfRes = 0x1,
    ConnectCmd = 0x2,
    ConnectRes = 0x3,
    DisconnectCmd = 0x4,
    DisconnectRes = 0x5,
    RegisterCmd = 0x6,
    RegisterRes = 0x7,
    UnregisterCmd = 0x8,
    UnregisterRes = 0x9,
    ForceDisconnectCmd = 0xa,
    ForceDisconnectRes = 0xb,
    GetRegisteredListCmd = 0xe,
    GetRegisteredListRes = 0xf,
    ForceDisconnectNotification = 0x80,
    InvalProtoNotification = 0xe2,
}

pub const CONNECT_CMD: RecordDef = &[
    Field::string("client_id"),
    Field::zeros(4),
    Field::u16("udpport"),
    Field::zeros(2),
];

pub const CONNECT_RES: RecordDef = &[
    Field::u32("netmp_key"),
];

pub const REGISTER_CMD: RecordDef = &[
    Field::u32("netmp_key"),
    Field::u32("reg_protocol"),
];

pub const UNREGISTER_CMD: RecordDef = &[
    Field::u32("reg_protocol"),
];

pub const REG_INFO: RecordDef = &[
    Field::u32("size"),
    Field::u32("protocol"),
    Field::u32("timestamp"),
    Field::string("owner"),
];


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetmpCommand {
    GetConf,
    Connect { client_id: String, udp_port: u16 },
    Disconnect,
    /// sent on the new stream that is to carry the registered protocol
    Register { netmp_key: u32, protocol: ProtocolId },
    /// sent on the control stream
    Unregister { protocol: ProtocolId },
    ForceDisconnect,
    GetRegisteredList,
}

impl NetmpCommand {
    fn types(&self) -> (NetmpMsgType, NetmpMsgType) {
        match self {
            NetmpCommand::GetConf => (NetmpMsgType::GetConfCmd, NetmpMsgType::GetConfRes),
            NetmpCommand::Connect { .. } => (NetmpMsgType::ConnectCmd, NetmpMsgType::ConnectRes),
            NetmpCommand::Disconnect => (NetmpMsgType::DisconnectCmd, NetmpMsgType::DisconnectRes),
            NetmpCommand::Register { .. } => (NetmpMsgType::RegisterCmd, NetmpMsgType::RegisterRes),
            NetmpCommand::Unregister { .. } => (NetmpMsgType::UnregisterCmd, NetmpMsgType::UnregisterRes),
            NetmpCommand::ForceDisconnect => (NetmpMsgType::ForceDisconnectCmd, NetmpMsgType::ForceDisconnectRes),
            NetmpCommand::GetRegisteredList => (NetmpMsgType::GetRegisteredListCmd, NetmpMsgType::GetRegisteredListRes),
        }
    }
}

impl DeciCommand for NetmpCommand {
    const PROTOCOL: ProtocolId = ProtocolId::NETMP;

    fn msg_type(&self) -> i32 {
        self.types().0.into()
    }

    fn response_type(&self) -> i32 {
        self.types().1.into()
    }

    fn ser_payload(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            NetmpCommand::Connect { client_id, udp_port } => {
                let record = Record::new()
                    .with("client_id", client_id.as_str())
                    .with("udpport", *udp_port);
                encode_into(CONNECT_CMD, &record, buf)
            }
            NetmpCommand::Register { netmp_key, protocol } => {
                let record = Record::new()
                    .with("netmp_key", *netmp_key)
                    .with("reg_protocol", protocol.0);
                encode_into(REGISTER_CMD, &record, buf)
            }
            NetmpCommand::Unregister { protocol } => {
                encode_into(UNREGISTER_CMD, &Record::new().with("reg_protocol", protocol.0), buf)
            }
            NetmpCommand::GetConf
            | NetmpCommand::Disconnect
            | NetmpCommand::ForceDisconnect
            | NetmpCommand::GetRegisteredList => Ok(()),
        }
    }
}


pub fn parse_connect(response: &Response) -> anyhow::Result<u32> {
    decode(CONNECT_RES, &mut response.body.clone())?.u32("netmp_key")
}

/// One entry of the list of currently registered protocols
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegInfo {
    pub protocol: ProtocolId,
    pub timestamp: u32,
    pub owner: String,
}

impl RegInfo {
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("protocol", self.protocol.0)
            .with("timestamp", self.timestamp)
            .with("owner", self.owner.as_str())
    }
}

pub fn parse_registered_list(response: &Response) -> anyhow::Result<Vec<RegInfo>> {
    decode_list(REG_INFO, &mut response.body.clone())?
        .into_iter()
        .map(|r| Ok(RegInfo {
            protocol: ProtocolId(r.u32("protocol")?),
            timestamp: r.u32("timestamp")?,
            owner: r.str("owner")?.to_string(),
        }))
        .collect()
}

/// The client holding the device's exclusive input: the owner of the first registered protocol
///  that is neither a system protocol nor NETMP itself
pub fn owner_of(list: &[RegInfo]) -> Option<&str> {
    list.iter()
        .find(|info| !info.protocol.is_system() && info.protocol != ProtocolId::NETMP)
        .map(|info| info.owner.as_str())
}


#[cfg(test)]
mod test {
    use bytes::BufMut;
    use rstest::rstest;
    use crate::wire::frame::{build_response, Frame};
    use crate::wire::header::FragInfo;
    use crate::wire::record::encoded_len;
    use super::*;

    #[rstest]
    #[case::get_conf(NetmpCommand::GetConf, 0x0, 0x1)]
    #[case::connect(NetmpCommand::Connect { client_id: "a".to_string(), udp_port: 0 }, 0x2, 0x3)]
    #[case::disconnect(NetmpCommand::Disconnect, 0x4, 0x5)]
    #[case::register(NetmpCommand::Register { netmp_key: 1, protocol: ProtocolId::CTRLP }, 0x6, 0x7)]
    #[case::unregister(NetmpCommand::Unregister { protocol: ProtocolId::CTRLP }, 0x8, 0x9)]
    #[case::force_disconnect(NetmpCommand::ForceDisconnect, 0xa, 0xb)]
    #[case::registered_list(NetmpCommand::GetRegisteredList, 0xe, 0xf)]
    fn test_msg_types(#[case] command: NetmpCommand, #[case] msg_type: i32, #[case] response_type: i32) {
        assert_eq!(command.msg_type(), msg_type);
        assert_eq!(command.response_type(), response_type);
    }

    #[test]
    fn test_connect_payload() {
        let command = NetmpCommand::Connect { client_id: "me@10.0.0.2,EXDGDECI4".to_string(), udp_port: 0x1234 };
        let frame = command.build_frame(0x1234).unwrap();
        let payload = &frame[20..];

        // 21 characters plus terminator, padded to 24
        assert_eq!(&payload[..4], b"\x16\0\0\0");
        assert_eq!(&payload[4..25], b"me@10.0.0.2,EXDGDECI4");
        assert_eq!(&payload[25..28], b"\0\0\0");
        assert_eq!(&payload[28..], b"\0\0\0\0\x34\x12\0\0");
    }

    #[test]
    fn test_register_payload() {
        let frame = NetmpCommand::Register { netmp_key: 0xdeadbeef, protocol: ProtocolId::TTYP }.build_frame(1).unwrap();
        assert_eq!(&frame[20..], b"\xef\xbe\xad\xde\x00\x30\x00\x80");

        let frame = NetmpCommand::Unregister { protocol: ProtocolId::TTYP }.build_frame(2).unwrap();
        assert_eq!(&frame[20..], b"\x00\x30\x00\x80");
    }

    fn registered_list_response(entries: &[RegInfo]) -> Response {
        let mut payload = BytesMut::new();
        for entry in entries {
            let mut record = entry.to_record();
            record.set("size", encoded_len(REG_INFO, &record.clone().with("size", 0u32)).unwrap() as u32);
            encode_into(REG_INFO, &record, &mut payload).unwrap();
        }
        payload.put_i32_le(0);
        let raw = build_response(ProtocolId::NETMP, 1, FragInfo::NONE, 0xf, 0, 0, &payload);
        Response::from_frame(&Frame::parse(raw).unwrap()).unwrap()
    }

    fn reg_info(protocol: ProtocolId, owner: &str) -> RegInfo {
        RegInfo { protocol, timestamp: 17, owner: owner.to_string() }
    }

    #[test]
    fn test_registered_list() {
        let entries = vec![
            reg_info(ProtocolId::NETMP, "netmp@host"),
            reg_info(ProtocolId::TTYP, "tty@host"),
            reg_info(ProtocolId::CTRLP, "ctrl@host"),
        ];
        let parsed = parse_registered_list(&registered_list_response(&entries)).unwrap();
        assert_eq!(parsed, entries);
        assert_eq!(owner_of(&parsed), Some("ctrl@host"));
    }

    #[rstest]
    #[case::empty(vec![], None)]
    #[case::only_system(vec![reg_info(ProtocolId::NETMP, "a"), reg_info(ProtocolId::TSMP, "b")], None)]
    #[case::first_exclusive_wins(vec![reg_info(ProtocolId(0x0002d000), "x"), reg_info(ProtocolId::CTRLP, "y")], Some("x"))]
    fn test_owner_of(#[case] list: Vec<RegInfo>, #[case] expected: Option<&str>) {
        assert_eq!(owner_of(&list), expected);
    }

    #[test]
    fn test_parse_connect() {
        let raw = build_response(ProtocolId::NETMP, 1, FragInfo::NONE, 3, 0, 0, b"\x78\x56\x34\x12");
        let response = Response::from_frame(&Frame::parse(raw).unwrap()).unwrap();
        assert_eq!(parse_connect(&response).unwrap(), 0x12345678);
    }

    #[test]
    fn test_msg_type_from_wire() {
        assert_eq!(NetmpMsgType::try_from(0x80).unwrap(), NetmpMsgType::ForceDisconnectNotification);
        assert!(NetmpMsgType::try_from(0x42).is_err());
    }
}

use bytes::{Buf, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::DeciCommand;
use crate::wire::frame::Response;
use crate::wire::header::ProtocolId;
use crate::wire::record::{decode, decode_list, encode_into, Field, Record, RecordDef, Variant};


pub const POWER_OFF: u32 = 0x100;
pub const POWER_REBOOT: u32 = 0x200;

/// PSN state of a user that is signed in
pub const PSN_SIGNED_IN: u32 = 2;

/// every screenshot fragment starts with this many bytes before the image data
pub const PICT_CHUNK_HEADER_LEN: usize = 8;

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum TsmpMsgType {
    GetConfCmd = 0x0,
    GetConfRes = 0x1,
    GetInfoCmd = 0x2,
    GetInfoRes = 0x3,
    PowerControlCmd = 0x4,
    PowerControlRes = 0x5,
    GetPowerStatusCmd = 0x6,
    GetPowerStatusRes = 0x7,
    GetPictCmd = 0x10,
    GetPictRes = 0x11,
    GetPsnStateCmd = 0x20,
    GetPsnStateRes = 0x21,
}

/// Which screen a screenshot is taken from
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PictMode {
    Game = 0,
    System = 1,
    Auto = 2,
}

pub const NAME_VALUE_DISPLAY: RecordDef = &[
    Field::u32("size"),
    Field::string("name"),
    Field::variant("value"),
    Field::u32("format"),
];

pub const POWER_REQUEST: RecordDef = &[
    Field::u32("powerstate"),
];

pub const GET_PSN_STATE_CMD: RecordDef = &[
    Field::string("username"),
];

pub const GET_PSN_STATE_RES: RecordDef = &[
    Field::u32("psn_state"),
];

pub const POWER_STATE: RecordDef = &[
    Field::u32("power_state"),
];

pub const GET_PICT_CMD: RecordDef = &[
    Field::u32("mode"),
];


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsmpCommand {
    GetConf,
    GetInfo,
    PowerControl { power_state: u32 },
    GetPowerStatus,
    GetPsnState { username: String },
    GetPict { mode: PictMode },
}

impl TsmpCommand {
    fn types(&self) -> (TsmpMsgType, TsmpMsgType) {
        match self {
            TsmpCommand::GetConf => (TsmpMsgType::GetConfCmd, TsmpMsgType::GetConfRes),
            TsmpCommand::GetInfo => (TsmpMsgType::GetInfoCmd, TsmpMsgType::GetInfoRes),
            TsmpCommand::PowerControl { .. } => (TsmpMsgType::PowerControlCmd, TsmpMsgType::PowerControlRes),
            TsmpCommand::GetPowerStatus => (TsmpMsgType::GetPowerStatusCmd, TsmpMsgType::GetPowerStatusRes),
            TsmpCommand::GetPsnState { .. } => (TsmpMsgType::GetPsnStateCmd, TsmpMsgType::GetPsnStateRes),
            TsmpCommand::GetPict { .. } => (TsmpMsgType::GetPictCmd, TsmpMsgType::GetPictRes),
        }
    }
}

impl DeciCommand for TsmpCommand {
    const PROTOCOL: ProtocolId = ProtocolId::TSMP;

    fn msg_type(&self) -> i32 {
        self.types().0.into()
    }

    fn response_type(&self) -> i32 {
        self.types().1.into()
    }

    fn ser_payload(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            TsmpCommand::PowerControl { power_state } => {
                encode_into(POWER_REQUEST, &Record::new().with("powerstate", *power_state), buf)
            }
            TsmpCommand::GetPsnState { username } => {
                encode_into(GET_PSN_STATE_CMD, &Record::new().with("username", username.as_str()), buf)
            }
            TsmpCommand::GetPict { mode } => {
                encode_into(GET_PICT_CMD, &Record::new().with("mode", u32::from(*mode)), buf)
            }
            TsmpCommand::GetConf | TsmpCommand::GetInfo | TsmpCommand::GetPowerStatus => Ok(()),
        }
    }
}


/// One named system property as returned by GET_INFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameValue {
    pub name: String,
    pub value: Variant,
    pub format: u32,
}

impl NameValue {
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("name", self.name.as_str())
            .with("value", self.value.clone())
            .with("format", self.format)
    }
}

pub fn parse_info(response: &Response) -> anyhow::Result<Vec<NameValue>> {
    decode_list(NAME_VALUE_DISPLAY, &mut response.body.clone())?
        .into_iter()
        .map(|r| Ok(NameValue {
            name: r.str("name")?.to_string(),
            value: r.variant("value")?.clone(),
            format: r.u32("format")?,
        }))
        .collect()
}

pub fn parse_power_status(response: &Response) -> anyhow::Result<u32> {
    decode(POWER_STATE, &mut response.body.clone())?.u32("power_state")
}

/// The PSN state is only present in a successful response
pub fn parse_psn_state(response: &Response) -> anyhow::Result<Option<u32>> {
    if !response.is_ok() {
        return Ok(None);
    }
    Ok(Some(decode(GET_PSN_STATE_RES, &mut response.body.clone())?.u32("psn_state")?))
}

/// The image data carried by one screenshot fragment, `None` if the fragment has nothing beyond
///  its header
pub fn pict_chunk(response: &Response) -> Option<Bytes> {
    if response.body.len() <= PICT_CHUNK_HEADER_LEN {
        return None;
    }
    let mut body = response.body.clone();
    body.advance(PICT_CHUNK_HEADER_LEN);
    Some(body)
}

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::DeciError;
use crate::protocol::DeciCommand;
use crate::wire::frame::{Notification, Response};
use crate::wire::header::ProtocolId;
use crate::wire::record::{decode, decode_list, encode_into, Field, Record, RecordDef};


/// result code of PLAY_DATA while the device's playback buffer is full
pub const PLAY_BUFFER_FULL: i32 = 1;

/// the most controller snapshots one PLAY_DATA command can carry
pub const MAX_EVENTS_PER_PLAY: usize = 8;

pub const ALL_CONTROLLERS: u32 = 0xffff_ffff;

pub const STICK_NEUTRAL: u8 = 128;

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum CtrlpMsgType {
    GetConfCmd = 0x0,
    GetConfRes = 0x1,
    RecStartCmd = 0x2,
    RecStartRes = 0x3,
    RecStopCmd = 0x4,
    RecStopRes = 0x5,
    RecDataNotification = 0x7,
    PlayStartCmd = 0x8,
    PlayStartRes = 0x9,
    PlayStopCmd = 0xa,
    PlayStopRes = 0xb,
    PlayDataCmd = 0xc,
    PlayDataRes = 0xd,
}

pub const DEVICES: RecordDef = &[
    Field::u32("controller").with_default(ALL_CONTROLLERS as i64),
];

pub const PLAY_CMD: RecordDef = &[
    Field::i32("threshold"),
];

/// One controller state snapshot, 56 bytes on the wire
pub const CTRLP_DATA: RecordDef = &[
    Field::u32("size").with_default(56),
    Field::u64("timestamp"),
    Field::u32("unionsize").with_default(44),
    Field::u32("datatype"),
    Field::u32("datasize").with_default(36),
    Field::u32("controller"),
    Field::u32("buttons"),
    Field::u8("lx").with_default(STICK_NEUTRAL as i64),
    Field::u8("ly").with_default(STICK_NEUTRAL as i64),
    Field::u8("rx").with_default(STICK_NEUTRAL as i64),
    Field::u8("ry").with_default(STICK_NEUTRAL as i64),
    Field::u8("l2"),
    Field::u8("r2"),
    Field::zeros(2),
    Field::u32("touchsize").with_default(12),
    Field::u64("timestamp2"),
    Field::zeros(4),
];

pub const PLAY_DATA_RES: RecordDef = &[
    Field::u32("count"),
];


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerData {
    pub timestamp: u64,
    pub controller: u32,
    pub buttons: u32,
    pub lx: u8,
    pub ly: u8,
    pub rx: u8,
    pub ry: u8,
    pub l2: u8,
    pub r2: u8,
}

impl ControllerData {
    /// the given buttons pressed, sticks centered, triggers released
    pub fn neutral(buttons: u32) -> ControllerData {
        ControllerData {
            timestamp: 0,
            controller: 0,
            buttons,
            lx: STICK_NEUTRAL,
            ly: STICK_NEUTRAL,
            rx: STICK_NEUTRAL,
            ry: STICK_NEUTRAL,
            l2: 0,
            r2: 0,
        }
    }

    pub fn to_record(&self) -> Record {
        Record::new()
            .with("timestamp", self.timestamp)
            .with("controller", self.controller)
            .with("buttons", self.buttons)
            .with("lx", self.lx)
            .with("ly", self.ly)
            .with("rx", self.rx)
            .with("ry", self.ry)
            .with("l2", self.l2)
            .with("r2", self.r2)
    }

    pub fn from_record(record: &Record) -> anyhow::Result<ControllerData> {
        Ok(ControllerData {
            timestamp: record.u64("timestamp")?,
            controller: record.u32("controller")?,
            buttons: record.u32("buttons")?,
            lx: record.u8("lx")?,
            ly: record.u8("ly")?,
            rx: record.u8("rx")?,
            ry: record.u8("ry")?,
            l2: record.u8("l2")?,
            r2: record.u8("r2")?,
        })
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlpCommand {
    GetConf,
    RecStart { controller: u32 },
    RecStop,
    PlayStart { controller: u32 },
    PlayStop,
    /// one snapshot per entry, each with neutral sticks and triggers
    PlayData { buttons: Vec<u32> },
    /// a block as captured from a REC_DATA notification, replayed as is
    PlayRawData { block: Bytes },
}

impl CtrlpCommand {
    fn types(&self) -> (CtrlpMsgType, CtrlpMsgType) {
        match self {
            CtrlpCommand::GetConf => (CtrlpMsgType::GetConfCmd, CtrlpMsgType::GetConfRes),
            CtrlpCommand::RecStart { .. } => (CtrlpMsgType::RecStartCmd, CtrlpMsgType::RecStartRes),
            CtrlpCommand::RecStop => (CtrlpMsgType::RecStopCmd, CtrlpMsgType::RecStopRes),
            CtrlpCommand::PlayStart { .. } => (CtrlpMsgType::PlayStartCmd, CtrlpMsgType::PlayStartRes),
            CtrlpCommand::PlayStop => (CtrlpMsgType::PlayStopCmd, CtrlpMsgType::PlayStopRes),
            CtrlpCommand::PlayData { .. } | CtrlpCommand::PlayRawData { .. } => (CtrlpMsgType::PlayDataCmd, CtrlpMsgType::PlayDataRes),
        }
    }
}

impl DeciCommand for CtrlpCommand {
    const PROTOCOL: ProtocolId = ProtocolId::CTRLP;

    fn msg_type(&self) -> i32 {
        self.types().0.into()
    }

    fn response_type(&self) -> i32 {
        self.types().1.into()
    }

    fn ser_payload(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            CtrlpCommand::RecStart { controller } | CtrlpCommand::PlayStart { controller } => {
                encode_into(DEVICES, &Record::new().with("controller", *controller), buf)
            }
            CtrlpCommand::PlayData { buttons } => {
                if buttons.len() > MAX_EVENTS_PER_PLAY {
                    return Err(DeciError::TooManyEvents(buttons.len()).into());
                }
                encode_into(PLAY_CMD, &Record::new().with("threshold", 0), buf)?;
                for &b in buttons {
                    encode_into(CTRLP_DATA, &ControllerData::neutral(b).to_record(), buf)?;
                }
                Ok(())
            }
            CtrlpCommand::PlayRawData { block } => {
                encode_into(PLAY_CMD, &Record::new().with("threshold", 0), buf)?;
                buf.put_slice(block);
                Ok(())
            }
            CtrlpCommand::GetConf | CtrlpCommand::RecStop | CtrlpCommand::PlayStop => Ok(()),
        }
    }
}


/// Free slots left in the playback buffer, if the device reported them
pub fn parse_play_data(response: &Response) -> anyhow::Result<Option<u32>> {
    if response.body.len() < 4 {
        return Ok(None);
    }
    Ok(Some(decode(PLAY_DATA_RES, &mut response.body.clone())?.u32("count")?))
}

/// The controller snapshots inside a REC_DATA notification
pub fn parse_rec_data(notification: &Notification) -> anyhow::Result<Vec<ControllerData>> {
    decode_list(CTRLP_DATA, &mut notification.body.clone())?
        .iter()
        .map(ControllerData::from_record)
        .collect()
}

/// Encodes controller snapshots the way REC_DATA carries them
pub fn ser_rec_data(data: &[ControllerData], buf: &mut BytesMut) -> anyhow::Result<()> {
    for d in data {
        encode_into(CTRLP_DATA, &d.to_record(), buf)?;
    }
    buf.put_i32_le(0);
    Ok(())
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use crate::wire::frame::{build_notification, Frame};
    use crate::wire::header::COMMAND_HEADER_LEN;
    use super::*;

    #[rstest]
    #[case::get_conf(CtrlpCommand::GetConf, 0x0, 0x1)]
    #[case::rec_start(CtrlpCommand::RecStart { controller: ALL_CONTROLLERS }, 0x2, 0x3)]
    #[case::rec_stop(CtrlpCommand::RecStop, 0x4, 0x5)]
    #[case::play_start(CtrlpCommand::PlayStart { controller: ALL_CONTROLLERS }, 0x8, 0x9)]
    #[case::play_stop(CtrlpCommand::PlayStop, 0xa, 0xb)]
    #[case::play_data(CtrlpCommand::PlayData { buttons: vec![] }, 0xc, 0xd)]
    #[case::play_raw_data(CtrlpCommand::PlayRawData { block: Bytes::new() }, 0xc, 0xd)]
    fn test_msg_types(#[case] command: CtrlpCommand, #[case] msg_type: i32, #[case] response_type: i32) {
        assert_eq!(command.msg_type(), msg_type);
        assert_eq!(command.response_type(), response_type);
    }

    #[test]
    fn test_play_data_layout() {
        let frame = CtrlpCommand::PlayData { buttons: vec![0x10000; 8] }.build_frame(1).unwrap();
        let payload = &frame[COMMAND_HEADER_LEN..];
        assert_eq!(payload.len(), 4 + 8 * 56);
        assert_eq!(&payload[..4], b"\0\0\0\0");

        let snapshot = &payload[4..60];
        assert_eq!(&snapshot[0..4], b"\x38\0\0\0");
        assert_eq!(&snapshot[12..16], b"\x2c\0\0\0");
        assert_eq!(&snapshot[20..24], b"\x24\0\0\0");
        assert_eq!(&snapshot[28..32], b"\0\0\x01\0");
        assert_eq!(&snapshot[32..38], &[128u8, 128, 128, 128, 0, 0]);
        assert_eq!(&snapshot[40..44], b"\x0c\0\0\0");
    }

    #[test]
    fn test_play_data_rejects_more_than_eight() {
        let err = CtrlpCommand::PlayData { buttons: vec![0; 9] }.build_frame(1).unwrap_err();
        assert_eq!(DeciError::of(&err), Some(&DeciError::TooManyEvents(9)));
    }

    #[test]
    fn test_play_raw_data_prefixes_threshold() {
        let frame = CtrlpCommand::PlayRawData { block: Bytes::from_static(b"rawblock") }.build_frame(1).unwrap();
        assert_eq!(&frame[COMMAND_HEADER_LEN..], b"\0\0\0\0rawblock");
    }

    #[test]
    fn test_rec_data_round_trip() {
        let data = vec![
            ControllerData::neutral(0x4000),
            ControllerData { timestamp: 99, lx: 0, r2: 255, ..ControllerData::neutral(0x10) },
        ];
        let mut payload = BytesMut::new();
        ser_rec_data(&data, &mut payload).unwrap();

        let raw = build_notification(ProtocolId::CTRLP, CtrlpMsgType::RecDataNotification.into(), 5, &payload);
        let notification = Notification::from_frame(&Frame::parse(raw).unwrap()).unwrap();
        assert_eq!(parse_rec_data(&notification).unwrap(), data);
    }
}

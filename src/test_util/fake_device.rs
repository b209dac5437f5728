use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::connector::{Connector, DeciStream};
use crate::engine::frame_reader::FrameAssembler;
use crate::protocol::ctrlp::{ser_rec_data, ControllerData, CtrlpMsgType, CTRLP_DATA, MAX_EVENTS_PER_PLAY, PLAY_BUFFER_FULL};
use crate::protocol::netmp::{NetmpMsgType, RegInfo, CONNECT_CMD, ERROR_INUSE, REGISTER_CMD, REG_INFO, UNREGISTER_CMD};
use crate::protocol::tsmp::{NameValue, TsmpMsgType, GET_PICT_CMD, GET_PSN_STATE_CMD, NAME_VALUE_DISPLAY, PICT_CHUNK_HEADER_LEN, POWER_REQUEST};
use crate::protocol::ttyp::{PortState, TtyOutput, TtypMsgType, PORT_STATE, TTY_OUT};
use crate::protocol::ProtocolConf;
use crate::wire::frame::{build_notification, build_response, Frame};
use crate::wire::header::{FragInfo, ProtocolId};
use crate::wire::record::{decode, decode_list, encode_into, encoded_len, Record, RecordDef, Variant};


pub const ERROR_UNKNOWN_COMMAND: i32 = 0x1001;
pub const ERROR_NOT_REGISTERED: i32 = 0x1002;
pub const ERROR_BAD_KEY: i32 = 0x1003;
pub const ERROR_UNKNOWN_USER: i32 = 0x2001;

const STREAM_BUFFER: usize = 64 * 1024;
const MAX_FRAME_LEN: usize = 1024 * 1024;

pub fn device_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
}


/// An in-memory device speaking NETMP, CTRLP, TTYP and TSMP. It is its own [Connector]: every
///  `connect` opens a new stream to it, and any number of clients can be connected at the same
///  time.
///
/// It enforces exclusive CTRLP ownership across clients, evicts the owner on FORCE_DISCONNECT,
///  emits REC_DATA blocks when recording starts and echoes every change of the played button
///  state as a console line to all TTYP streams.
#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

#[derive(Default)]
struct DeviceState {
    next_key: u32,
    clients: BTreeMap<u32, Client>,
    ctrlp_owner: Option<u32>,
    timestamp: u64,

    received: Vec<(ProtocolId, i32)>,
    silenced: FxHashSet<(ProtocolId, i32)>,
    write_chunk: Option<usize>,

    buffer_full: usize,
    rec_blocks: Vec<Bytes>,
    played: Vec<ControllerData>,
    button_history: Vec<u32>,

    tty_lines: Vec<TtyOutput>,

    info: Vec<NameValue>,
    pict_chunks: Vec<Bytes>,
    psn_states: FxHashMap<String, u32>,
    power_status: u32,
    power_requests: Vec<u32>,
}

struct Client {
    client_id: String,
    control: mpsc::UnboundedSender<Bytes>,
    links: Vec<(ProtocolId, mpsc::UnboundedSender<Bytes>)>,
}

/// What the device knows about one stream
struct StreamCtx {
    tx: mpsc::UnboundedSender<Bytes>,
    key: Option<u32>,
    /// `None` for a control stream
    protocol: Option<ProtocolId>,
}

fn send(tx: &mpsc::UnboundedSender<Bytes>, frame: Bytes) {
    // the client may be gone already
    let _ = tx.send(frame);
}

fn respond(ctx: &StreamCtx, command: &Frame, result: i32, payload: &[u8]) {
    send(&ctx.tx, build_response(command.protocol(), command.seq(), FragInfo::NONE, command.msg_type() + 1, result, 0, payload));
}

fn list_payload(def: RecordDef, records: impl IntoIterator<Item = Record>) -> anyhow::Result<BytesMut> {
    let mut buf = BytesMut::new();
    for record in records {
        let size = encoded_len(def, &record)? as u32;
        encode_into(def, &record.with("size", size), &mut buf)?;
    }
    buf.put_i32_le(0);
    Ok(buf)
}

fn conf_payload(in_buf_size: Option<i32>) -> anyhow::Result<BytesMut> {
    let conf = ProtocolConf {
        payload_length: 24,
        feature_number: 1,
        min_feature_number: 1,
        max_size_to_host: 0x10000,
        max_size_to_target: 0x10000,
        flags: 0,
        in_buf_size,
    };
    let mut buf = BytesMut::new();
    conf.ser(&mut buf)?;
    Ok(buf)
}

impl FakeDevice {
    pub fn new() -> FakeDevice {
        FakeDevice::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delivers everything the device writes in slices of at most `len` bytes
    pub fn set_write_chunk(&self, len: usize) {
        self.state().write_chunk = Some(len.max(1));
    }

    /// The device swallows this command without ever answering it
    pub fn silence(&self, protocol: ProtocolId, msg_type: i32) {
        self.state().silenced.insert((protocol, msg_type));
    }

    /// Answers the next `count` PLAY_DATA commands with 'buffer full'
    pub fn set_buffer_full(&self, count: usize) {
        self.state().buffer_full = count;
    }

    /// A REC_DATA notification to send whenever recording starts
    pub fn add_rec_block(&self, data: &[ControllerData]) -> anyhow::Result<()> {
        let mut block = BytesMut::new();
        ser_rec_data(data, &mut block)?;
        self.state().rec_blocks.push(block.freeze());
        Ok(())
    }

    /// A console line to send on every new TTYP stream right after registration
    pub fn add_tty_line(&self, output: TtyOutput) {
        self.state().tty_lines.push(output);
    }

    pub fn set_info(&self, info: Vec<NameValue>) {
        self.state().info = info;
    }

    /// The screenshot, one fragment per chunk
    pub fn set_pict(&self, chunks: Vec<Bytes>) {
        self.state().pict_chunks = chunks;
    }

    pub fn set_psn_state(&self, username: &str, state: u32) {
        self.state().psn_states.insert(username.to_string(), state);
    }

    pub fn set_power_status(&self, status: u32) {
        self.state().power_status = status;
    }

    /// How often the device received a given command
    pub fn count_received(&self, protocol: ProtocolId, msg_type: i32) -> usize {
        self.state().received.iter()
            .filter(|&&r| r == (protocol, msg_type))
            .count()
    }

    pub fn power_requests(&self) -> Vec<u32> {
        self.state().power_requests.clone()
    }

    pub fn played(&self) -> Vec<ControllerData> {
        self.state().played.clone()
    }

    /// The played button states, with consecutive repetitions collapsed
    pub fn button_history(&self) -> Vec<u32> {
        self.state().button_history.clone()
    }

    /// The client id of the current CTRLP owner
    pub fn ctrlp_owner(&self) -> Option<String> {
        let state = self.state();
        state.ctrlp_owner
            .and_then(|key| state.clients.get(&key))
            .map(|c| c.client_id.clone())
    }

    pub fn num_clients(&self) -> usize {
        self.state().clients.len()
    }

    /// Sends a console line to every TTYP stream that is currently registered
    pub fn emit_tty(&self, output: &TtyOutput) -> anyhow::Result<()> {
        self.state().broadcast_tty(output)
    }

    async fn serve(self, mut reader: ReadHalf<DuplexStream>, tx: mpsc::UnboundedSender<Bytes>) {
        let mut ctx = StreamCtx {
            tx,
            key: None,
            protocol: None,
        };
        let mut assembler = FrameAssembler::new(MAX_FRAME_LEN);
        loop {
            let raw = match assembler.read_frame(&mut reader).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    debug!("fake device stream failed: {}", e);
                    break;
                }
            };
            if let Err(e) = self.state().handle(&mut ctx, raw) {
                warn!("fake device could not handle a frame: {}", e);
                break;
            }
        }
        self.state().stream_closed(&ctx);
    }
}

#[async_trait]
impl Connector for FakeDevice {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn DeciStream>> {
        let (client, device) = tokio::io::duplex(STREAM_BUFFER);
        let (reader, writer) = tokio::io::split(device);
        let (tx, rx) = mpsc::unbounded_channel();

        let write_chunk = self.state().write_chunk;
        tokio::spawn(write_loop(writer, rx, write_chunk));
        tokio::spawn(self.clone().serve(reader, tx));
        debug!("fake device accepted a stream for {:?}", addr);
        Ok(Box::new(client))
    }
}

async fn write_loop(mut writer: WriteHalf<DuplexStream>, mut rx: mpsc::UnboundedReceiver<Bytes>, write_chunk: Option<usize>) {
    while let Some(frame) = rx.recv().await {
        let written = match write_chunk {
            Some(len) => write_in_slices(&mut writer, &frame, len).await,
            None => writer.write_all(&frame).await,
        };
        if written.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_in_slices(writer: &mut WriteHalf<DuplexStream>, frame: &[u8], len: usize) -> std::io::Result<()> {
    for slice in frame.chunks(len) {
        writer.write_all(slice).await?;
        writer.flush().await?;
        tokio::task::yield_now().await;
    }
    Ok(())
}


impl DeviceState {
    fn next_timestamp(&mut self) -> u64 {
        self.timestamp += 1;
        self.timestamp
    }

    fn handle(&mut self, ctx: &mut StreamCtx, raw: Bytes) -> anyhow::Result<()> {
        let frame = Frame::parse(raw)?;
        self.received.push((frame.protocol(), frame.msg_type()));
        if self.silenced.contains(&(frame.protocol(), frame.msg_type())) {
            return Ok(());
        }

        let body = frame.after_ulp_header();
        if frame.protocol() == ProtocolId::NETMP {
            return self.handle_netmp(ctx, &frame, body);
        }

        if !self.is_registered(ctx, frame.protocol()) {
            // NETMP answers for protocols this stream can not use
            send(&ctx.tx, build_response(ProtocolId::NETMP, frame.seq(), FragInfo::NONE, frame.msg_type() + 1, ERROR_NOT_REGISTERED, 0, b""));
            return Ok(());
        }
        match frame.protocol() {
            ProtocolId::CTRLP => self.handle_ctrlp(ctx, &frame, body),
            ProtocolId::TTYP => self.handle_ttyp(ctx, &frame),
            ProtocolId::TSMP => self.handle_tsmp(ctx, &frame, body),
            _ => {
                respond(ctx, &frame, ERROR_UNKNOWN_COMMAND, b"");
                Ok(())
            }
        }
    }

    fn is_registered(&self, ctx: &StreamCtx, protocol: ProtocolId) -> bool {
        if ctx.protocol != Some(protocol) {
            return false;
        }
        ctx.key
            .and_then(|key| self.clients.get(&key))
            .is_some_and(|client| client.links.iter().any(|(p, _)| *p == protocol))
    }

    fn handle_netmp(&mut self, ctx: &mut StreamCtx, frame: &Frame, mut body: Bytes) -> anyhow::Result<()> {
        match NetmpMsgType::try_from(frame.msg_type()) {
            Ok(NetmpMsgType::GetConfCmd) => {
                respond(ctx, frame, 0, &conf_payload(None)?);
            }
            Ok(NetmpMsgType::ConnectCmd) => {
                let client_id = decode(CONNECT_CMD, &mut body)?.str("client_id")?.to_string();
                self.next_key += 1;
                let key = 0x5eed_0000 + self.next_key;
                debug!("fake device: {} connected with key {:#x}", client_id, key);
                self.clients.insert(key, Client {
                    client_id,
                    control: ctx.tx.clone(),
                    links: Vec::new(),
                });
                ctx.key = Some(key);
                respond(ctx, frame, 0, &key.to_le_bytes());
            }
            Ok(NetmpMsgType::DisconnectCmd) => {
                if let Some(key) = ctx.key {
                    self.remove_client(key);
                }
                respond(ctx, frame, 0, b"");
            }
            Ok(NetmpMsgType::RegisterCmd) => {
                let record = decode(REGISTER_CMD, &mut body)?;
                let key = record.u32("netmp_key")?;
                let protocol = ProtocolId(record.u32("reg_protocol")?);
                let result = self.register(ctx, key, protocol);
                respond(ctx, frame, result, b"");

                if result == 0 && protocol == ProtocolId::TTYP {
                    for line in self.tty_lines.clone() {
                        self.send_tty(&ctx.tx, &line)?;
                    }
                }
            }
            Ok(NetmpMsgType::UnregisterCmd) => {
                let protocol = ProtocolId(decode(UNREGISTER_CMD, &mut body)?.u32("reg_protocol")?);
                if let Some(key) = ctx.key {
                    self.unregister(key, protocol);
                }
                respond(ctx, frame, 0, b"");
            }
            Ok(NetmpMsgType::ForceDisconnectCmd) => {
                self.evict_ctrlp_owner(ctx.key);
                respond(ctx, frame, 0, b"");
            }
            Ok(NetmpMsgType::GetRegisteredListCmd) => {
                let mut entries = Vec::new();
                for client in self.clients.values() {
                    entries.push(RegInfo { protocol: ProtocolId::NETMP, timestamp: 1, owner: client.client_id.clone() });
                    for (protocol, _) in &client.links {
                        entries.push(RegInfo { protocol: *protocol, timestamp: 2, owner: client.client_id.clone() });
                    }
                }
                let payload = list_payload(REG_INFO, entries.iter().map(RegInfo::to_record))?;
                respond(ctx, frame, 0, &payload);
            }
            _ => respond(ctx, frame, ERROR_UNKNOWN_COMMAND, b""),
        }
        Ok(())
    }

    fn register(&mut self, ctx: &mut StreamCtx, key: u32, protocol: ProtocolId) -> i32 {
        if protocol == ProtocolId::CTRLP && self.ctrlp_owner.is_some_and(|owner| owner != key) {
            return ERROR_INUSE;
        }
        let client = match self.clients.get_mut(&key) {
            Some(client) => client,
            None => return ERROR_BAD_KEY,
        };
        client.links.push((protocol, ctx.tx.clone()));
        if protocol == ProtocolId::CTRLP {
            self.ctrlp_owner = Some(key);
        }
        ctx.key = Some(key);
        ctx.protocol = Some(protocol);
        0
    }

    fn unregister(&mut self, key: u32, protocol: ProtocolId) {
        if let Some(client) = self.clients.get_mut(&key) {
            client.links.retain(|(p, _)| *p != protocol);
        }
        if protocol == ProtocolId::CTRLP && self.ctrlp_owner == Some(key) {
            self.ctrlp_owner = None;
        }
    }

    fn remove_client(&mut self, key: u32) {
        self.clients.remove(&key);
        if self.ctrlp_owner == Some(key) {
            self.ctrlp_owner = None;
        }
    }

    fn evict_ctrlp_owner(&mut self, requester: Option<u32>) {
        let owner = match self.ctrlp_owner {
            Some(owner) if Some(owner) != requester => owner,
            _ => return,
        };
        let timestamp = self.next_timestamp();
        if let Some(client) = self.clients.get(&owner) {
            debug!("fake device: evicting {}", client.client_id);
            send(&client.control, build_notification(ProtocolId::NETMP, NetmpMsgType::ForceDisconnectNotification.into(), timestamp, b""));
        }
        self.remove_client(owner);
    }

    fn stream_closed(&mut self, ctx: &StreamCtx) {
        let key = match ctx.key {
            Some(key) => key,
            None => return,
        };
        match ctx.protocol {
            Some(protocol) => {
                let is_current = self.clients.get(&key)
                    .is_some_and(|c| c.links.iter().any(|(p, tx)| *p == protocol && tx.same_channel(&ctx.tx)));
                if is_current {
                    self.unregister(key, protocol);
                }
            }
            None => {
                let is_current = self.clients.get(&key)
                    .is_some_and(|c| c.control.same_channel(&ctx.tx));
                if is_current {
                    self.remove_client(key);
                }
            }
        }
    }

    fn handle_ctrlp(&mut self, ctx: &StreamCtx, frame: &Frame, mut body: Bytes) -> anyhow::Result<()> {
        match CtrlpMsgType::try_from(frame.msg_type()) {
            Ok(CtrlpMsgType::GetConfCmd) => respond(ctx, frame, 0, &conf_payload(Some(0x400))?),
            Ok(CtrlpMsgType::RecStartCmd) => {
                respond(ctx, frame, 0, b"");
                for block in self.rec_blocks.clone() {
                    let timestamp = self.next_timestamp();
                    send(&ctx.tx, build_notification(ProtocolId::CTRLP, CtrlpMsgType::RecDataNotification.into(), timestamp, &block));
                }
            }
            Ok(CtrlpMsgType::RecStopCmd | CtrlpMsgType::PlayStartCmd | CtrlpMsgType::PlayStopCmd) => respond(ctx, frame, 0, b""),
            Ok(CtrlpMsgType::PlayDataCmd) => {
                if self.buffer_full > 0 {
                    self.buffer_full -= 1;
                    respond(ctx, frame, PLAY_BUFFER_FULL, b"");
                    return Ok(());
                }
                if body.remaining() < 4 {
                    bail!("PLAY_DATA without threshold");
                }
                body.advance(4);
                for record in decode_list(CTRLP_DATA, &mut body)? {
                    self.play(ControllerData::from_record(&record)?)?;
                }
                respond(ctx, frame, 0, &(MAX_EVENTS_PER_PLAY as u32).to_le_bytes());
            }
            _ => respond(ctx, frame, ERROR_UNKNOWN_COMMAND, b""),
        }
        Ok(())
    }

    fn play(&mut self, data: ControllerData) -> anyhow::Result<()> {
        self.played.push(data);
        if self.button_history.last() == Some(&data.buttons) {
            return Ok(());
        }
        self.button_history.push(data.buttons);
        self.broadcast_tty(&TtyOutput {
            port: 0,
            category: 0,
            pid: 1,
            tid: 1,
            message: format!("buttons {:x}\n", data.buttons),
        })
    }

    fn send_tty(&mut self, tx: &mpsc::UnboundedSender<Bytes>, output: &TtyOutput) -> anyhow::Result<()> {
        let mut payload = BytesMut::new();
        encode_into(TTY_OUT, &output.to_record(), &mut payload)?;
        let timestamp = self.next_timestamp();
        send(tx, build_notification(ProtocolId::TTYP, TtypMsgType::TtyOutNotification.into(), timestamp, &payload));
        Ok(())
    }

    fn broadcast_tty(&mut self, output: &TtyOutput) -> anyhow::Result<()> {
        let targets = self.clients.values()
            .flat_map(|c| c.links.iter())
            .filter(|(p, _)| *p == ProtocolId::TTYP)
            .map(|(_, tx)| tx.clone())
            .collect::<Vec<_>>();
        for tx in targets {
            self.send_tty(&tx, output)?;
        }
        Ok(())
    }

    fn handle_ttyp(&mut self, ctx: &StreamCtx, frame: &Frame) -> anyhow::Result<()> {
        match TtypMsgType::try_from(frame.msg_type()) {
            Ok(TtypMsgType::GetConfCmd) => respond(ctx, frame, 0, &conf_payload(Some(0x800))?),
            Ok(TtypMsgType::GetPortStatesCmd) => {
                let ports = [
                    PortState { port: 0, mask: 0xffff, state: 1 },
                    PortState { port: 1, mask: 0x00ff, state: 0 },
                ];
                let payload = list_payload(PORT_STATE, ports.iter().map(PortState::to_record))?;
                respond(ctx, frame, 0, &payload);
            }
            _ => respond(ctx, frame, ERROR_UNKNOWN_COMMAND, b""),
        }
        Ok(())
    }

    fn handle_tsmp(&mut self, ctx: &StreamCtx, frame: &Frame, mut body: Bytes) -> anyhow::Result<()> {
        match TsmpMsgType::try_from(frame.msg_type()) {
            Ok(TsmpMsgType::GetConfCmd) => respond(ctx, frame, 0, &conf_payload(Some(0x100))?),
            Ok(TsmpMsgType::GetInfoCmd) => {
                let payload = list_payload(NAME_VALUE_DISPLAY, self.info.iter().map(NameValue::to_record))?;
                respond(ctx, frame, 0, &payload);
            }
            Ok(TsmpMsgType::PowerControlCmd) => {
                self.power_requests.push(decode(POWER_REQUEST, &mut body)?.u32("powerstate")?);
                respond(ctx, frame, 0, b"");
            }
            Ok(TsmpMsgType::GetPowerStatusCmd) => respond(ctx, frame, 0, &self.power_status.to_le_bytes()),
            Ok(TsmpMsgType::GetPsnStateCmd) => {
                let username = decode(GET_PSN_STATE_CMD, &mut body)?.str("username")?.to_string();
                match self.psn_states.get(&username) {
                    Some(state) => respond(ctx, frame, 0, &state.to_le_bytes()),
                    None => respond(ctx, frame, ERROR_UNKNOWN_USER, b""),
                }
            }
            Ok(TsmpMsgType::GetPictCmd) => {
                decode(GET_PICT_CMD, &mut body)?;
                self.send_pict(ctx, frame);
            }
            _ => respond(ctx, frame, ERROR_UNKNOWN_COMMAND, b""),
        }
        Ok(())
    }

    fn send_pict(&self, ctx: &StreamCtx, frame: &Frame) {
        let response_type = frame.msg_type() + 1;
        if self.pict_chunks.is_empty() {
            send(&ctx.tx, build_response(ProtocolId::TSMP, frame.seq(), FragInfo::NONE, response_type, 0, 0, &[0; PICT_CHUNK_HEADER_LEN]));
            return;
        }

        let num_chunks = self.pict_chunks.len();
        for (i, chunk) in self.pict_chunks.iter().enumerate() {
            let mut payload = BytesMut::with_capacity(PICT_CHUNK_HEADER_LEN + chunk.len());
            payload.put_bytes(0, PICT_CHUNK_HEADER_LEN);
            payload.put_slice(chunk);
            let frag = FragInfo::new(i + 1 < num_chunks, false, i as u16);
            send(&ctx.tx, build_response(ProtocolId::TSMP, frame.seq(), frag, response_type, 0, 0, &payload));
        }
    }
}


/// A GET_INFO entry for [FakeDevice::set_info]
pub fn info_entry(name: &str, value: Variant) -> NameValue {
    NameValue {
        name: name.to_string(),
        value,
        format: 0,
    }
}

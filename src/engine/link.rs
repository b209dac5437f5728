use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::engine::connector::DeciStream;
use crate::engine::frame_reader::FrameAssembler;
use crate::error::AbortReason;
use crate::util::hex_dump::HexDump;
use crate::wire::header::ProtocolId;


/// Receives everything that comes in on a session's links. Links only hold a weak reference to
///  their sink, so the background tasks end once the sink's owner is gone.
pub trait FrameSink: Send + Sync + 'static {
    /// called with every complete frame, in arrival order per link
    fn on_frame(&self, link: ProtocolId, raw: Bytes);

    fn on_link_failure(&self, link: ProtocolId, reason: AbortReason);
}


/// One stream of a session, dedicated to a single protocol. Every link is served by a reader task
///  and a writer task; the writer drains an unbounded outbound queue so that callers never wait
///  for a socket.
pub struct Link {
    protocol: ProtocolId,
    outbound: mpsc::UnboundedSender<Bytes>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    pub fn spawn<S: FrameSink>(protocol: ProtocolId, stream: Box<dyn DeciStream>, sink: Weak<S>, max_frame_len: usize) -> Link {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(protocol, read_half, sink.clone(), closing.clone(), max_frame_len));
        // the writer ends when the outbound sender is dropped
        tokio::spawn(write_loop(protocol, write_half, outbound_rx, sink));

        Link {
            protocol,
            outbound,
            closing,
            reader,
        }
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    /// Queues a frame for sending, returning `false` if the link is already down
    pub fn send(&self, frame: Bytes) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Orderly shutdown: frames that are already queued are still written, then the stream is
    ///  shut down. Reading stops immediately.
    pub fn close(self) {
        debug!("closing link for {:?}", self.protocol);
        self.closing.store(true, Ordering::Release);
        // dropping self aborts the reader and releases the outbound sender
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.reader.abort();
    }
}


async fn read_loop<S: FrameSink>(protocol: ProtocolId, mut read_half: ReadHalf<Box<dyn DeciStream>>, sink: Weak<S>, closing: Arc<AtomicBool>, max_frame_len: usize) {
    let mut assembler = FrameAssembler::new(max_frame_len);
    loop {
        let result = assembler.read_frame(&mut read_half).await;

        let sink = match sink.upgrade() {
            Some(sink) => sink,
            None => return,
        };
        if closing.load(Ordering::Acquire) {
            return;
        }

        match result {
            Ok(Some(raw)) => {
                trace!("received on {:?} link:\n{}", protocol, HexDump(&raw));
                sink.on_frame(protocol, raw);
            }
            Ok(None) => {
                sink.on_link_failure(protocol, AbortReason::Transport(format!("{:?} stream was closed by the device", protocol)));
                return;
            }
            Err(e) => {
                sink.on_link_failure(protocol, AbortReason::Transport(format!("reading {:?} stream: {}", protocol, e)));
                return;
            }
        }
    }
}

async fn write_loop<S: FrameSink>(protocol: ProtocolId, mut write_half: WriteHalf<Box<dyn DeciStream>>, mut outbound: mpsc::UnboundedReceiver<Bytes>, sink: Weak<S>) {
    while let Some(frame) = outbound.recv().await {
        trace!("sending on {:?} link:\n{}", protocol, HexDump(&frame));
        if let Err(e) = write_half.write_all(&frame).await {
            if let Some(sink) = sink.upgrade() {
                sink.on_link_failure(protocol, AbortReason::Transport(format!("writing {:?} stream: {}", protocol, e)));
            }
            return;
        }
    }

    trace!("outbound queue for {:?} closed, shutting down the stream", protocol);
    let _ = write_half.shutdown().await;
}


#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use crate::wire::frame::build_command;
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<(ProtocolId, Bytes)>>,
        failures: Mutex<Vec<(ProtocolId, AbortReason)>>,
    }

    impl FrameSink for RecordingSink {
        fn on_frame(&self, link: ProtocolId, raw: Bytes) {
            self.frames.lock().unwrap().push((link, raw));
        }

        fn on_link_failure(&self, link: ProtocolId, reason: AbortReason) {
            self.failures.lock().unwrap().push((link, reason));
        }
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (client, mut device) = tokio::io::duplex(1024);
        let sink = Arc::new(RecordingSink::default());
        let link = Link::spawn(ProtocolId::TTYP, Box::new(client), Arc::downgrade(&sink), 1024);

        let command = build_command(ProtocolId::TTYP, 5, 4, b"");
        assert!(link.send(command.clone()));
        let mut buf = vec![0u8; command.len()];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &command[..]);

        device.write_all(&command).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = sink.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, ProtocolId::TTYP);
        assert_eq!(frames[0].1, command);
    }

    #[tokio::test]
    async fn test_device_eof_is_reported() {
        let (client, device) = tokio::io::duplex(1024);
        let sink = Arc::new(RecordingSink::default());
        let _link = Link::spawn(ProtocolId::CTRLP, Box::new(client), Arc::downgrade(&sink), 1024);

        drop(device);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let failures = sink.failures.lock().unwrap().clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ProtocolId::CTRLP);
        assert!(matches!(failures[0].1, AbortReason::Transport(_)));
    }

    #[tokio::test]
    async fn test_close_flushes_and_is_quiet() {
        let (client, mut device) = tokio::io::duplex(1024);
        let sink = Arc::new(RecordingSink::default());
        let link = Link::spawn(ProtocolId::TSMP, Box::new(client), Arc::downgrade(&sink), 1024);

        let command = build_command(ProtocolId::TSMP, 1, 6, b"");
        link.send(command.clone());
        link.close();

        let mut received = Vec::new();
        device.read_to_end(&mut received).await.unwrap();
        assert_eq!(&received[..], &command[..]);
        assert!(sink.failures.lock().unwrap().is_empty());
    }
}

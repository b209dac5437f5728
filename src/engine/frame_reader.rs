use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::DeciError;
use crate::wire::header::{COMMAND_HEADER_LEN, LENGTH_OFFSET};


/// number of bytes needed to know a frame's total length
const LENGTH_PREFIX_LEN: usize = LENGTH_OFFSET + 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ReadState {
    AwaitingHeader,
    AwaitingBody { total_len: usize },
}


/// Cuts complete frames out of a byte stream that arrives in arbitrary slices. Each link owns
///  one assembler, which keeps partial data between reads.
pub struct FrameAssembler {
    buf: BytesMut,
    state: ReadState,
    max_frame_len: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_len: usize) -> FrameAssembler {
        FrameAssembler {
            buf: BytesMut::with_capacity(4096),
            state: ReadState::AwaitingHeader,
            max_frame_len,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame if there is one. An error means that the stream is
    ///  corrupt and can not be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DeciError> {
        loop {
            match self.state {
                ReadState::AwaitingHeader => {
                    if self.buf.len() < LENGTH_PREFIX_LEN {
                        return Ok(None);
                    }
                    let raw_len = i32::from_le_bytes([
                        self.buf[LENGTH_OFFSET],
                        self.buf[LENGTH_OFFSET + 1],
                        self.buf[LENGTH_OFFSET + 2],
                        self.buf[LENGTH_OFFSET + 3],
                    ]);
                    if raw_len < COMMAND_HEADER_LEN as i32 || raw_len as usize > self.max_frame_len {
                        return Err(DeciError::Framing(format!("invalid frame length {}", raw_len)));
                    }
                    self.state = ReadState::AwaitingBody { total_len: raw_len as usize };
                }
                ReadState::AwaitingBody { total_len } => {
                    if self.buf.len() < total_len {
                        return Ok(None);
                    }
                    self.state = ReadState::AwaitingHeader;
                    return Ok(Some(self.buf.split_to(total_len).freeze()));
                }
            }
        }
    }

    /// Reads from `reader` until a complete frame is available. `None` signals a regular end of
    ///  stream at a frame boundary.
    pub async fn read_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> anyhow::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }

            self.buf.reserve(4096);
            let num_read = reader.read_buf(&mut self.buf).await?;
            trace!("read {} bytes, {} buffered in {:?}", num_read, self.buf.len(), self.state);
            if num_read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(DeciError::Framing(format!("stream ended inside a frame with {} bytes pending", self.buf.len())).into());
            }
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;
    use crate::wire::frame::build_command;
    use crate::wire::header::ProtocolId;
    use super::*;

    fn two_frames() -> Vec<u8> {
        let mut data = build_command(ProtocolId::NETMP, 1, 0, b"").to_vec();
        data.extend_from_slice(&build_command(ProtocolId::TTYP, 2, 4, b"abcdefgh"));
        data
    }

    #[rstest]
    #[case::all_at_once(1000)]
    #[case::byte_by_byte(1)]
    #[case::three(3)]
    #[case::seven(7)]
    #[case::header_sized(20)]
    fn test_partial_pushes(#[case] slice_len: usize) {
        let data = two_frames();
        let mut assembler = FrameAssembler::new(1024);
        let mut frames = Vec::new();
        for slice in data.chunks(slice_len) {
            assembler.push(slice);
            while let Some(frame) = assembler.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 20);
        assert_eq!(frames[1].len(), 28);
        assert_eq!(&frames[1][20..], b"abcdefgh");
        assert_eq!(assembler.buffered(), 0);
    }

    #[rstest]
    #[case::too_short(b"\x41\0\0\0\x13\0\0\0")]
    #[case::negative(b"\x41\0\0\0\xff\xff\xff\xff")]
    #[case::too_long(b"\x41\0\0\0\x01\x04\0\0")]
    fn test_invalid_length(#[case] data: &[u8]) {
        let mut assembler = FrameAssembler::new(1024);
        assembler.push(data);
        assert!(matches!(assembler.next_frame(), Err(DeciError::Framing(_))));
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(5);
        let data = two_frames();
        tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
        });

        let mut assembler = FrameAssembler::new(1024);
        assert_eq!(assembler.read_frame(&mut server).await.unwrap().unwrap().len(), 20);
        assert_eq!(assembler.read_frame(&mut server).await.unwrap().unwrap().len(), 28);
        assert!(assembler.read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&two_frames()[..25]).await.unwrap();
        drop(client);

        let mut assembler = FrameAssembler::new(1024);
        assert!(assembler.read_frame(&mut server).await.unwrap().is_some());
        let err = assembler.read_frame(&mut server).await.unwrap_err();
        assert!(matches!(DeciError::of(&err), Some(DeciError::Framing(_))));
    }
}

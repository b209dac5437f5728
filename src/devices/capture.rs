//! Recording controller input from a device and replaying it later. Captured blocks are
//!  stored as a sequence of `[u32 length][block]`, little endian.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::DeciError;
use crate::protocol::ctrlp::ALL_CONTROLLERS;
use crate::session::ctrlp::Ctrlp;


/// pause between two replayed blocks
pub const REPLAY_GAP: Duration = Duration::from_millis(10);

const REC_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub async fn write_block<W: AsyncWrite + Unpin>(out: &mut W, block: &[u8]) -> anyhow::Result<()> {
    out.write_u32_le(block.len() as u32).await?;
    out.write_all(block).await?;
    Ok(())
}

/// Reads the next block, `None` at the end of the input
pub async fn read_block<R: AsyncRead + Unpin>(input: &mut R, max_len: usize) -> anyhow::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = input.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DeciError::Framing("capture ends inside a block length".to_string()).into());
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_len {
        return Err(DeciError::Framing(format!("captured block of {} bytes exceeds the maximum of {}", len, max_len)).into());
    }
    let mut block = BytesMut::zeroed(len);
    input.read_exact(&mut block).await?;
    Ok(Some(block.freeze()))
}

pub async fn write_capture<W: AsyncWrite + Unpin>(out: &mut W, blocks: &[Bytes]) -> anyhow::Result<()> {
    for block in blocks {
        write_block(out, block).await?;
    }
    out.flush().await?;
    Ok(())
}

pub async fn read_capture<R: AsyncRead + Unpin>(input: &mut R, max_len: usize) -> anyhow::Result<Vec<Bytes>> {
    let mut blocks = Vec::new();
    while let Some(block) = read_block(input, max_len).await? {
        blocks.push(block);
    }
    Ok(blocks)
}

/// Records controller input until `stop` completes, returning the raw REC_DATA blocks in
///  arrival order
pub async fn record_until(ctrlp: &Ctrlp, stop: impl Future<Output = ()>) -> anyhow::Result<Vec<Bytes>> {
    ctrlp.rec_start(ALL_CONTROLLERS).await?;
    tokio::pin!(stop);

    let mut blocks = Vec::new();
    loop {
        tokio::select! {
            _ = &mut stop => break,
            block = ctrlp.wait_raw_data(REC_POLL_INTERVAL) => {
                if let Some(block) = block? {
                    blocks.push(block);
                }
            }
        }
    }

    ctrlp.rec_stop().await?;
    while let Some(block) = ctrlp.read_raw_data()? {
        blocks.push(block);
    }
    info!("recorded {} blocks", blocks.len());
    Ok(blocks)
}

/// Plays recorded blocks back in order, pausing briefly between blocks
pub async fn replay(ctrlp: &Ctrlp, blocks: &[Bytes]) -> anyhow::Result<()> {
    ctrlp.play_start(ALL_CONTROLLERS).await?;
    for (i, block) in blocks.iter().enumerate() {
        debug!("replaying block {} of {}", i + 1, blocks.len());
        ctrlp.play_raw_data(block.clone()).await?;
        tokio::time::sleep(REPLAY_GAP).await;
    }
    ctrlp.play_stop().await
}


#[cfg(test)]
mod test {
    use std::sync::Arc;
    use crate::protocol::ctrlp::ControllerData;
    use crate::session::ttyp::Ttyp;
    use crate::test_util::fake_device::FakeDevice;
    use crate::test_util::connect;
    use super::*;

    #[tokio::test]
    async fn test_capture_file_layout() {
        let blocks = vec![Bytes::from_static(b"abc"), Bytes::new(), Bytes::from_static(b"\x01\x02")];
        let mut file = Vec::new();
        write_capture(&mut file, &blocks).await.unwrap();
        assert_eq!(file, b"\x03\0\0\0abc\0\0\0\0\x02\0\0\0\x01\x02");

        let read = read_capture(&mut &file[..], 1024).await.unwrap();
        assert_eq!(read, blocks);
    }

    #[tokio::test]
    async fn test_truncated_capture() {
        assert!(read_capture(&mut &b"\x03\0\0\0ab"[..], 1024).await.is_err());
        let err = read_capture(&mut &b"\x03\0"[..], 1024).await.unwrap_err();
        assert!(matches!(DeciError::of(&err), Some(DeciError::Framing(_))));
    }

    #[tokio::test]
    async fn test_oversized_block() {
        let err = read_capture(&mut &b"\x00\x10\0\0"[..], 1024).await.unwrap_err();
        assert!(matches!(DeciError::of(&err), Some(DeciError::Framing(_))));
    }

    #[tokio::test]
    async fn test_record_and_replay() {
        let device = FakeDevice::new();
        device.add_rec_block(&[ControllerData::neutral(0x10), ControllerData::neutral(0x10)]).unwrap();
        device.add_rec_block(&[ControllerData::neutral(0x4000), ControllerData::neutral(0)]).unwrap();

        let netmp = connect(&device, "alice").await.unwrap();
        let ctrlp = netmp.register::<Ctrlp>().await.unwrap();
        let blocks = record_until(&ctrlp, tokio::time::sleep(Duration::from_millis(300))).await.unwrap();
        assert_eq!(blocks.len(), 2);

        let mut file = Vec::new();
        write_capture(&mut file, &blocks).await.unwrap();
        let loaded = read_capture(&mut &file[..], 1024).await.unwrap();
        assert_eq!(loaded, blocks);

        let ttyp: Arc<Ttyp> = netmp.register::<Ttyp>().await.unwrap();
        replay(&ctrlp, &loaded).await.unwrap();
        assert_eq!(device.button_history(), vec![0x10, 0x4000, 0]);
        assert_eq!(device.played().len(), 4);

        let mut echoed = Vec::new();
        while let Some(event) = ttyp.read_sync(Duration::from_millis(200)).await.unwrap() {
            echoed.push(event);
        }
        assert_eq!(echoed.len(), 3);
    }
}

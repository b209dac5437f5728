use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::DeciError;
use crate::protocol::ctrlp::{parse_play_data, parse_rec_data, ControllerData, CtrlpCommand, CtrlpMsgType, PLAY_BUFFER_FULL};
use crate::protocol::{check_result, ProtocolConf};
use crate::session::{SessionLink, SubProtocol};
use crate::wire::frame::Notification;
use crate::wire::header::ProtocolId;


/// Controller emulation and recording. Only one client at a time can hold CTRLP on a device.
pub struct Ctrlp {
    link: SessionLink,
}

impl SubProtocol for Ctrlp {
    const PROTOCOL: ProtocolId = ProtocolId::CTRLP;

    fn new(link: SessionLink) -> Self {
        Ctrlp { link }
    }
}

impl Ctrlp {
    pub async fn get_conf(&self) -> anyhow::Result<ProtocolConf> {
        let response = self.link.call(&CtrlpCommand::GetConf).await?;
        ProtocolConf::parse(&response, true)
    }

    /// Starts sending REC_DATA notifications for the controllers in the `controller` bitmask
    pub async fn rec_start(&self, controller: u32) -> anyhow::Result<()> {
        self.link.call(&CtrlpCommand::RecStart { controller }).await?;
        Ok(())
    }

    pub async fn rec_stop(&self) -> anyhow::Result<()> {
        self.link.call(&CtrlpCommand::RecStop).await?;
        Ok(())
    }

    pub async fn play_start(&self, controller: u32) -> anyhow::Result<()> {
        self.link.call(&CtrlpCommand::PlayStart { controller }).await?;
        Ok(())
    }

    pub async fn play_stop(&self) -> anyhow::Result<()> {
        self.link.call(&CtrlpCommand::PlayStop).await?;
        Ok(())
    }

    /// Sends up to eight button states, one snapshot each. Returns the result code, which is 0
    ///  on success and [PLAY_BUFFER_FULL] if the device had no room for them; any other result
    ///  is an error.
    pub async fn play_data(&self, buttons: &[u32]) -> anyhow::Result<i32> {
        let response = self.link.request(&CtrlpCommand::PlayData { buttons: buttons.to_vec() }).await?;
        if response.result == PLAY_BUFFER_FULL {
            return Ok(response.result);
        }
        let response = check_result(response)?;
        trace!("play data accepted, free slots: {:?}", parse_play_data(&response)?);
        Ok(response.result)
    }

    /// Replays a block as captured by [Ctrlp::read_raw_data]. While the device's playback buffer
    ///  is full, the block is resent after a delay, up to the configured number of attempts and
    ///  never longer than the request timeout.
    pub async fn play_raw_data(&self, block: Bytes) -> anyhow::Result<()> {
        let config = self.link.config();
        let deadline = Instant::now() + config.request_timeout;
        let command = CtrlpCommand::PlayRawData { block };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let response = self.link.request(&command).await?;
            if response.result != PLAY_BUFFER_FULL {
                check_result(response)?;
                return Ok(());
            }

            let retry_at = Instant::now() + config.play_retry_delay;
            if attempts >= config.play_retry_limit || retry_at > deadline {
                return Err(DeciError::BufferFull { attempts }.into());
            }
            debug!("playback buffer full, retrying (attempt {})", attempts);
            tokio::time::sleep_until(retry_at).await;
        }
    }

    /// The controller snapshots of the next queued REC_DATA notification, without waiting
    pub fn read_data(&self) -> anyhow::Result<Option<Vec<ControllerData>>> {
        match self.next_rec_data()? {
            Some(notification) => Ok(Some(parse_rec_data(&notification)?)),
            None => Ok(None),
        }
    }

    /// The payload of the next queued REC_DATA notification as it came from the device, without
    ///  waiting
    pub fn read_raw_data(&self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.next_rec_data()?.map(|n| n.body))
    }

    /// Waits up to `timeout` for the payload of the next REC_DATA notification
    pub async fn wait_raw_data(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.link.wait_notification(remaining).await? {
                None => return Ok(None),
                Some(n) if is_rec_data(&n) => return Ok(Some(n.body)),
                Some(n) => debug!("ignoring CTRLP notification type 0x{:x}", n.msg_type),
            }
        }
    }

    fn next_rec_data(&self) -> anyhow::Result<Option<Notification>> {
        while let Some(notification) = self.link.poll_notification()? {
            if is_rec_data(&notification) {
                return Ok(Some(notification));
            }
            debug!("ignoring CTRLP notification type 0x{:x}", notification.msg_type);
        }
        Ok(None)
    }
}

fn is_rec_data(notification: &Notification) -> bool {
    notification.protocol == ProtocolId::CTRLP && notification.msg_type == i32::from(CtrlpMsgType::RecDataNotification)
}

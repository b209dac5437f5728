use bytes::Bytes;
use tracing::debug;

use crate::protocol::tsmp::{parse_info, parse_power_status, parse_psn_state, pict_chunk, NameValue, PictMode, TsmpCommand, POWER_OFF, POWER_REBOOT};
use crate::protocol::{check_result, ProtocolConf};
use crate::session::{ResponseFragments, SessionLink, SubProtocol};
use crate::wire::header::ProtocolId;


/// System information, power control, PSN state and screenshots
pub struct Tsmp {
    link: SessionLink,
}

impl SubProtocol for Tsmp {
    const PROTOCOL: ProtocolId = ProtocolId::TSMP;

    fn new(link: SessionLink) -> Self {
        Tsmp { link }
    }
}

/// The result of GET_PSN_STATE: the raw result code, and the user's PSN state if the query
///  succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsnState {
    pub result: i32,
    pub psn_state: Option<u32>,
}

impl Tsmp {
    pub async fn get_conf(&self) -> anyhow::Result<ProtocolConf> {
        let response = self.link.call(&TsmpCommand::GetConf).await?;
        ProtocolConf::parse(&response, true)
    }

    pub async fn get_info(&self) -> anyhow::Result<Vec<NameValue>> {
        let response = self.link.call(&TsmpCommand::GetInfo).await?;
        parse_info(&response)
    }

    pub async fn power_control(&self, power_state: u32) -> anyhow::Result<()> {
        self.link.call(&TsmpCommand::PowerControl { power_state }).await?;
        Ok(())
    }

    pub async fn reboot(&self) -> anyhow::Result<()> {
        self.power_control(POWER_REBOOT).await
    }

    pub async fn power_off(&self) -> anyhow::Result<()> {
        self.power_control(POWER_OFF).await
    }

    pub async fn get_power_status(&self) -> anyhow::Result<u32> {
        let response = self.link.call(&TsmpCommand::GetPowerStatus).await?;
        parse_power_status(&response)
    }

    /// A non-zero result is not an error here: the device reports unknown users that way
    pub async fn get_psn_state(&self, username: &str) -> anyhow::Result<PsnState> {
        let response = self.link.request(&TsmpCommand::GetPsnState { username: username.to_string() }).await?;
        Ok(PsnState {
            result: response.result,
            psn_state: parse_psn_state(&response)?,
        })
    }

    /// Requests a screenshot. The image arrives in chunks, see [PictStream].
    pub fn get_pict(&self, mode: PictMode) -> anyhow::Result<PictStream> {
        debug!("requesting {:?} screenshot", mode);
        Ok(PictStream {
            fragments: self.link.request_stream(&TsmpCommand::GetPict { mode })?,
            done: false,
        })
    }
}


/// The chunks of a screenshot (TGA data) in arrival order
pub struct PictStream {
    fragments: ResponseFragments,
    done: bool,
}

impl PictStream {
    /// Waits for the next non-empty chunk; `None` when the image is complete
    pub async fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        while !self.done {
            let response = match self.fragments.next().await? {
                Some(response) => check_result(response)?,
                None => break,
            };
            if response.frag.is_last() {
                self.done = true;
            }
            if let Some(chunk) = pict_chunk(&response) {
                return Ok(Some(chunk));
            }
        }
        self.done = true;
        Ok(None)
    }
}


#[cfg(test)]
mod test {
    use crate::error::DeciError;
    use crate::protocol::tsmp::PSN_SIGNED_IN;
    use crate::test_util::connect;
    use crate::test_util::fake_device::{info_entry, FakeDevice, ERROR_UNKNOWN_USER};
    use crate::wire::record::Variant;
    use super::*;

    async fn collect(mut stream: PictStream) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_info() {
        let device = FakeDevice::new();
        device.set_info(vec![
            info_entry("sdk_version", Variant::Utf8("11.000".to_string())),
            info_entry("memory_mb", Variant::U32(16384)),
        ]);
        let netmp = connect(&device, "alice").await.unwrap();
        let tsmp = netmp.register::<Tsmp>().await.unwrap();

        let info = tsmp.get_info().await.unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].name, "sdk_version");
        assert_eq!(info[0].value, Variant::Utf8("11.000".to_string()));
        assert_eq!(info[1].value, Variant::U32(16384));
    }

    #[tokio::test]
    async fn test_power() {
        let device = FakeDevice::new();
        device.set_power_status(3);
        let netmp = connect(&device, "alice").await.unwrap();
        let tsmp = netmp.register::<Tsmp>().await.unwrap();

        assert_eq!(tsmp.get_power_status().await.unwrap(), 3);
        tsmp.reboot().await.unwrap();
        tsmp.power_off().await.unwrap();
        assert_eq!(device.power_requests(), vec![POWER_REBOOT, POWER_OFF]);
    }

    #[tokio::test]
    async fn test_psn_state() {
        let device = FakeDevice::new();
        device.set_psn_state("alice", PSN_SIGNED_IN);
        let netmp = connect(&device, "alice").await.unwrap();
        let tsmp = netmp.register::<Tsmp>().await.unwrap();

        let state = tsmp.get_psn_state("alice").await.unwrap();
        assert_eq!(state, PsnState { result: 0, psn_state: Some(PSN_SIGNED_IN) });

        let state = tsmp.get_psn_state("mallory").await.unwrap();
        assert_eq!(state, PsnState { result: ERROR_UNKNOWN_USER, psn_state: None });
    }

    #[tokio::test]
    async fn test_pict() {
        let device = FakeDevice::new();
        device.set_write_chunk(5);
        device.set_pict(vec![
            Bytes::from_static(b"TGA header"),
            Bytes::new(),
            Bytes::from_static(b"pixels"),
        ]);
        let netmp = connect(&device, "alice").await.unwrap();
        let tsmp = netmp.register::<Tsmp>().await.unwrap();

        let chunks = collect(tsmp.get_pict(PictMode::Game).unwrap()).await;
        assert_eq!(chunks, vec![Bytes::from_static(b"TGA header"), Bytes::from_static(b"pixels")]);

        // the session is still usable after a multi-fragment response
        tsmp.get_power_status().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_pict() {
        let device = FakeDevice::new();
        let netmp = connect(&device, "alice").await.unwrap();
        let tsmp = netmp.register::<Tsmp>().await.unwrap();

        assert!(collect(tsmp.get_pict(PictMode::Auto).unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn test_not_registered() {
        let device = FakeDevice::new();
        let netmp = connect(&device, "alice").await.unwrap();
        let tsmp = netmp.register::<Tsmp>().await.unwrap();
        netmp.unregister::<Tsmp>().await.unwrap();

        let err = tsmp.get_info().await.unwrap_err();
        assert_eq!(DeciError::of(&err), Some(&DeciError::NotConnected(ProtocolId::TSMP)));
    }
}

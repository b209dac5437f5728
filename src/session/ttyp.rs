use std::time::Duration;

use crate::protocol::ttyp::{parse_notification, parse_port_states, PortState, TtyEvent, TtypCommand};
use crate::protocol::ProtocolConf;
use crate::session::{SessionLink, SubProtocol};
use crate::wire::header::ProtocolId;


/// Console output of the device
pub struct Ttyp {
    link: SessionLink,
}

impl SubProtocol for Ttyp {
    const PROTOCOL: ProtocolId = ProtocolId::TTYP;

    fn new(link: SessionLink) -> Self {
        Ttyp { link }
    }
}

impl Ttyp {
    pub async fn get_conf(&self) -> anyhow::Result<ProtocolConf> {
        let response = self.link.call(&TtypCommand::GetConf).await?;
        ProtocolConf::parse(&response, true)
    }

    pub async fn get_port_states(&self) -> anyhow::Result<Vec<PortState>> {
        let response = self.link.call(&TtypCommand::GetPortStates).await?;
        parse_port_states(&response)
    }

    /// The next queued TTYP event, without waiting
    pub fn read(&self) -> anyhow::Result<Option<TtyEvent>> {
        match self.link.poll_notification()? {
            Some(notification) => Ok(Some(parse_notification(&notification)?)),
            None => Ok(None),
        }
    }

    /// Waits up to `timeout` for the next TTYP event
    pub async fn read_sync(&self, timeout: Duration) -> anyhow::Result<Option<TtyEvent>> {
        match self.link.wait_notification(timeout).await? {
            Some(notification) => Ok(Some(parse_notification(&notification)?)),
            None => Ok(None),
        }
    }
}


#[cfg(test)]
mod test {
    use crate::protocol::ttyp::TtyOutput;
    use crate::test_util::connect;
    use crate::test_util::fake_device::FakeDevice;
    use super::*;

    fn line(message: &str) -> TtyOutput {
        TtyOutput {
            port: 0,
            category: 0,
            pid: 0x42,
            tid: 0x43,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_port_states() {
        let device = FakeDevice::new();
        let netmp = connect(&device, "alice").await.unwrap();
        let ttyp = netmp.register::<Ttyp>().await.unwrap();

        assert_eq!(ttyp.get_conf().await.unwrap().in_buf_size, Some(0x800));
        let ports = ttyp.get_port_states().await.unwrap();
        assert_eq!(ports, vec![
            PortState { port: 0, mask: 0xffff, state: 1 },
            PortState { port: 1, mask: 0x00ff, state: 0 },
        ]);
    }

    #[tokio::test]
    async fn test_output() {
        let device = FakeDevice::new();
        device.add_tty_line(line("booted\n"));

        let netmp = connect(&device, "alice").await.unwrap();
        let ttyp = netmp.register::<Ttyp>().await.unwrap();

        let event = ttyp.read_sync(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, Some(TtyEvent::Output(line("booted\n"))));

        device.emit_tty(&line("hello\n")).unwrap();
        let event = ttyp.read_sync(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, Some(TtyEvent::Output(line("hello\n"))));

        assert_eq!(ttyp.read().unwrap(), None);
        assert_eq!(ttyp.read_sync(Duration::from_millis(50)).await.unwrap(), None);
    }
}

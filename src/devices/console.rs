use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::ttyp::{PortState, TtyEvent};
use crate::session::manager::{NetmpLease, NetmpManager};
use crate::session::ttyp::Ttyp;


/// The device's console output, line by line
pub struct Console {
    lease: Option<NetmpLease>,
    ttyp: Arc<Ttyp>,
}

impl Console {
    pub async fn start(manager: &Arc<NetmpManager>, ip: IpAddr) -> anyhow::Result<Console> {
        let lease = manager.start(ip).await?;
        let ttyp = lease.netmp().register::<Ttyp>().await?;
        Ok(Console {
            lease: Some(lease),
            ttyp,
        })
    }

    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(lease) = self.lease.take() {
            let unregistered = lease.netmp().unregister::<Ttyp>().await;
            lease.release().await?;
            unregistered?;
        }
        Ok(())
    }

    pub async fn get_port_states(&self) -> anyhow::Result<Vec<PortState>> {
        self.ttyp.get_port_states().await
    }

    /// The next line of console output if one is queued, without waiting
    pub fn read(&self) -> anyhow::Result<Option<String>> {
        while let Some(event) = self.ttyp.read()? {
            if let Some(line) = console_line(&event) {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Waits up to `timeout` for the next line of console output
    pub async fn read_sync(&self, timeout: Duration) -> anyhow::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ttyp.read_sync(remaining).await? {
                None => return Ok(None),
                Some(event) => {
                    if let Some(line) = console_line(&event) {
                        return Ok(Some(line));
                    }
                }
            }
        }
    }
}

/// The device sends lone newlines between lines, those are dropped
fn console_line(event: &TtyEvent) -> Option<String> {
    match event {
        TtyEvent::Output(output) if output.message.len() > 1 => Some(output.to_string()),
        _ => None,
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use crate::devices::dualshock::{Button, DualShock};
    use crate::protocol::ttyp::{TtyOutput, TtypMsgType};
    use crate::test_util::fake_device::{device_ip, FakeDevice};
    use crate::test_util::test_config;
    use super::*;

    fn output(message: &str) -> TtyEvent {
        TtyEvent::Output(TtyOutput { port: 0, category: 1, pid: 0x10, tid: 0x2a, message: message.to_string() })
    }

    #[rstest]
    #[case::line(output("booted\n"), Some("0:1:2a:10:booted\n"))]
    #[case::newline(output("\n"), None)]
    #[case::empty(output(""), None)]
    #[case::ready(TtyEvent::InBuffReady, None)]
    #[case::error(TtyEvent::HeaderError(TtypMsgType::InvalHeadNotification), None)]
    fn test_console_line(#[case] event: TtyEvent, #[case] expected: Option<&str>) {
        assert_eq!(console_line(&event).as_deref(), expected);
    }

    #[tokio::test]
    async fn test_console_follows_controller() {
        let device = FakeDevice::new();
        device.add_tty_line(TtyOutput { port: 0, category: 0, pid: 7, tid: 8, message: "\n".to_string() });
        device.add_tty_line(TtyOutput { port: 0, category: 0, pid: 7, tid: 8, message: "ready\n".to_string() });

        let manager = NetmpManager::new(test_config("alice"), Arc::new(device.clone()));
        let console = Console::start(&manager, device_ip()).await.unwrap();
        assert_eq!(console.get_port_states().await.unwrap().len(), 2);
        assert_eq!(console.read_sync(Duration::from_secs(5)).await.unwrap().as_deref(), Some("0:0:8:7:ready\n"));

        let ds = DualShock::start(&manager, device_ip()).await.unwrap();
        assert_eq!(manager.ref_count(device_ip()), 2);
        ds.button_down(Button::Triangle);

        let mut lines = Vec::new();
        while let Some(line) = console.read_sync(Duration::from_secs(5)).await.unwrap() {
            let done = line.contains("buttons 1000");
            lines.push(line);
            if done {
                break;
            }
        }
        assert_eq!(lines.last().map(String::as_str), Some("0:0:1:1:buttons 1000\n"));

        ds.stop().await.unwrap();
        console.stop().await.unwrap();
        assert_eq!(manager.ref_count(device_ip()), 0);
        assert_eq!(device.num_clients(), 0);
    }

    #[tokio::test]
    async fn test_read_without_output() {
        let device = FakeDevice::new();
        let manager = NetmpManager::new(test_config("alice"), Arc::new(device.clone()));
        let console = Console::start(&manager, device_ip()).await.unwrap();

        assert_eq!(console.read().unwrap(), None);
        assert_eq!(console.read_sync(Duration::from_millis(50)).await.unwrap(), None);
        console.stop().await.unwrap();
    }
}

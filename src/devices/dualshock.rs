use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::protocol::ctrlp::{ALL_CONTROLLERS, MAX_EVENTS_PER_PLAY, PLAY_BUFFER_FULL};
use crate::session::ctrlp::Ctrlp;
use crate::session::manager::{NetmpLease, NetmpManager};


pub const DEFAULT_PRESS_TIME: Duration = Duration::from_millis(200);
pub const DEFAULT_POST_DELAY: Duration = Duration::from_millis(500);

/// DualShock 4 buttons as bits of the controller state
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Button {
    Share = 0x1,
    Options = 0x8,
    Up = 0x10,
    Right = 0x20,
    Down = 0x40,
    Left = 0x80,
    L2 = 0x100,
    R2 = 0x200,
    R1 = 0x400,
    L1 = 0x800,
    Triangle = 0x1000,
    Circle = 0x2000,
    Cross = 0x4000,
    Square = 0x8000,
    Ps = 0x10000,
}

/// An emulated controller. While it is running, a background task sends the current button
///  state to the device at the configured refresh interval, the way a physical controller
///  reports continuously.
pub struct DualShock {
    lease: Option<NetmpLease>,
    ctrlp: Arc<Ctrlp>,
    buttons: Arc<AtomicU32>,
    refresher: JoinHandle<()>,
}

impl DualShock {
    /// Takes the device's controller input. This fails with
    ///  [crate::error::DeciError::InUse] while another client holds it.
    pub async fn start(manager: &Arc<NetmpManager>, ip: IpAddr) -> anyhow::Result<DualShock> {
        let lease = manager.start(ip).await?;
        let ctrlp = lease.netmp().register::<Ctrlp>().await?;

        if let Err(e) = ctrlp.play_start(ALL_CONTROLLERS).await {
            lease.netmp().unregister::<Ctrlp>().await.ok();
            return Err(e);
        }

        let buttons = Arc::new(AtomicU32::new(0));
        let refresher = tokio::spawn(refresh_loop(
            ctrlp.clone(),
            buttons.clone(),
            manager.config().controller_refresh_interval,
        ));
        info!("controller emulation started on {:?}", ip);

        Ok(DualShock {
            lease: Some(lease),
            ctrlp,
            buttons,
            refresher,
        })
    }

    /// Stops playback and gives up the controller input
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.refresher.abort();

        let stopped = self.ctrlp.play_stop().await;
        let mut unregistered = Ok(());
        if let Some(lease) = self.lease.take() {
            unregistered = lease.netmp().unregister::<Ctrlp>().await;
            lease.release().await?;
        }
        stopped?;
        unregistered
    }

    /// The bitmask of currently pressed buttons
    pub fn buttons(&self) -> u32 {
        self.buttons.load(Ordering::Acquire)
    }

    /// Presses `button`, leaving the others as they are
    pub fn button_down(&self, button: Button) {
        self.buttons.fetch_or(button.into(), Ordering::AcqRel);
    }

    /// Releases `button`, leaving the others as they are
    pub fn button_up(&self, button: Button) {
        self.buttons.fetch_and(!u32::from(button), Ordering::AcqRel);
    }

    /// Holds `button` for `duration`, then releases it
    pub async fn button_press(&self, button: Button, duration: Duration) {
        self.button_down(button);
        tokio::time::sleep(duration).await;
        self.button_up(button);
    }

    /// Presses the buttons one after the other, pausing `post_delay` after each
    pub async fn press_buttons(&self, buttons: &[Button], duration: Duration, post_delay: Duration) {
        for &button in buttons {
            self.button_press(button, duration).await;
            tokio::time::sleep(post_delay).await;
        }
    }
}

impl Drop for DualShock {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

async fn refresh_loop(ctrlp: Arc<Ctrlp>, buttons: Arc<AtomicU32>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let state = buttons.load(Ordering::Acquire);
        match ctrlp.play_data(&[state; MAX_EVENTS_PER_PLAY]).await {
            Ok(PLAY_BUFFER_FULL) => debug!("playback buffer full, skipping controller update"),
            Ok(_) => {}
            Err(e) => {
                warn!("stopping controller updates: {}", e);
                return;
            }
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use crate::error::DeciError;
    use crate::test_util::fake_device::{device_ip, FakeDevice};
    use crate::test_util::{eventually, test_config};
    use super::*;

    fn manager(device: &FakeDevice, user: &str) -> Arc<NetmpManager> {
        NetmpManager::new(test_config(user), Arc::new(device.clone()))
    }

    #[rstest]
    #[case::up(Button::Up, 0x10)]
    #[case::left(Button::Left, 0x80)]
    #[case::l2(Button::L2, 0x100)]
    #[case::cross(Button::Cross, 0x4000)]
    #[case::square(Button::Square, 0x8000)]
    #[case::ps(Button::Ps, 0x10000)]
    fn test_button_bits(#[case] button: Button, #[case] bits: u32) {
        assert_eq!(u32::from(button), bits);
        assert_eq!(Button::try_from(bits).unwrap(), button);
    }

    #[tokio::test]
    async fn test_buttons_reach_the_device() {
        let device = FakeDevice::new();
        let manager = manager(&device, "alice");
        let ds = DualShock::start(&manager, device_ip()).await.unwrap();
        assert_eq!(device.ctrlp_owner().as_deref(), Some("alice@test-host,EXDGDECI4"));

        ds.button_down(Button::Cross);
        ds.button_down(Button::L1);
        assert_eq!(ds.buttons(), 0x4800);
        eventually(|| device.button_history().contains(&0x4800)).await;

        ds.button_up(Button::Cross);
        assert_eq!(ds.buttons(), 0x800);
        ds.button_up(Button::L1);
        eventually(|| device.button_history().last() == Some(&0)).await;

        ds.stop().await.unwrap();
        assert_eq!(device.ctrlp_owner(), None);
        assert_eq!(manager.ref_count(device_ip()), 0);
    }

    #[tokio::test]
    async fn test_press_buttons() {
        let device = FakeDevice::new();
        let manager = manager(&device, "alice");
        let ds = DualShock::start(&manager, device_ip()).await.unwrap();

        ds.press_buttons(&[Button::Up, Button::Circle], Duration::from_millis(50), Duration::from_millis(50)).await;
        assert_eq!(ds.buttons(), 0);
        ds.stop().await.unwrap();

        let pressed = device.button_history().into_iter()
            .filter(|&b| b != 0)
            .collect::<Vec<_>>();
        assert_eq!(pressed, vec![0x10, 0x2000]);
    }

    #[tokio::test]
    async fn test_only_one_controller_per_device() {
        let device = FakeDevice::new();
        let alice = manager(&device, "alice");
        let bob = manager(&device, "bob");

        let ds = DualShock::start(&alice, device_ip()).await.unwrap();
        let err = DualShock::start(&bob, device_ip()).await.err().unwrap();
        assert_eq!(DeciError::of(&err), Some(&DeciError::InUse));
        assert_eq!(bob.ref_count(device_ip()), 0);

        ds.stop().await.unwrap();
        let ds = DualShock::start(&bob, device_ip()).await.unwrap();
        assert_eq!(device.ctrlp_owner().as_deref(), Some("bob@test-host,EXDGDECI4"));
        ds.stop().await.unwrap();
    }
}

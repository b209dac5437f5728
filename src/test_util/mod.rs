//! Utilities for testing code that talks to a device. They are used by this crate's own tests and
//!  are exported for application testing, which is why they are part of the regular
//!  (non-#[cfg(test)]) code.

use std::sync::Arc;
use std::time::Duration;

use crate::config::DeciConfig;
use crate::session::netmp::Netmp;
use crate::test_util::fake_device::{device_ip, FakeDevice};

pub mod fake_device;


/// Configuration with short delays and timeouts, identifying as `user@test-host`
pub fn test_config(user: &str) -> Arc<DeciConfig> {
    let mut config = DeciConfig::new();
    config.request_timeout = Duration::from_secs(5);
    config.play_retry_delay = Duration::from_millis(1);
    config.controller_refresh_interval = Duration::from_millis(10);
    config.client_user = Some(user.to_string());
    config.client_host = Some("test-host".to_string());
    Arc::new(config)
}

/// Polls `condition` until it holds, failing the test after a few seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition did not become true in time");
}

/// Connects a new NETMP session to `device` as `user`
pub async fn connect(device: &FakeDevice, user: &str) -> anyhow::Result<Netmp> {
    Netmp::connect(device_ip(), test_config(user), Arc::new(device.clone())).await
}

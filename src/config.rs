use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct DeciConfig {
    /// The device listens for all DECI4 streams on this one TCP port
    pub port: u16,

    /// Upper bound for waiting on a response. The engine itself never times out; this is the
    ///  ceiling that session objects apply around each call.
    pub request_timeout: Duration,

    /// A length field beyond this is treated as a corrupt stream, aborting the session
    pub max_frame_len: usize,
    /// Notifications nobody polls are queued per stream up to this number, then the oldest ones
    ///  are dropped
    pub max_queued_notifications: usize,

    pub play_retry_delay: Duration,
    /// maximum number of attempts for replaying one raw block while the device reports a full
    ///  playback buffer
    pub play_retry_limit: u32,

    /// user name in the client id sent with NETMP CONNECT, defaults to the OS user
    pub client_user: Option<String>,
    /// host part of the client id, defaults to the local host name's IPv4 address
    pub client_host: Option<String>,
    pub udp_port: u16,

    /// cadence at which DualShock emulation re-sends the current button state
    pub controller_refresh_interval: Duration,
}

impl DeciConfig {
    pub fn new() -> DeciConfig {
        DeciConfig {
            port: 8550,
            request_timeout: Duration::from_secs(30),
            max_frame_len: 16*1024*1024,
            max_queued_notifications: 1024,
            play_retry_delay: Duration::from_millis(10),
            play_retry_limit: 1000,
            client_user: None,
            client_host: None,
            udp_port: 0,
            controller_refresh_interval: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("port must not be 0");
        }
        if self.request_timeout.is_zero() {
            bail!("request timeout must be positive");
        }
        if self.max_frame_len < 28 || self.max_frame_len > i32::MAX as usize {
            bail!("max frame length {} is out of range", self.max_frame_len);
        }
        if self.max_queued_notifications == 0 {
            bail!("notification queue must hold at least one notification");
        }
        if self.play_retry_limit == 0 {
            bail!("play retry limit must allow at least one attempt");
        }
        if self.controller_refresh_interval.is_zero() {
            bail!("controller refresh interval must be positive");
        }
        Ok(())
    }
}

impl Default for DeciConfig {
    fn default() -> Self {
        DeciConfig::new()
    }
}

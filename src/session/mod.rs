//! The session objects callers work with. A [netmp::Netmp] owns the connection to one device;
//!  registering a sub-protocol on it yields a [ctrlp::Ctrlp], [ttyp::Ttyp] or [tsmp::Tsmp]
//!  session that exposes the protocol's commands as typed methods. [manager::NetmpManager]
//!  shares one `Netmp` per device between independent users.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::DeciConfig;
use crate::engine::deci_queue::{DeciQueue, ResponseStream};
use crate::error::DeciError;
use crate::protocol::{check_result, expect_response, DeciCommand};
use crate::wire::frame::{Notification, Response};
use crate::wire::header::ProtocolId;

pub mod ctrlp;
pub mod manager;
pub mod netmp;
pub mod tsmp;
pub mod ttyp;


/// A session type that [netmp::Netmp::register] can create for its protocol
pub trait SubProtocol: Send + Sync + 'static {
    const PROTOCOL: ProtocolId;

    fn new(link: SessionLink) -> Self;
}


/// A session's handle to the link of one protocol: sends commands on it and waits for their
///  responses within the configured timeout, and polls the notifications arriving on it.
#[derive(Clone)]
pub struct SessionLink {
    queue: DeciQueue,
    protocol: ProtocolId,
    config: Arc<DeciConfig>,
}

impl SessionLink {
    pub fn new(queue: DeciQueue, protocol: ProtocolId, config: Arc<DeciConfig>) -> SessionLink {
        SessionLink {
            queue,
            protocol,
            config,
        }
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn config(&self) -> &DeciConfig {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.queue.is_alive() && self.queue.has_link(self.protocol)
    }

    /// Sends a command on this link and waits for its (single fragment) response. Any result
    ///  code is returned as is.
    pub async fn request<C: DeciCommand>(&self, command: &C) -> anyhow::Result<Response> {
        let mut fragments = self.request_stream(command)?;
        match fragments.next().await? {
            Some(response) => Ok(response),
            None => Err(DeciError::ConnectionClosed.into()),
        }
    }

    /// Like [SessionLink::request], but a non-zero result is an error
    pub async fn call<C: DeciCommand>(&self, command: &C) -> anyhow::Result<Response> {
        check_result(self.request(command).await?)
    }

    /// Sends a command whose response may span several fragments
    pub fn request_stream<C: DeciCommand>(&self, command: &C) -> anyhow::Result<ResponseFragments> {
        let frame = command.build_frame(self.queue.next_sequence())?;
        debug!("sending {:?} command 0x{:x} on {:?} link", C::PROTOCOL, command.msg_type(), self.protocol);

        let stream = self.queue.sendrecv(self.protocol, frame)?;
        Ok(ResponseFragments {
            stream,
            protocol: C::PROTOCOL,
            response_type: command.response_type(),
            timeout: self.config.request_timeout,
        })
    }

    /// The next queued notification, without waiting
    pub fn poll_notification(&self) -> anyhow::Result<Option<Notification>> {
        match self.queue.pop_notification(self.protocol)? {
            Some(frame) => Ok(Some(Notification::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Waits up to `timeout` for the next notification
    pub async fn wait_notification(&self, timeout: Duration) -> anyhow::Result<Option<Notification>> {
        match tokio::time::timeout(timeout, self.queue.wait_notification(self.protocol)).await {
            Ok(frame) => Ok(Some(Notification::from_frame(&frame?)?)),
            Err(_) => Ok(None),
        }
    }
}


/// The fragments of one response, each checked against the command it answers. Waiting for
///  each fragment is bounded by the request timeout.
pub struct ResponseFragments {
    stream: ResponseStream,
    protocol: ProtocolId,
    response_type: i32,
    timeout: Duration,
}

impl ResponseFragments {
    pub async fn next(&mut self) -> anyhow::Result<Option<Response>> {
        let fragment = match tokio::time::timeout(self.timeout, self.stream.next_fragment()).await {
            Ok(fragment) => fragment?,
            Err(_) => return Err(DeciError::Timeout(self.timeout).into()),
        };
        match fragment {
            Some(frame) => Ok(Some(expect_response(&frame, self.protocol, self.response_type)?)),
            None => Ok(None),
        }
    }
}

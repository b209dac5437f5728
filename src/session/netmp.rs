use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DeciConfig;
use crate::engine::connector::Connector;
use crate::engine::deci_queue::DeciQueue;
use crate::error::{AbortReason, DeciError};
use crate::protocol::netmp::{owner_of, parse_connect, parse_registered_list, NetmpCommand, RegInfo, ERROR_INUSE};
use crate::protocol::{check_result, ProtocolConf};
use crate::session::{SessionLink, SubProtocol};
use crate::wire::frame::Notification;
use crate::wire::header::ProtocolId;


/// suffix NETMP expects on every client id
const CLIENT_ID_SUFFIX: &str = "EXDGDECI4";

struct Registration {
    session: Arc<dyn Any + Send + Sync>,
    count: usize,
}

/// The NETMP session with one device. It owns the control stream and every sub-protocol stream
///  that was opened through [Netmp::register].
pub struct Netmp {
    addr: SocketAddr,
    config: Arc<DeciConfig>,
    connector: Arc<dyn Connector>,
    queue: DeciQueue,
    control: SessionLink,
    client_id: String,
    netmp_key: u32,
    registrations: Mutex<FxHashMap<ProtocolId, Registration>>,
}

impl Netmp {
    /// Opens the control stream to the device at `ip` (on the configured port) and performs the
    ///  CONNECT handshake
    pub async fn connect(ip: IpAddr, config: Arc<DeciConfig>, connector: Arc<dyn Connector>) -> anyhow::Result<Netmp> {
        config.validate()?;
        let addr = SocketAddr::new(ip, config.port);

        let queue = DeciQueue::new(config.max_frame_len, config.max_queued_notifications);
        let stream = connector.connect(addr).await?;
        queue.add_link(ProtocolId::NETMP, stream)?;

        let control = SessionLink::new(queue.clone(), ProtocolId::NETMP, config.clone());
        let client_id = client_id(&config).await;
        let connect = NetmpCommand::Connect {
            client_id: client_id.clone(),
            udp_port: config.udp_port,
        };
        let netmp_key = match control.call(&connect).await.and_then(|r| parse_connect(&r)) {
            Ok(key) => key,
            Err(e) => {
                queue.close();
                return Err(e);
            }
        };
        info!("connected to {:?} as {}", addr, client_id);

        Ok(Netmp {
            addr,
            config,
            connector,
            queue,
            control,
            client_id,
            netmp_key,
            registrations: Default::default(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn netmp_key(&self) -> u32 {
        self.netmp_key
    }

    pub fn is_connected(&self) -> bool {
        self.queue.is_alive()
    }

    /// Returns the session for protocol `T`, opening and registering its stream on first use.
    ///  Every call must be balanced by a call to [Netmp::unregister].
    ///
    /// Fails with [DeciError::InUse] if the device reports that another client holds the
    ///  protocol.
    pub async fn register<T: SubProtocol>(&self) -> anyhow::Result<Arc<T>> {
        let mut registrations = self.registrations.lock().await;

        if let Some(registration) = registrations.get_mut(&T::PROTOCOL) {
            // a protocol id is only ever registered with its own session type
            if let Ok(session) = registration.session.clone().downcast::<T>() {
                registration.count += 1;
                debug!("{:?} is now registered {} times", T::PROTOCOL, registration.count);
                return Ok(session);
            }
        }

        let stream = self.connector.connect(self.addr).await?;
        self.queue.add_link(T::PROTOCOL, stream)?;

        // REGISTER travels on the new stream, binding it to this session
        let link = SessionLink::new(self.queue.clone(), T::PROTOCOL, self.config.clone());
        let register = NetmpCommand::Register {
            netmp_key: self.netmp_key,
            protocol: T::PROTOCOL,
        };
        let registered = match link.request(&register).await {
            Ok(response) if response.result == ERROR_INUSE => Err(DeciError::InUse.into()),
            Ok(response) => check_result(response).map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            self.queue.remove_link(T::PROTOCOL);
            return Err(e);
        }

        info!("registered {:?}", T::PROTOCOL);
        let session = Arc::new(T::new(link));
        registrations.insert(T::PROTOCOL, Registration {
            session: session.clone(),
            count: 1,
        });
        Ok(session)
    }

    /// Releases one registration of protocol `T`. The protocol is unregistered on the device and
    ///  its stream closed when the last registration is released.
    pub async fn unregister<T: SubProtocol>(&self) -> anyhow::Result<()> {
        self.unregister_protocol(T::PROTOCOL).await
    }

    pub async fn unregister_protocol(&self, protocol: ProtocolId) -> anyhow::Result<()> {
        let mut registrations = self.registrations.lock().await;

        let registration = match registrations.get_mut(&protocol) {
            Some(registration) => registration,
            None => return Err(DeciError::NotRegistered(protocol).into()),
        };
        registration.count -= 1;
        if registration.count > 0 {
            debug!("{:?} is still registered {} times", protocol, registration.count);
            return Ok(());
        }
        registrations.remove(&protocol);

        let result = self.control.call(&NetmpCommand::Unregister { protocol }).await;
        self.queue.remove_link(protocol);
        info!("unregistered {:?}", protocol);
        result.map(|_| ())
    }

    /// The number of outstanding registrations for a protocol
    pub async fn registration_count(&self, protocol: ProtocolId) -> usize {
        self.registrations.lock().await
            .get(&protocol)
            .map(|r| r.count)
            .unwrap_or(0)
    }

    /// Evicts whichever client currently holds the device's exclusive input
    pub async fn force_disconnect(&self) -> anyhow::Result<()> {
        info!("forcing the current owner of {:?} off the device", self.addr);
        self.control.call(&NetmpCommand::ForceDisconnect).await?;
        Ok(())
    }

    pub async fn get_conf(&self) -> anyhow::Result<ProtocolConf> {
        let response = self.control.call(&NetmpCommand::GetConf).await?;
        ProtocolConf::parse(&response, false)
    }

    pub async fn get_registered_list(&self) -> anyhow::Result<Vec<RegInfo>> {
        let response = self.control.call(&NetmpCommand::GetRegisteredList).await?;
        parse_registered_list(&response)
    }

    /// The client id of whoever holds the device's exclusive input, if anybody does
    pub async fn get_owner(&self) -> anyhow::Result<Option<String>> {
        let list = self.get_registered_list().await?;
        Ok(owner_of(&list).map(|s| s.to_string()))
    }

    /// The next queued NETMP notification, without waiting
    pub fn get_notification(&self) -> anyhow::Result<Option<Notification>> {
        self.control.poll_notification()
    }

    /// Unregisters everything that is still registered, then disconnects the control stream.
    ///  Further calls on this session or its sub-sessions fail with
    ///  [DeciError::ConnectionClosed].
    ///
    /// On a session that went down before, this fails with the reason it went down, e.g.
    ///  [DeciError::ForcedDisconnect]. Otherwise all streams are closed even if some of the
    ///  commands fail, and the first failure is returned.
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        let remaining = std::mem::take(&mut *self.registrations.lock().await);

        if let Some(reason) = self.queue.abort_reason() {
            self.queue.close();
            return match reason {
                AbortReason::Closed => Ok(()),
                other => Err(other.to_error().into()),
            };
        }

        let mut first_error = None;
        for protocol in remaining.keys() {
            if let Err(e) = self.control.call(&NetmpCommand::Unregister { protocol: *protocol }).await {
                warn!("error unregistering {:?} during disconnect: {}", protocol, e);
                first_error.get_or_insert(e);
            }
            self.queue.remove_link(*protocol);
        }
        if let Err(e) = self.control.call(&NetmpCommand::Disconnect).await {
            warn!("error disconnecting from {:?}: {}", self.addr, e);
            first_error.get_or_insert(e);
        }

        self.queue.close();
        info!("disconnected from {:?}", self.addr);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tears down all streams without talking to the device
    pub fn close(&self) {
        self.queue.close();
    }
}

impl Drop for Netmp {
    fn drop(&mut self) {
        // sub-sessions share the queue and would otherwise keep the streams open
        self.queue.close();
    }
}


/// `user@host,EXDGDECI4`, identifying this client to the device and to other clients. Without
///  an explicit host, this is the local host name resolved to its IPv4 address.
async fn client_id(config: &DeciConfig) -> String {
    let user = config.client_user.clone()
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .unwrap_or_else(|| "deci4".to_string());
    let host = match &config.client_host {
        Some(host) => host.clone(),
        None => resolve_host(&gethostname::gethostname().to_string_lossy()).await,
    };
    format!("{}@{},{}", user, host, CLIENT_ID_SUFFIX)
}

/// The first IPv4 address `host_name` resolves to, or the name itself if it does not resolve
async fn resolve_host(host_name: &str) -> String {
    match tokio::net::lookup_host((host_name, 0)).await {
        Ok(mut addrs) => {
            match addrs.find(|a| a.is_ipv4()) {
                Some(addr) => addr.ip().to_string(),
                None => host_name.to_string(),
            }
        }
        Err(e) => {
            debug!("could not resolve {}, using the bare host name: {}", host_name, e);
            host_name.to_string()
        }
    }
}

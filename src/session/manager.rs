use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::DeciConfig;
use crate::engine::connector::Connector;
use crate::session::netmp::Netmp;


struct SharedSession {
    netmp: Arc<Netmp>,
    count: usize,
}

/// Shares one connected [Netmp] per device address between independent users. Each user holds
///  a [NetmpLease]; the session is disconnected when the last lease for its address is released.
pub struct NetmpManager {
    config: Arc<DeciConfig>,
    connector: Arc<dyn Connector>,
    sessions: Mutex<FxHashMap<IpAddr, SharedSession>>,
    /// serializes the creation of sessions, so two callers can not both connect to one device
    connecting: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl NetmpManager {
    pub fn new(config: Arc<DeciConfig>, connector: Arc<dyn Connector>) -> Arc<NetmpManager> {
        Arc::new(NetmpManager {
            config,
            connector,
            sessions: Default::default(),
            connecting: Default::default(),
        })
    }

    pub fn config(&self) -> &Arc<DeciConfig> {
        &self.config
    }

    /// Returns a lease on the session for `ip`, connecting on first use. A session that went
    ///  down in the meantime is replaced by a new one.
    pub async fn start(self: &Arc<Self>, ip: IpAddr) -> anyhow::Result<NetmpLease> {
        let _connecting = self.connecting.lock().await;

        if let Some(netmp) = self.try_share(ip) {
            return Ok(self.lease(ip, netmp));
        }

        let netmp = Arc::new(Netmp::connect(ip, self.config.clone(), self.connector.clone()).await?);
        lock(&self.sessions).insert(ip, SharedSession {
            netmp: netmp.clone(),
            count: 1,
        });
        info!("started shared session for {:?}", ip);
        Ok(self.lease(ip, netmp))
    }

    fn try_share(&self, ip: IpAddr) -> Option<Arc<Netmp>> {
        let mut sessions = lock(&self.sessions);
        let shared = sessions.get_mut(&ip)?;
        if !shared.netmp.is_connected() {
            warn!("shared session for {:?} is no longer connected - reconnecting", ip);
            sessions.remove(&ip);
            return None;
        }
        shared.count += 1;
        debug!("sharing session for {:?}, {} users", ip, shared.count);
        Some(shared.netmp.clone())
    }

    fn lease(self: &Arc<Self>, ip: IpAddr, netmp: Arc<Netmp>) -> NetmpLease {
        NetmpLease {
            manager: self.clone(),
            ip,
            netmp,
            released: false,
        }
    }

    /// The number of leases on the session for `ip`
    pub fn ref_count(&self, ip: IpAddr) -> usize {
        lock(&self.sessions).get(&ip)
            .map(|s| s.count)
            .unwrap_or(0)
    }

    /// Drops one reference, returning the session if that was the last one for its address
    fn release(&self, ip: IpAddr, netmp: &Arc<Netmp>) -> Option<Arc<Netmp>> {
        let mut sessions = lock(&self.sessions);
        let shared = match sessions.get_mut(&ip) {
            // the session was replaced after it went down, the lease refers to the old one
            Some(shared) if Arc::ptr_eq(&shared.netmp, netmp) => shared,
            _ => return None,
        };
        shared.count -= 1;
        if shared.count > 0 {
            return None;
        }
        sessions.remove(&ip).map(|s| s.netmp)
    }
}


/// A user's share of a managed [Netmp]. Releasing the last lease for a device disconnects from
///  it; [NetmpLease::release] does that in an orderly fashion, dropping a lease does it in the
///  background.
pub struct NetmpLease {
    manager: Arc<NetmpManager>,
    ip: IpAddr,
    netmp: Arc<Netmp>,
    released: bool,
}

impl NetmpLease {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn netmp(&self) -> &Netmp {
        &self.netmp
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        match self.manager.release(self.ip, &self.netmp) {
            Some(last) => {
                info!("last user of {:?} is gone - disconnecting", self.ip);
                last.disconnect().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for NetmpLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(last) = self.manager.release(self.ip, &self.netmp) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = last.disconnect().await {
                            warn!("error disconnecting from {:?}: {}", last.addr(), e);
                        }
                    });
                }
                Err(_) => last.close(),
            }
        }
    }
}

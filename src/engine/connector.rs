use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;


/// A bidirectional byte stream that can carry DECI4 frames
pub trait DeciStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl <T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DeciStream for T {}


/// Opens the streams of a session: the control stream first, then one per registered
///  sub-protocol, all to the same address.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn DeciStream>>;
}


pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn DeciStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("connected to {:?} from {:?}", addr, stream.local_addr()?);
        Ok(Box::new(stream))
    }
}

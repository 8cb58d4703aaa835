//! How we reach a peer. The pool only ever sees a byte stream, so tests (or a proxy) can plug
//! in their own [`Connector`].

use std::io;

use futures::future::BoxFuture;
use log::debug;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

use super::address::PeerAddress;

/// Anything we can speak the p2p protocol over
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens byte streams to peers
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, address: &PeerAddress) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Plain TCP, the v1 transport
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, address: &PeerAddress) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let address = address.socket_addr();
        Box::pin(async move {
            let stream = TcpStream::connect(address).await?;
            // Data is buffered until there is enough to send out
            stream.set_nodelay(false)?;

            debug!("TCP connection to {address} established");
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

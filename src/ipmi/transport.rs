//! Request transports for a BMC session.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{ProtocolError, RawRequest, RawResponse};

/// Largest IPMI LAN datagram we accept.
const MAX_DATAGRAM: usize = 1024;

/// Receives decoded-framing requests and sends responses for one BMC.
///
/// `recv` must be cancel safe: the session drops it whenever another event
/// wins the select.
#[async_trait]
pub trait ChassisTransport: Send {
    /// Wait for the next request. A framing error still yields the peer so
    /// the session can answer with a completion code.
    async fn recv(&mut self) -> io::Result<(SocketAddr, Result<RawRequest, ProtocolError>)>;

    async fn send(&mut self, peer: SocketAddr, response: &RawResponse) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// One unframed request body per UDP datagram.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }
}

#[async_trait]
impl ChassisTransport for UdpTransport {
    async fn recv(&mut self) -> io::Result<(SocketAddr, Result<RawRequest, ProtocolError>)> {
        let (len, peer) = self.socket.recv_from(&mut self.buf).await?;
        debug!(peer = %peer, len, "Datagram received");
        Ok((peer, RawRequest::from_frame(&self.buf[..len])))
    }

    async fn send(&mut self, peer: SocketAddr, response: &RawResponse) -> io::Result<()> {
        self.socket.send_to(&response.to_frame(), peer).await?;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_round_trip() {
        let mut transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server = transport.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0x00, 0x01], server).await.unwrap();

        let (peer, request) = transport.recv().await.unwrap();
        assert_eq!(request.unwrap(), RawRequest::new(0x00, 0x01, vec![]));

        transport
            .send(peer, &RawResponse::ok(vec![0x01, 0x00, 0x00]))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn runt_datagram_reports_truncated() {
        let mut transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server = transport.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0x00], server).await.unwrap();

        let (_, request) = transport.recv().await.unwrap();
        assert_eq!(request, Err(ProtocolError::Truncated(1)));
    }
}

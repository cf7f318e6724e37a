//! Helpers to simplify work with UdpSocket.

use crate::{
    adc,
    conn::Frame,
    error::{Error, Result},
    nmdc,
};
use async_trait::async_trait;
use std::{io, net::SocketAddr};
use tokio::net::UdpSocket;

/// Datagram transport used for search results.
#[async_trait]
pub trait SocketTrait {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl SocketTrait for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, target).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// What travels in a single datagram.
#[derive(Clone, Debug)]
pub(crate) enum Datagram {
    /// `$SR ...|`
    Nmdc(nmdc::Message),
    /// `URES <cid> ...\n`
    Adc(adc::Packet),
}

impl Datagram {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // A datagram holds exactly one message, the terminator is optional.
        if bytes.first() == Some(&b'$') {
            let bytes = bytes.strip_suffix(b"|").unwrap_or(bytes);
            return nmdc::Message::decode(bytes).map(Self::Nmdc);
        }

        let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
        match adc::Message::decode(bytes)? {
            adc::Message::Packet(packet) => Ok(Self::Adc(packet)),
            adc::Message::KeepAlive => Err(Error::protocol("empty datagram")),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Nmdc(message) => message.to_bytes(),
            Self::Adc(packet) => adc::Message::Packet(packet.clone()).to_bytes(),
        }
    }
}

pub(crate) struct Socket(Box<dyn SocketTrait + Send + Sync + 'static>, SocketAddr);

impl Socket {
    pub fn new<S: SocketTrait + Send + Sync + 'static>(inner: S) -> io::Result<Self> {
        let inner = Box::new(inner);
        let local_addr = inner.local_addr()?;
        Ok(Self(inner, local_addr))
    }

    pub async fn send(&self, datagram: &Datagram, addr: SocketAddr) -> io::Result<()> {
        log::trace!("Sending to {addr:?} {datagram:?}");
        // A result split over two datagrams is useless, so there is no partial send retry.
        self.0.send_to(&datagram.encode(), &addr).await
    }

    /// This function is cancel safe: https://docs.rs/tokio/1.12.0/tokio/net/struct.UdpSocket.html#cancel-safety-6
    pub async fn recv(&self) -> io::Result<(Datagram, SocketAddr)> {
        let mut buffer = vec![0u8; 65535];
        loop {
            let (size, addr) = self.0.recv_from(&mut buffer).await?;
            match Datagram::decode(&buffer[..size]) {
                Ok(datagram) => return Ok((datagram, addr)),
                Err(error) => {
                    log::warn!("Failed to decode datagram from {addr:?}: {error}");
                }
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.1
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_dialects() {
        let datagram = Datagram::decode(
            b"$SR bob share\\a.txt\x0510 1/2\x05TTH:UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY (127.0.0.1:411)|",
        )
        .unwrap();
        match datagram {
            Datagram::Nmdc(nmdc::Message::SearchReply(reply)) => {
                assert_eq!(reply.nick, "bob");
                assert_eq!(reply.size, Some(10));
            }
            other => panic!("unexpected {:?}", other),
        }

        let datagram = Datagram::decode(
            b"URES UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY FN/share/a.txt SI10 SL1\n",
        )
        .unwrap();
        match datagram {
            Datagram::Adc(packet) => {
                assert_eq!(packet.command, adc::RES);
                assert_eq!(packet.get("FN"), Some("/share/a.txt"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(Datagram::decode(b"\n").is_err());
    }

    #[tokio::test]
    async fn send_and_receive() {
        let a = Socket::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()).unwrap();
        let b = Socket::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()).unwrap();

        a.send(&Datagram::Nmdc(nmdc::Message::MaxedOut), b.local_addr())
            .await
            .unwrap();
        let (datagram, from) = b.recv().await.unwrap();

        assert_eq!(from, a.local_addr());
        assert!(matches!(datagram, Datagram::Nmdc(nmdc::Message::MaxedOut)));
    }
}

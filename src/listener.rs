//! TCP, TLS and UDP listeners of an active client.

use crate::{
    adc,
    client::{ClientEvent, Inner},
    config::{Config, PeerEncryptionMode},
    error::Result,
    link, nmdc,
    search::SearchResult,
    socket::{Datagram, Socket},
};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{
    net::{TcpListener, UdpSocket},
    task,
};

pub(crate) struct Listeners {
    tcp: Option<TcpListener>,
    tls: Option<TcpListener>,
    pub udp: Arc<Socket>,
    receive_udp: bool,
}

/// Binds what the configuration asks for. Passive clients get an unbound UDP socket, used
/// only to answer active searchers.
pub(crate) async fn bind(config: &Config) -> Result<Listeners> {
    let any = |port: u16| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    if config.is_passive {
        return Ok(Listeners {
            tcp: None,
            tls: None,
            udp: Arc::new(Socket::new(UdpSocket::bind(any(0)).await?)?),
            receive_udp: false,
        });
    }

    let tcp = match config.tcp_port {
        Some(port) if config.peer_encryption_mode != PeerEncryptionMode::Force => {
            Some(TcpListener::bind(any(port)).await?)
        }
        _ => None,
    };

    let tls = match config.tls_port {
        Some(port) if config.peer_encryption_mode != PeerEncryptionMode::Disable => {
            Some(TcpListener::bind(any(port)).await?)
        }
        _ => None,
    };

    let udp = UdpSocket::bind(any(config.udp_port.unwrap_or(0))).await?;

    Ok(Listeners {
        tcp,
        tls,
        udp: Arc::new(Socket::new(udp)?),
        receive_udp: true,
    })
}

impl Listeners {
    pub fn tcp_port(&self) -> Option<u16> {
        port_of(&self.tcp)
    }

    pub fn tls_port(&self) -> Option<u16> {
        port_of(&self.tls)
    }

    pub fn spawn(self, inner: &Arc<Inner>) {
        if let Some(listener) = self.tcp {
            task::spawn(run_tcp(inner.clone(), listener, false));
        }

        if let Some(listener) = self.tls {
            task::spawn(run_tcp(inner.clone(), listener, true));
        }

        if self.receive_udp {
            task::spawn(run_udp(inner.clone(), self.udp));
        }
    }
}

fn port_of(listener: &Option<TcpListener>) -> Option<u16> {
    listener
        .as_ref()
        .and_then(|listener| listener.local_addr().ok())
        .map(|addr| addr.port())
}

async fn run_tcp(inner: Arc<Inner>, listener: TcpListener, secure: bool) {
    let mut shutdown = inner.subscribe_shutdown();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait_for(|down| *down) => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                log::debug!("Accepted {} peer connection from {}", scheme(secure), addr);
                task::spawn(link::accept(inner.clone(), stream, addr, secure));
            }
            Err(error) => log::warn!("Failed to accept a peer connection: {}", error),
        }
    }

    log::debug!("{} listener stopped", scheme(secure));
}

fn scheme(secure: bool) -> &'static str {
    if secure {
        "TLS"
    } else {
        "TCP"
    }
}

async fn run_udp(inner: Arc<Inner>, socket: Arc<Socket>) {
    let mut shutdown = inner.subscribe_shutdown();

    loop {
        let received = tokio::select! {
            received = socket.recv() => received,
            _ = shutdown.wait_for(|down| *down) => break,
        };

        match received {
            Ok((datagram, addr)) => on_datagram(&inner, datagram, addr),
            Err(error) => log::warn!("Failed to receive a datagram: {}", error),
        }
    }

    log::debug!("UDP listener stopped");
}

/// Search results from active peers.
fn on_datagram(inner: &Inner, datagram: Datagram, addr: SocketAddr) {
    let state = inner.lock();

    let result = match datagram {
        Datagram::Nmdc(nmdc::Message::SearchReply(reply)) => state
            .peers
            .get(&reply.nick)
            .map(|peer| SearchResult::from_nmdc(peer.clone(), &reply, true)),
        Datagram::Adc(packet) if packet.command == adc::RES => match &packet.header {
            adc::Header::Udp(cid) => state
                .peers
                .by_cid(cid)
                .and_then(|peer| SearchResult::from_adc(peer.clone(), &packet, true)),
            _ => None,
        },
        other => {
            log::debug!("Ignoring datagram from {}: {:?}", addr, other);
            return;
        }
    };

    match result {
        Some(result) => inner.emit(ClientEvent::SearchResult(result)),
        None => log::debug!("Dropping search result from unknown peer at {}", addr),
    }
}

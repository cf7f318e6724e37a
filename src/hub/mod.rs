//! The hub session: connect, log in, keep the user list and relay everything else.

use crate::{
    adc,
    client::{ClientEvent, Inner, State},
    config::Protocol,
    conn::{self, BoxStream, ConnOptions, ConnWriter},
    error::{Error, Result},
    nmdc,
    peer::Peer,
    search::SearchRequest,
    socket::Datagram,
    transfer::download::PendingKey,
};
use futures_util::future;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    task,
    time::{self, Instant},
};

mod adc_session;
mod nmdc_session;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(120);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum HubPhase {
    #[default]
    Disconnected,
    Connecting,
    /// Exchanging features and identity.
    Handshaking,
    /// Waiting for the hub to accept our nick and password.
    Authenticating,
    /// Logged in with a complete user list.
    Initialized,
    Failed,
}

#[derive(Default)]
pub(crate) struct HubState {
    pub phase: HubPhase,
    pub writer: Option<HubWriter>,
    pub name: String,
    pub topic: String,
    pub sid: Option<adc::Sid>,
    /// Our address as seen on the hub connection.
    pub local_ip: Option<IpAddr>,
}

#[derive(Clone)]
pub(crate) enum HubWriter {
    Nmdc(ConnWriter<nmdc::Message>),
    Adc(ConnWriter<adc::Message>),
}

impl HubWriter {
    pub fn close(&self) {
        match self {
            Self::Nmdc(writer) => writer.close(),
            Self::Adc(writer) => writer.close(),
        }
    }

    async fn closed(&self) {
        match self {
            Self::Nmdc(writer) => writer.closed().await,
            Self::Adc(writer) => writer.closed().await,
        }
    }

    fn keepalive(&self) {
        match self {
            Self::Nmdc(writer) => writer.send(&nmdc::Message::KeepAlive),
            Self::Adc(writer) => writer.send(&adc::Message::KeepAlive),
        }
    }
}

// ----------------------------------------------------------------------------//

/// Starts the hub session unless one is already running.
pub(crate) fn connect(inner: &Arc<Inner>) {
    {
        let mut state = inner.lock();
        if state.terminated
            || !matches!(state.hub.phase, HubPhase::Disconnected | HubPhase::Failed)
        {
            return;
        }
        state.hub.phase = HubPhase::Connecting;
    }

    task::spawn(run(inner.clone()));
}

async fn run(inner: Arc<Inner>) {
    let result = session(&inner).await;

    let terminated = {
        let mut state = inner.lock();
        state.hub.phase = HubPhase::Failed;
        state.hub.writer = None;

        for peer in state.peers.clear() {
            inner.emit(ClientEvent::PeerDisconnected(peer));
        }

        if let Err(error) = result {
            if state.terminated {
                log::debug!("Hub session ended: {}", error);
            } else {
                log::error!("Hub session with {} failed: {}", inner.url, error);
                inner.emit(ClientEvent::HubError(error));
            }
        }

        state.terminated
    };

    // Nothing works without the hub.
    if !terminated {
        inner.shutdown();
    }
}

async fn session(inner: &Arc<Inner>) -> Result<()> {
    let stream = dial(inner).await?;

    let options = ConnOptions {
        read_timeout: None,
        write_timeout: Some(WRITE_TIMEOUT),
    };

    match inner.url.protocol {
        Protocol::Nmdc => {
            let (reader, writer) = conn::split::<nmdc::Message>(stream, options);
            let writer = install(inner, HubWriter::Nmdc(writer.clone()))
                .map(|_| writer)?;
            nmdc_session::run(inner, reader, writer).await
        }
        Protocol::Adc => {
            let (reader, writer) = conn::split::<adc::Message>(stream, options);
            let writer = install(inner, HubWriter::Adc(writer.clone()))
                .map(|_| writer)?;
            adc_session::run(inner, reader, writer).await
        }
    }
}

/// Connects to the hub, trying `hub-conn-tries` times.
async fn dial(inner: &Arc<Inner>) -> Result<BoxStream> {
    let url = &inner.url;
    let tries = inner.config.hub_conn_tries.max(1);
    let mut shutdown = inner.subscribe_shutdown();
    let mut last_error = Error::Closed;

    for attempt in 1..=tries {
        log::info!("Connecting to {} (attempt {}/{})", url, attempt, tries);

        let connected = tokio::select! {
            connected = conn::connect(&url.host, url.port, CONNECT_TIMEOUT, true) => connected,
            _ = shutdown.wait_for(|down| *down) => return Err(Error::Cancelled),
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(error) => {
                log::debug!("Failed to connect to {}: {}", url, error);
                last_error = error;
                continue;
            }
        };

        let local_ip = stream.local_addr()?.ip();
        {
            let mut state = inner.lock();
            state.hub.local_ip = Some(local_ip);
            state.hub.phase = HubPhase::Handshaking;
        }

        if !url.secure {
            return Ok(Box::new(stream));
        }

        let (stream, _) = inner.tls.connect(&url.host, stream).await?;
        return Ok(Box::new(stream));
    }

    Err(last_error)
}

/// Publishes the writer so other tasks can talk to the hub, and starts the keepalive.
fn install(inner: &Arc<Inner>, writer: HubWriter) -> Result<()> {
    {
        let mut state = inner.lock();
        if state.terminated {
            writer.close();
            return Err(Error::Cancelled);
        }
        state.hub.writer = Some(writer.clone());
    }

    if !inner.config.hub_disable_keepalive {
        task::spawn(keepalive(inner.clone(), writer));
    }

    Ok(())
}

async fn keepalive(inner: Arc<Inner>, writer: HubWriter) {
    let mut shutdown = inner.subscribe_shutdown();
    let mut ticker = time::interval_at(Instant::now() + KEEPALIVE_PERIOD, KEEPALIVE_PERIOD);

    loop {
        tokio::select! {
            _ = ticker.tick() => writer.keepalive(),
            _ = writer.closed() => break,
            _ = shutdown.wait_for(|down| *down) => break,
        }
    }
}

/// Sends search results to an active searcher, off the session task.
fn send_datagrams(inner: &Arc<Inner>, addr: SocketAddr, datagrams: Vec<Datagram>) {
    if datagrams.is_empty() {
        return;
    }

    let socket = inner.udp.clone();

    task::spawn(async move {
        let sends = datagrams.iter().map(|datagram| socket.send(datagram, addr));

        for result in future::join_all(sends).await {
            if let Err(error) = result {
                log::debug!("Failed to send search result to {}: {}", addr, error);
            }
        }
    });
}

// ----------------------------------------------------------------------------//

fn not_connected() -> Error {
    Error::protocol("not connected to the hub")
}

/// Re-sends our info after the share changed.
pub(crate) fn announce_share(inner: &Inner, state: &State) {
    if state.hub.phase != HubPhase::Initialized {
        return;
    }

    match &state.hub.writer {
        Some(HubWriter::Nmdc(writer)) => nmdc_session::announce_share(inner, state, writer),
        Some(HubWriter::Adc(writer)) => adc_session::announce_share(state, writer),
        None => (),
    }
}

pub(crate) fn send_public(inner: &Inner, state: &State, text: &str) -> Result<()> {
    match &state.hub.writer {
        Some(HubWriter::Nmdc(writer)) => {
            writer.send(&nmdc::Message::Chat {
                nick: inner.config.nick.clone(),
                text: text.to_owned(),
            });
            Ok(())
        }
        Some(HubWriter::Adc(writer)) => adc_session::send_public(state, writer, text),
        None => Err(not_connected()),
    }
}

pub(crate) fn send_private(inner: &Inner, state: &State, peer: &Peer, text: &str) -> Result<()> {
    match &state.hub.writer {
        Some(HubWriter::Nmdc(writer)) => {
            writer.send(&nmdc::Message::PrivateChat {
                to: peer.nick.clone(),
                from: inner.config.nick.clone(),
                text: text.to_owned(),
            });
            Ok(())
        }
        Some(HubWriter::Adc(writer)) => adc_session::send_private(state, writer, peer, text),
        None => Err(not_connected()),
    }
}

pub(crate) fn send_search(inner: &Inner, state: &State, request: &SearchRequest) -> Result<()> {
    if state.hub.phase != HubPhase::Initialized {
        return Err(not_connected());
    }

    match &state.hub.writer {
        Some(HubWriter::Nmdc(writer)) => nmdc_session::send_search(inner, state, writer, request),
        Some(HubWriter::Adc(writer)) => adc_session::send_search(state, writer, request),
        None => Err(not_connected()),
    }
}

/// Asks `nick` to open a link to us, or tells it where to connect. Returns the key the
/// resulting link will be matched by.
pub(crate) fn request_connection(inner: &Inner, state: &State, nick: &str) -> Result<PendingKey> {
    match &state.hub.writer {
        Some(HubWriter::Nmdc(writer)) => {
            nmdc_session::request_connection(inner, state, writer, nick)
        }
        Some(HubWriter::Adc(writer)) => adc_session::request_connection(inner, state, writer, nick),
        None => Err(not_connected()),
    }
}

//! Peer links: direct client to client connections that carry transfers.
//!
//! A link starts with a handshake in the hub's dialect that settles who the peer is and which
//! way data flows. Download links then take jobs from the download queue, upload links answer
//! the peer's requests until it goes quiet.

use crate::{
    adc,
    client::{Inner, LinkEntry},
    config::Protocol,
    conn::{self, BoxStream, ConnOptions, ConnReader, ConnWriter, Frame},
    error::{Error, Result, TransferError},
    nmdc,
    tiger::TigerHash,
    transfer::{
        download::{self, Job, PendingKey},
        upload, Direction, TransferRequest,
    },
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc, task, time};

mod adc_link;
mod nmdc_link;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TRIES: u32 = 3;
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// What we know about a peer before dialing it.
#[derive(Clone, Debug)]
pub(crate) enum Greeting {
    Nmdc,
    Adc {
        token: String,
        peer_cid: TigerHash,
        /// Expected certificate fingerprint, from the peer's `KP`.
        fingerprint: Option<String>,
    },
}

/// A link after its handshake.
pub(crate) struct Handshake<F> {
    pub nick: String,
    pub direction: Direction,
    /// The download request this link answers, if any.
    pub pending: Option<PendingKey>,
    /// Whether both sides accept compressed transfers.
    pub compression: bool,
    pub reader: ConnReader<F>,
    pub writer: ConnWriter<F>,
}

/// What arrives on a link, in either dialect.
#[derive(Debug)]
pub(crate) enum Incoming {
    Get(TransferRequest),
    Snd(TransferRequest),
    NoSlots,
    NotAvailable,
    Error(String),
    KeepAlive,
    Other(String),
}

/// Transfer messages of a link dialect.
pub(crate) trait LinkFrame: Frame {
    fn get(request: &TransferRequest) -> Self;
    fn snd(request: &TransferRequest) -> Self;
    fn no_slots() -> Self;
    fn not_available() -> Self;
    fn error(text: &str) -> Self;
    fn classify(self) -> Incoming;
}

fn options() -> ConnOptions {
    ConnOptions {
        read_timeout: Some(READ_TIMEOUT),
        write_timeout: Some(WRITE_TIMEOUT),
    }
}

// ----------------------------------------------------------------------------//

/// Connects to a peer that asked for it, runs the link and logs how it ended.
pub(crate) async fn dial(
    inner: Arc<Inner>,
    host: String,
    port: u16,
    secure: bool,
    greeting: Greeting,
) {
    match dial_and_serve(&inner, &host, port, secure, greeting).await {
        Ok(()) | Err(Error::Cancelled) | Err(Error::Closed) => {
            log::debug!("Link to {}:{} closed", host, port)
        }
        Err(error) => log::debug!("Link to {}:{} failed: {}", host, port, error),
    }
}

async fn dial_and_serve(
    inner: &Arc<Inner>,
    host: &str,
    port: u16,
    secure: bool,
    greeting: Greeting,
) -> Result<()> {
    let expected = match &greeting {
        Greeting::Adc { fingerprint, .. } => fingerprint.clone(),
        Greeting::Nmdc => None,
    };

    let stream = open(inner, host, port, secure, expected.as_deref()).await?;

    match greeting {
        Greeting::Nmdc => {
            let (reader, writer) = conn::split(stream, options());
            let handshake = nmdc_link::dial(inner, reader, writer).await?;
            serve(inner, handshake).await
        }
        Greeting::Adc {
            token, peer_cid, ..
        } => {
            let (reader, writer) = conn::split(stream, options());
            let handshake = adc_link::dial(inner, reader, writer, token, peer_cid).await?;
            serve(inner, handshake).await
        }
    }
}

async fn open(
    inner: &Inner,
    host: &str,
    port: u16,
    secure: bool,
    expected: Option<&str>,
) -> Result<BoxStream> {
    let mut shutdown = inner.subscribe_shutdown();
    let mut last_error = Error::Closed;

    for attempt in 1..=CONNECT_TRIES {
        let connected = tokio::select! {
            connected = conn::connect(host, port, CONNECT_TIMEOUT, false) => connected,
            _ = shutdown.wait_for(|down| *down) => return Err(Error::Cancelled),
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(error) => {
                log::debug!(
                    "Failed to connect to {}:{} (attempt {}/{}): {}",
                    host,
                    port,
                    attempt,
                    CONNECT_TRIES,
                    error
                );
                last_error = error;
                continue;
            }
        };

        if !secure {
            return Ok(Box::new(stream));
        }

        let (stream, fingerprint) = time::timeout(CONNECT_TIMEOUT, inner.tls.connect(host, stream))
            .await
            .map_err(|_| Error::Timeout("during the TLS handshake"))??;

        if let Some(expected) = expected {
            if fingerprint.as_deref() != Some(expected) {
                return Err(Error::FingerprintMismatch);
            }
        }

        return Ok(Box::new(stream));
    }

    Err(last_error)
}

/// Runs a link a peer opened to one of our listeners.
pub(crate) async fn accept(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr, secure: bool) {
    match accept_and_serve(&inner, stream, secure).await {
        Ok(()) | Err(Error::Cancelled) | Err(Error::Closed) => {
            log::debug!("Link from {} closed", addr)
        }
        Err(error) => log::debug!("Link from {} failed: {}", addr, error),
    }
}

async fn accept_and_serve(inner: &Arc<Inner>, stream: TcpStream, secure: bool) -> Result<()> {
    let stream: BoxStream = if secure {
        let stream = time::timeout(CONNECT_TIMEOUT, inner.tls.accept(stream))
            .await
            .map_err(|_| Error::Timeout("during the TLS handshake"))??;
        Box::new(stream)
    } else {
        Box::new(stream)
    };

    match inner.url.protocol {
        Protocol::Nmdc => {
            let (reader, writer) = conn::split(stream, options());
            let handshake = nmdc_link::accept(inner, reader, writer).await?;
            serve(inner, handshake).await
        }
        Protocol::Adc => {
            let (reader, writer) = conn::split(stream, options());
            let handshake = adc_link::accept(inner, reader, writer).await?;
            serve(inner, handshake).await
        }
    }
}

// ----------------------------------------------------------------------------//

/// Keeps a link in the client's table for as long as it runs.
struct Registration {
    inner: Arc<Inner>,
    key: (String, Direction),
    id: u64,
}

impl Registration {
    fn new(
        inner: &Arc<Inner>,
        nick: &str,
        direction: Direction,
        pending: Option<PendingKey>,
        jobs: Option<mpsc::UnboundedSender<Job>>,
    ) -> Result<Self> {
        let key = (nick.to_owned(), direction);
        let id = inner.next_id();

        {
            let mut state = inner.lock();
            if state.terminated {
                return Err(Error::Cancelled);
            }

            if state.links.contains_key(&key) {
                return Err(Error::Protocol(format!(
                    "{} already has a {:?} link",
                    nick, direction
                )));
            }

            state.links.insert(key.clone(), LinkEntry { id, jobs });

            if let Some(pending) = pending {
                state.downloads.pending.remove(&pending);
            }
        }

        inner.download_wake.notify_waiters();

        Ok(Self {
            inner: inner.clone(),
            key,
            id,
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            if state.links.get(&self.key).map(|entry| entry.id) == Some(self.id) {
                state.links.remove(&self.key);
            }
        }

        self.inner.download_wake.notify_waiters();
    }
}

async fn serve<F: LinkFrame>(inner: &Arc<Inner>, handshake: Handshake<F>) -> Result<()> {
    let Handshake {
        nick,
        direction,
        pending,
        compression,
        reader,
        writer,
    } = handshake;

    log::debug!(
        "{:?} link with {} established (compression: {})",
        direction,
        nick,
        compression
    );

    task::spawn(close_on_shutdown(inner.clone(), writer.clone()));

    let result = async {
        match direction {
            Direction::Download => {
                let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
                let _registration =
                    Registration::new(inner, &nick, direction, pending, Some(jobs_tx))?;
                run_download(reader, &writer, jobs_rx, compression).await
            }
            Direction::Upload => {
                let _registration = Registration::new(inner, &nick, direction, pending, None)?;
                run_upload(inner, reader, &writer, compression).await
            }
        }
    }
    .await;

    writer.close();
    result
}

async fn close_on_shutdown<F: Frame>(inner: Arc<Inner>, writer: ConnWriter<F>) {
    let mut shutdown = inner.subscribe_shutdown();

    tokio::select! {
        _ = shutdown.wait_for(|down| *down) => writer.close(),
        _ = writer.closed() => (),
    }
}

/// Runs queued downloads one after the other.
async fn run_download<F: LinkFrame>(
    mut reader: ConnReader<F>,
    writer: &ConnWriter<F>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    compression: bool,
) -> Result<()> {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => return Ok(()),
            },
            frame = reader.read() => match frame?.classify() {
                Incoming::KeepAlive => continue,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {:?} on an idle download link",
                        other
                    )))
                }
            },
        };

        // The download gave up waiting.
        if job.started.send(()).is_err() {
            continue;
        }

        let result = download::fetch(&mut reader, writer, &job.download, compression).await;

        // Refusals and bad content leave the link usable.
        let keep = match &result {
            Ok(()) => true,
            Err(Error::Transfer(error)) => matches!(
                error,
                TransferError::NoSlots
                    | TransferError::NotAvailable
                    | TransferError::HashMismatch
                    | TransferError::EmptyFile
                    | TransferError::Remote(_)
            ),
            Err(_) => false,
        };

        job.done.send(result).ok();

        if !keep {
            return Err(TransferError::LinkClosed.into());
        }
    }
}

/// Answers the peer's requests.
async fn run_upload<F: LinkFrame>(
    inner: &Inner,
    mut reader: ConnReader<F>,
    writer: &ConnWriter<F>,
    compression: bool,
) -> Result<()> {
    loop {
        match reader.read().await?.classify() {
            Incoming::KeepAlive => (),
            Incoming::Get(request) => upload::serve(inner, writer, request, compression).await?,
            Incoming::Error(text) => log::debug!("Peer error: {}", text),
            Incoming::Other(what) => {
                return Err(Error::Protocol(format!("unexpected {} on an upload link", what)))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?} on an upload link",
                    other
                )))
            }
        }
    }
}

// ----------------------------------------------------------------------------//

impl LinkFrame for nmdc::Message {
    fn get(request: &TransferRequest) -> Self {
        Self::AdcGet(*request)
    }

    fn snd(request: &TransferRequest) -> Self {
        Self::AdcSnd(*request)
    }

    fn no_slots() -> Self {
        Self::MaxedOut
    }

    fn not_available() -> Self {
        Self::Error(nmdc_link::FILE_NOT_AVAILABLE.to_owned())
    }

    fn error(text: &str) -> Self {
        Self::Error(text.to_owned())
    }

    fn classify(self) -> Incoming {
        match self {
            Self::KeepAlive => Incoming::KeepAlive,
            Self::AdcGet(request) => Incoming::Get(request),
            Self::AdcSnd(request) => Incoming::Snd(request),
            Self::MaxedOut => Incoming::NoSlots,
            Self::Error(text) if text == nmdc_link::FILE_NOT_AVAILABLE => Incoming::NotAvailable,
            Self::Error(text) => Incoming::Error(text),
            other => Incoming::Other(format!("{:?}", other)),
        }
    }
}

impl LinkFrame for adc::Message {
    fn get(request: &TransferRequest) -> Self {
        adc_link::transfer_packet(adc::GET, request).into()
    }

    fn snd(request: &TransferRequest) -> Self {
        adc_link::transfer_packet(adc::SND, request).into()
    }

    fn no_slots() -> Self {
        adc_link::status(adc::status::SLOTS_FULL, "Slots full").into()
    }

    fn not_available() -> Self {
        adc_link::status(adc::status::FILE_NOT_AVAILABLE, "File Not Available").into()
    }

    fn error(text: &str) -> Self {
        adc_link::status(0, text).into()
    }

    fn classify(self) -> Incoming {
        let packet = match self {
            Self::KeepAlive => return Incoming::KeepAlive,
            Self::Packet(packet) => packet,
        };

        match packet.command {
            adc::GET | adc::SND => match adc_link::parse_transfer(&packet) {
                Ok(request) if packet.command == adc::GET => Incoming::Get(request),
                Ok(request) => Incoming::Snd(request),
                Err(error) => Incoming::Error(error.to_string()),
            },
            adc::STA => match adc::status::Status::parse(&packet) {
                Ok(status) if status.code == adc::status::SLOTS_FULL => Incoming::NoSlots,
                Ok(status) if status.code == adc::status::FILE_NOT_AVAILABLE => {
                    Incoming::NotAvailable
                }
                Ok(status) => Incoming::Error(status.description),
                Err(error) => Incoming::Error(error.to_string()),
            },
            _ => Incoming::Other(format!("{:?}", packet)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::Query;

    fn request(compressed: bool) -> TransferRequest {
        TransferRequest {
            query: Query::File(TigerHash::digest(b"content")),
            start: 0,
            length: Some(20_000),
            compressed,
        }
    }

    #[tokio::test]
    async fn one_link_per_peer_and_direction() {
        let (inner, _events) = Inner::detached("alice").await;
        let pending = PendingKey::Nick("bob".to_owned());
        inner
            .lock()
            .downloads
            .pending
            .insert(pending.clone(), "bob".to_owned());

        let first =
            Registration::new(&inner, "bob", Direction::Download, Some(pending.clone()), None)
                .unwrap();
        assert!(!inner.lock().downloads.pending.contains_key(&pending));

        assert!(matches!(
            Registration::new(&inner, "bob", Direction::Download, None, None),
            Err(Error::Protocol(_))
        ));

        // The other direction is a separate link.
        let _upload = Registration::new(&inner, "bob", Direction::Upload, None, None).unwrap();

        drop(first);
        assert!(Registration::new(&inner, "bob", Direction::Download, None, None).is_ok());
    }

    #[test]
    fn adc_transfer_frames_classify() {
        let get = adc::Message::get(&request(true));
        let wire = String::from_utf8(get.to_bytes()).unwrap();
        assert!(wire.starts_with("CGET file TTH/"));
        assert!(wire.ends_with(" 0 20000 ZL1\n"));

        let decoded = adc::Message::decode(wire.trim_end().as_bytes()).unwrap();
        assert!(matches!(decoded.classify(), Incoming::Get(r) if r == request(true)));

        assert!(matches!(adc::Message::no_slots().classify(), Incoming::NoSlots));
        assert!(matches!(
            adc::Message::not_available().classify(),
            Incoming::NotAvailable
        ));
        assert!(matches!(
            adc::Message::error("broken").classify(),
            Incoming::Error(text) if text == "broken"
        ));
    }

    #[test]
    fn nmdc_transfer_frames_classify() {
        let snd = nmdc::Message::snd(&request(false));
        assert!(matches!(snd.classify(), Incoming::Snd(r) if r == request(false)));

        assert!(matches!(nmdc::Message::no_slots().classify(), Incoming::NoSlots));
        assert!(matches!(
            nmdc::Message::not_available().classify(),
            Incoming::NotAvailable
        ));
        assert!(matches!(
            nmdc::Message::Lock {
                lock: b"x".to_vec(),
                pk: String::new()
            }
            .classify(),
            Incoming::Other(_)
        ));
    }
}

//! Framed, optionally compressed, duplex connections shared by hub sessions and peer links.
//!
//! A connection is split into a `ConnReader` owned by the task that drives it and a cloneable
//! `ConnWriter`. Frames sent through the writer are queued and written by a background task in
//! order, while bulk transfers lock the underlying writer directly.

use crate::error::{Error, Result};
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{self, TcpSocket, TcpStream},
    sync::watch,
    time,
};

mod reader;
mod writer;

pub(crate) use self::{
    reader::{ConnReader, FrameReader},
    writer::{BulkWriter, ConnWriter, FrameWriter},
};

pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

pub(crate) type BoxStream = Box<dyn Stream>;

/// A message that travels over a delimited text protocol.
pub(crate) trait Frame: Sized + fmt::Debug + Send + 'static {
    /// Byte terminating every message on the wire.
    const DELIMITER: u8;

    /// Decodes a message from its bytes, without the delimiter.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Appends the message and its delimiter to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ConnOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Byte counters for a connection. Reading a counter resets it.
#[derive(Default, Debug)]
pub(crate) struct Counters {
    read: AtomicU64,
    written: AtomicU64,
}

impl Counters {
    pub fn add_read(&self, n: usize) {
        self.read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn take_read(&self) -> u64 {
        self.read.swap(0, Ordering::Relaxed)
    }

    pub fn take_written(&self) -> u64 {
        self.written.swap(0, Ordering::Relaxed)
    }
}

/// Splits a stream into its framed halves and spawns the writer queue.
pub(crate) fn split<F: Frame>(
    stream: BoxStream,
    options: ConnOptions,
) -> (ConnReader<F>, ConnWriter<F>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let (closed_tx, closed_rx) = watch::channel(false);
    let counters = Arc::new(Counters::default());

    let reader = ConnReader::new(
        FrameReader::new(read_half, options.read_timeout, counters.clone()),
        closed_rx.clone(),
    );
    let writer = ConnWriter::spawn(
        FrameWriter::new(write_half, options.write_timeout, counters),
        closed_tx,
        closed_rx,
    );

    (reader, writer)
}

// ----------------------------------------------------------------------------//

/// Resolves `host` and connects to the first address that answers within `timeout`.
pub(crate) async fn connect(
    host: &str,
    port: u16,
    timeout: Duration,
    keepalive: bool,
) -> Result<TcpStream> {
    let addrs = time::timeout(timeout, net::lookup_host((host, port)))
        .await
        .map_err(|_| Error::Timeout("while resolving"))??;

    let mut last_error = None;

    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(keepalive)?;

        match time::timeout(timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(error)) => last_error = Some(Error::Io(error)),
            Err(_) => last_error = Some(Error::Timeout("while connecting")),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not resolve", host),
        ))
    }))
}

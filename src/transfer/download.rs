//! Download queue and the receiving side of a transfer.
//!
//! Each download runs as its own task: it waits until no other download from the same peer is
//! running and a slot is free, obtains a download link, hands the link a job and waits for the
//! outcome. The link task does the actual transfer in `fetch`.

use super::{Query, TransferRequest, COMPRESSION_THRESHOLD};
use crate::{
    client::{ClientEvent, Inner, LinkEntry},
    conn::{ConnReader, ConnWriter},
    error::{Error, Result, TransferError},
    hub,
    link::{Incoming, LinkFrame},
    peer::Peer,
    share::filelist,
    tiger::TigerHash,
    tth::{self, Leaves},
};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    io::SeekFrom,
    path::{Path, PathBuf},
    pin::pin,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    fs,
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};

/// How long a peer gets to open a link after we asked for one.
const CONNECT_WAIT: Duration = Duration::from_secs(10);
/// How long a link gets to pick up a job.
const START_WAIT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Nick of the peer to download from.
    pub peer: String,
    pub query: Query,
    pub start: u64,
    /// `None` downloads to the end.
    pub length: Option<u64>,
    /// Accept the content even if it does not match its tree hash.
    pub skip_validation: bool,
    /// Write the content here instead of keeping it in memory.
    pub save_path: Option<PathBuf>,
}

impl DownloadConfig {
    pub fn file(peer: &Peer, tth: TigerHash) -> Self {
        Self::new(peer, Query::File(tth))
    }

    pub fn file_list(peer: &Peer) -> Self {
        Self::new(peer, Query::FileList)
    }

    /// The leaf hashes of a file.
    pub fn leaves(peer: &Peer, tth: TigerHash) -> Self {
        Self::new(peer, Query::Leaves(tth))
    }

    pub fn range(mut self, start: u64, length: Option<u64>) -> Self {
        self.start = start;
        self.length = length;
        self
    }

    pub fn save_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    pub fn skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }

    fn new(peer: &Peer, query: Query) -> Self {
        Self {
            peer: peer.nick.clone(),
            query,
            start: 0,
            length: None,
            skip_validation: false,
            save_path: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DownloadState {
    Queued,
    /// Another download from the same peer is running.
    WaitingPeerExclusive,
    /// All download slots are taken.
    WaitingSlot,
    /// Waiting for the peer to open a link.
    RequestingConnection,
    Processing,
    Success,
    Failed,
}

/// A queued or finished download. Cloning gives another handle to the same download.
#[derive(Clone)]
pub struct Download(Arc<DownloadInner>);

struct DownloadInner {
    id: u64,
    config: DownloadConfig,
    cancel: watch::Sender<bool>,
    state: Mutex<DownloadState>,
    content: Mutex<Option<Arc<Vec<u8>>>>,
}

impl Download {
    pub(crate) fn new(id: u64, config: DownloadConfig) -> Self {
        Self(Arc::new(DownloadInner {
            id,
            config,
            cancel: watch::channel(false).0,
            state: Mutex::new(DownloadState::Queued),
            content: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.0.config
    }

    pub fn state(&self) -> DownloadState {
        *self.0.state.lock().unwrap()
    }

    /// Downloaded bytes, for successful downloads without a `save_path`. File lists are
    /// returned decompressed.
    pub fn content(&self) -> Option<Arc<Vec<u8>>> {
        self.0.content.lock().unwrap().clone()
    }

    /// Stops the download. No event is emitted for a cancelled download.
    pub fn cancel(&self) {
        self.0.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.cancel.borrow()
    }

    fn set_state(&self, state: DownloadState) {
        *self.0.state.lock().unwrap() = state;
    }

    fn set_content(&self, content: Vec<u8>) {
        *self.0.content.lock().unwrap() = Some(Arc::new(content));
    }

    async fn cancelled(&self) {
        let _ = self.0.cancel.subscribe().wait_for(|cancelled| *cancelled).await;
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.0.id)
            .field("peer", &self.0.config.peer)
            .field("query", &self.0.config.query)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Download {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

/// How a link we asked for will identify itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum PendingKey {
    /// NMDC links are matched by the peer's nick.
    Nick(String),
    /// ADC links carry the token of our `CTM`/`RCM`.
    Token(String),
}

#[derive(Default)]
pub(crate) struct Downloads {
    all: Vec<Download>,
    busy_peers: HashSet<String>,
    /// Links we asked for, with the nick of the peer.
    pub pending: HashMap<PendingKey, String>,
}

impl Downloads {
    pub fn add(&mut self, download: Download) {
        self.all.push(download);
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn snapshot(&self) -> Vec<Download> {
        self.all.clone()
    }

    fn remove(&mut self, id: u64) {
        self.all.retain(|download| download.id() != id);
    }
}

/// A download handed to a link.
pub(crate) struct Job {
    pub download: Download,
    pub started: oneshot::Sender<()>,
    pub done: oneshot::Sender<Result<()>>,
}

// ----------------------------------------------------------------------------//

/// Drives a download from the queue to its final event.
pub(crate) async fn run(inner: Arc<Inner>, download: Download) {
    let result = drive(&inner, &download).await;

    let mut state = inner.lock();
    state.downloads.remove(download.id());

    match result {
        Ok(()) => {
            log::info!("Downloaded {} from {}", download.config().query, download.config().peer);
            download.set_state(DownloadState::Success);
            inner.emit(ClientEvent::DownloadSuccessful(download));
        }
        Err(Error::Cancelled) => {
            log::debug!("Download {} cancelled", download.id());
            download.set_state(DownloadState::Failed);
        }
        Err(error) => {
            log::debug!(
                "Download of {} from {} failed: {}",
                download.config().query,
                download.config().peer,
                error
            );
            download.set_state(DownloadState::Failed);
            inner.emit(ClientEvent::DownloadError(download, error));
        }
    }
}

/// Holds a download slot and the peer's exclusivity.
struct Claim<'a> {
    inner: &'a Inner,
    nick: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.slots.release_download();
            state.downloads.busy_peers.remove(&self.nick);
        }

        self.inner.download_wake.notify_waiters();
    }
}

async fn drive(inner: &Inner, download: &Download) -> Result<()> {
    let _claim = claim(inner, download).await?;

    download.set_state(DownloadState::RequestingConnection);
    let jobs = obtain_link(inner, download).await?;

    let (started_tx, started_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();

    jobs.send(Job {
        download: download.clone(),
        started: started_tx,
        done: done_tx,
    })
    .map_err(|_| TransferError::LinkClosed)?;

    tokio::select! {
        started = time::timeout(START_WAIT, started_rx) => match started {
            Ok(Ok(())) => (),
            Ok(Err(_)) => return Err(TransferError::LinkClosed.into()),
            Err(_) => return Err(Error::Timeout("waiting for the link to start")),
        },
        _ = download.cancelled() => return Err(Error::Cancelled),
    }

    download.set_state(DownloadState::Processing);

    // The link watches for cancellation itself.
    done_rx.await.map_err(|_| TransferError::LinkClosed)?
}

/// Waits until the peer is free and a slot is available.
async fn claim<'a>(inner: &'a Inner, download: &Download) -> Result<Claim<'a>> {
    let nick = &download.config().peer;

    loop {
        let mut notified = pin!(inner.download_wake.notified());
        notified.as_mut().enable();

        {
            let mut state = inner.lock();
            if state.terminated {
                return Err(Error::Cancelled);
            }

            if !state.peers.contains(nick) {
                return Err(TransferError::PeerNotFound.into());
            }

            if state.downloads.busy_peers.contains(nick) {
                download.set_state(DownloadState::WaitingPeerExclusive);
            } else if state.slots.try_acquire_download() {
                state.downloads.busy_peers.insert(nick.clone());
                return Ok(Claim {
                    inner,
                    nick: nick.clone(),
                });
            } else {
                download.set_state(DownloadState::WaitingSlot);
            }
        }

        tokio::select! {
            _ = notified => (),
            _ = download.cancelled() => return Err(Error::Cancelled),
        }
    }
}

/// Returns the job queue of a download link with the peer, asking for one if needed.
async fn obtain_link(inner: &Inner, download: &Download) -> Result<mpsc::UnboundedSender<Job>> {
    let nick = &download.config().peer;
    let deadline = Instant::now() + CONNECT_WAIT;
    let mut requested: Option<PendingKey> = None;

    let result = loop {
        let mut notified = pin!(inner.download_wake.notified());
        notified.as_mut().enable();

        {
            let mut state = inner.lock();
            if state.terminated {
                break Err(Error::Cancelled);
            }

            let link = state.links.get(&(nick.clone(), super::Direction::Download));
            if let Some(LinkEntry {
                jobs: Some(jobs), ..
            }) = link
            {
                if !jobs.is_closed() {
                    break Ok(jobs.clone());
                }
            }

            if requested.is_none() {
                match hub::request_connection(inner, &state, nick) {
                    Ok(key) => {
                        state.downloads.pending.insert(key.clone(), nick.clone());
                        requested = Some(key);
                    }
                    Err(error) => break Err(error),
                }
            }
        }

        tokio::select! {
            _ = notified => (),
            _ = download.cancelled() => break Err(Error::Cancelled),
            _ = time::sleep_until(deadline) => {
                break Err(Error::Timeout("waiting for the peer to connect"))
            }
        }
    };

    if let Some(key) = requested {
        inner.lock().downloads.pending.remove(&key);
    }

    result
}

// ----------------------------------------------------------------------------//

/// Where received bytes go.
enum Sink {
    Memory(Vec<u8>),
    File(fs::File),
}

impl Sink {
    async fn open(config: &DownloadConfig) -> Result<Self> {
        // File lists are decompressed before they are stored.
        let path = match (&config.save_path, config.query) {
            (Some(path), Query::File(_)) => path,
            _ => return Ok(Self::Memory(Vec::new())),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(config.start == 0)
            .open(path)
            .await?;

        if config.start > 0 {
            file.seek(SeekFrom::Start(config.start)).await?;
        }

        Ok(Self::File(file))
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Memory(buffer) => buffer.extend_from_slice(bytes),
            Self::File(file) => file.write_all(bytes).await?,
        }
        Ok(())
    }
}

/// Runs one transfer on a download link.
pub(crate) async fn fetch<F: LinkFrame>(
    reader: &mut ConnReader<F>,
    writer: &ConnWriter<F>,
    download: &Download,
    compression: bool,
) -> Result<()> {
    let config = download.config();

    let request = TransferRequest {
        query: config.query,
        start: config.start,
        length: config.length,
        compressed: compression
            && config
                .length
                .map_or(true, |length| length >= COMPRESSION_THRESHOLD),
    };

    writer.write(&F::get(&request)).await?;

    let reply = loop {
        let frame = tokio::select! {
            frame = reader.read() => frame?,
            _ = download.cancelled() => return Err(Error::Cancelled),
        };

        match frame.classify() {
            Incoming::KeepAlive => continue,
            Incoming::Snd(reply) => break reply,
            Incoming::NoSlots => return Err(TransferError::NoSlots.into()),
            Incoming::NotAvailable => return Err(TransferError::NotAvailable.into()),
            Incoming::Error(text) => return Err(TransferError::Remote(text).into()),
            Incoming::Other(what) => {
                return Err(Error::Protocol(format!("expected SND, got {}", what)))
            }
            other => return Err(Error::Protocol(format!("expected SND, got {:?}", other))),
        }
    };

    let length = request.check_reply(&reply)?;
    if length == 0 {
        return Err(TransferError::EmptyFile.into());
    }

    if reply.compressed {
        reader.enable_zlib();
    }

    let started = Instant::now();
    reader.counters().take_read();

    let mut sink = Sink::open(config).await?;
    let validate = !config.skip_validation && config.start == 0;
    let mut hasher = match config.query {
        Query::File(_) if validate => Some(tth::Hasher::new()),
        _ => None,
    };

    let mut buffer = vec![0u8; READ_CHUNK];
    let mut remaining = length;

    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);

        let n = tokio::select! {
            n = reader.read_binary(&mut buffer[..want]) => n?,
            _ = download.cancelled() => return Err(Error::Cancelled),
        };

        let bytes = &buffer[..n];
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(bytes);
        }
        sink.write(bytes).await?;
        remaining -= n as u64;
    }

    // Anything after an uncompressed body is the next message.
    if reply.compressed {
        tokio::select! {
            result = reader.finish_zlib() => result?,
            _ = download.cancelled() => return Err(Error::Cancelled),
        }
    }

    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    log::debug!(
        "Received {} bytes in {:.2}s ({:.0} KiB/s, {} on the wire)",
        length,
        elapsed,
        length as f64 / 1024.0 / elapsed,
        reader.counters().take_read()
    );

    // A whole file must hash to its root.
    if let (Some(hasher), Query::File(tth)) = (hasher, config.query) {
        let whole = config.length.map_or(true, |wanted| wanted == length);
        if whole && hasher.finish().root() != tth {
            if let (Sink::File(file), Some(path)) = (sink, &config.save_path) {
                drop(file);
                if let Err(error) = fs::remove_file(path).await {
                    log::warn!("Failed to remove {:?}: {}", path, error);
                }
            }
            return Err(TransferError::HashMismatch.into());
        }
    }

    let content = match sink {
        Sink::File(mut file) => {
            file.flush().await?;
            return Ok(());
        }
        Sink::Memory(content) => content,
    };

    let content = match config.query {
        Query::FileList => filelist::decompress(&content)?,
        Query::Leaves(tth) => {
            if !config.skip_validation {
                let leaves = Leaves::from_bytes(&content)
                    .map_err(|_| TransferError::HashMismatch)?;
                if leaves.root() != tth {
                    return Err(TransferError::HashMismatch.into());
                }
            }
            content
        }
        Query::File(_) => content,
    };

    match (&config.save_path, config.query) {
        (Some(path), Query::FileList) => save(path, &content).await?,
        _ => download.set_content(content),
    }

    Ok(())
}

async fn save(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content).await?;
    Ok(())
}

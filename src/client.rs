use crate::{
    builder::ClientBuilder,
    config::{Config, HubUrl, PeerEncryptionMode},
    error::{Error, Result},
    hub::{self, HubPhase, HubState},
    peer::{Peer, Roster},
    search::{SearchRequest, SearchResult},
    share::{
        indexer::{self, IndexStats},
        FileListDirectory, FileListFile, ShareTree,
    },
    socket::Socket,
    tiger::TigerHash,
    tls::TlsContext,
    transfer::{
        download::{self, Download, DownloadConfig, Downloads},
        Direction, Slots,
    },
};
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::{
    sync::{mpsc, watch, Notify},
    task,
};

/// Everything the client reports back to its owner, in the order the underlying state changed.
#[derive(Debug)]
pub enum ClientEvent {
    /// The share was indexed for the first time and the client is ready.
    Initialized,
    /// An index of the share finished, the first one included.
    ShareIndexed(IndexStats),
    /// The hub login completed and the user list is complete.
    HubConnected,
    /// The hub session failed. The client shuts down right after.
    HubError(Error),
    PeerConnected(Peer),
    PeerUpdated(Peer),
    PeerDisconnected(Peer),
    /// Main chat. `nick` is empty for messages from the hub itself.
    MessagePublic { nick: String, text: String },
    MessagePrivate { nick: String, text: String },
    SearchResult(SearchResult),
    DownloadSuccessful(Download),
    DownloadError(Download, Error),
}

/// Handle to a Direct Connect client.
///
/// This type is cheaply cloneable where each clone refers to the same client. The client shuts
/// down when `close` is called, when the hub session fails, or when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    owner: Arc<Owner>,
}

struct Owner(Arc<Inner>);

impl Drop for Owner {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

impl Client {
    /// Create a new ClientBuilder.
    pub fn builder(hub_url: impl Into<String>, nick: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(hub_url, nick)
    }

    /// Starts the client: binds the listeners, indexes the share and, unless
    /// `hub-manual-connect` is set, connects to the hub once the first index is done.
    pub(crate) async fn start(
        config: Config,
        shares: BTreeMap<String, PathBuf>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let url = config.validate()?;

        if let Some(level) = config.log_level {
            log::set_max_level(level.into());
        }

        let tls = TlsContext::generate()?;
        let listeners = crate::listener::bind(&config).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        log::info!(
            "Starting client {} for {} (tcp {:?}, tls {:?}, udp {})",
            config.nick,
            url,
            listeners.tcp_port(),
            listeners.tls_port(),
            listeners.udp.local_addr()
        );

        let ports = Ports {
            tcp: listeners.tcp_port(),
            tls: listeners.tls_port(),
            udp: (!config.is_passive).then(|| listeners.udp.local_addr().port()),
        };
        let inner = Inner::new(config, url, shares, tls, listeners.udp.clone(), ports, event_tx);

        listeners.spawn(&inner);
        task::spawn(run_indexer(inner.clone()));
        inner.reindex.notify_one();

        Ok((
            Self {
                owner: Arc::new(Owner(inner)),
            },
            event_rx,
        ))
    }

    fn inner(&self) -> &Arc<Inner> {
        &self.owner.0
    }

    /// Shares the directory at `path` under `alias`, then re-indexes.
    pub fn share_add(&self, alias: impl Into<String>, path: impl AsRef<Path>) -> Result<()> {
        let alias = alias.into();
        if alias.is_empty() || alias.contains(['/', '\\']) {
            return Err(Error::InvalidConfig(format!("invalid share alias: {}", alias)));
        }

        let path = path.as_ref().to_path_buf();
        self.inner().lock().share.roots.insert(alias, path);
        self.inner().reindex.notify_one();
        Ok(())
    }

    /// Stops sharing `alias`, then re-indexes.
    pub fn share_del(&self, alias: &str) {
        if self.inner().lock().share.roots.remove(alias).is_some() {
            self.inner().reindex.notify_one();
        }
    }

    /// The share as of the last completed index.
    pub fn share(&self) -> Arc<ShareTree> {
        self.inner().lock().share.tree.clone()
    }

    /// Connects to the hub. Does nothing if a session is already running.
    pub fn hub_connect(&self) {
        hub::connect(self.inner());
    }

    pub fn hub_phase(&self) -> HubPhase {
        self.inner().lock().hub.phase
    }

    pub fn hub_name(&self) -> String {
        self.inner().lock().hub.name.clone()
    }

    /// Shuts the client down: the hub session, every peer link, transfer and listener.
    pub fn close(&self) {
        self.inner().shutdown();
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner().lock().peers.iter().cloned().collect()
    }

    pub fn peer(&self, nick: &str) -> Option<Peer> {
        self.inner().lock().peers.get(nick).cloned()
    }

    pub fn message_public(&self, text: &str) -> Result<()> {
        let inner = self.inner();
        let state = inner.lock();
        hub::send_public(inner, &state, text)
    }

    pub fn message_private(&self, peer: &Peer, text: &str) -> Result<()> {
        let inner = self.inner();
        let state = inner.lock();
        hub::send_private(inner, &state, peer, text)
    }

    /// Sends a search to every peer on the hub. Results arrive as `ClientEvent::SearchResult`.
    pub fn search(&self, request: &SearchRequest) -> Result<()> {
        let inner = self.inner();
        let state = inner.lock();
        hub::send_search(inner, &state, request)
    }

    /// Queues a download. Completion is reported through `ClientEvent::DownloadSuccessful` or
    /// `ClientEvent::DownloadError`.
    pub fn download_file(&self, config: DownloadConfig) -> Result<Download> {
        let inner = self.inner();
        let download = Download::new(inner.next_id(), config);

        {
            let mut state = inner.lock();
            if state.terminated {
                return Err(Error::Closed);
            }
            state.downloads.add(download.clone());
        }

        task::spawn(download::run(inner.clone(), download.clone()));
        Ok(download)
    }

    /// Downloads a peer's file list. The content of a successful download is the decompressed
    /// XML; parse it with [`FileList::parse`](crate::FileList::parse).
    pub fn download_file_list(&self, peer: &Peer) -> Result<Download> {
        self.download_file(DownloadConfig::file_list(peer))
    }

    /// Downloads a file found in a peer's file list, into memory or to `save_path`.
    pub fn download_fl_file(
        &self,
        peer: &Peer,
        file: &FileListFile,
        save_path: Option<PathBuf>,
    ) -> Result<Download> {
        let mut config = DownloadConfig::file(peer, file.tth);
        config.save_path = save_path;
        self.download_file(config)
    }

    /// Downloads every file below a file list directory into `save_dir/<directory name>/`.
    pub fn download_fl_directory(
        &self,
        peer: &Peer,
        directory: &FileListDirectory,
        save_dir: impl AsRef<Path>,
    ) -> Result<Vec<Download>> {
        let target = save_dir.as_ref().join(&directory.name);

        directory
            .walk()
            .into_iter()
            .map(|(path, file)| self.download_fl_file(peer, file, Some(target.join(path))))
            .collect()
    }

    pub fn cancel_download(&self, download: &Download) {
        download.cancel();
    }

    /// Downloads that are queued or running.
    pub fn download_count(&self) -> usize {
        self.inner().lock().downloads.len()
    }

    pub fn downloads(&self) -> Vec<Download> {
        self.inner().lock().downloads.snapshot()
    }

    /// `SHA256/<base32>` fingerprint of the certificate used for encrypted links.
    pub fn fingerprint(&self) -> String {
        self.inner().tls.fingerprint().to_owned()
    }

    /// Our ADC client id.
    pub fn cid(&self) -> TigerHash {
        self.inner().cid
    }

    /// Ports the listeners are bound to.
    pub fn tcp_port(&self) -> Option<u16> {
        self.inner().ports.tcp
    }

    pub fn tls_port(&self) -> Option<u16> {
        self.inner().ports.tls
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.inner().ports.udp
    }
}

// ----------------------------------------------------------------------------//

#[derive(Clone, Copy, Debug)]
pub(crate) struct Ports {
    pub tcp: Option<u16>,
    pub tls: Option<u16>,
    pub udp: Option<u16>,
}

/// State shared by every task of a client.
pub(crate) struct Inner {
    pub config: Config,
    pub url: HubUrl,
    pub state: Mutex<State>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub shutdown: watch::Sender<bool>,
    /// Woken whenever a download might be able to make progress.
    pub download_wake: Notify,
    pub reindex: Notify,
    pub tls: TlsContext,
    pub pid: TigerHash,
    pub cid: TigerHash,
    pub udp: Arc<Socket>,
    pub ports: Ports,
    next_id: AtomicU64,
}

impl Inner {
    fn new(
        config: Config,
        url: HubUrl,
        shares: BTreeMap<String, PathBuf>,
        tls: TlsContext,
        udp: Arc<Socket>,
        ports: Ports,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let pid: TigerHash = rand::random();

        Arc::new(Self {
            ports,
            state: Mutex::new(State {
                hub: HubState::default(),
                peers: Roster::default(),
                links: HashMap::new(),
                downloads: Downloads::default(),
                slots: Slots::new(config.download_max_parallel, config.upload_max_parallel),
                share: ShareState {
                    roots: shares,
                    tree: Arc::new(ShareTree::default()),
                    file_list: None,
                    indexed: false,
                },
                terminated: false,
            }),
            udp,
            config,
            url,
            events,
            shutdown,
            download_wake: Notify::new(),
            reindex: Notify::new(),
            tls,
            pid,
            cid: TigerHash::digest(pid.as_bytes()),
            next_id: AtomicU64::new(1),
        })
    }

    /// A passive client with no listeners and no tasks running.
    #[cfg(test)]
    pub(crate) async fn detached(nick: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let mut config = Config::default();
        config.hub_url = "nmdc://127.0.0.1:411".to_owned();
        config.nick = nick.to_owned();
        config.is_passive = true;
        let url = config.validate().unwrap();

        let udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Self::new(
            config,
            url,
            BTreeMap::new(),
            TlsContext::generate().unwrap(),
            Arc::new(Socket::new(udp).unwrap()),
            Ports {
                tcp: None,
                tls: None,
                udp: None,
            },
            events,
        );

        (inner, events_rx)
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Pushes an event. Callers hold the state lock so events keep the order of the changes.
    pub fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Event receiver is gone");
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            if let Some(writer) = state.hub.writer.take() {
                writer.close();
            }
        }

        log::debug!("Shutting down client {}", self.config.nick);
        self.shutdown.send_replace(true);
        self.download_wake.notify_waiters();
    }

    pub fn is_passive(&self) -> bool {
        self.config.is_passive
    }

    /// Address peers should connect to.
    pub fn advertised_ip(&self, state: &State) -> Option<IpAddr> {
        self.config.ip.or(state.hub.local_ip)
    }

    /// Whether a link with `peer` should be encrypted. Errors when the configured mode and
    /// the peer cannot agree.
    pub fn use_tls_with(&self, peer: &Peer) -> Result<bool> {
        match self.config.peer_encryption_mode {
            PeerEncryptionMode::Disable => Ok(false),
            PeerEncryptionMode::Prefer => Ok(peer.supports_tls && self.tls_available()),
            PeerEncryptionMode::Force if peer.supports_tls => Ok(true),
            PeerEncryptionMode::Force => {
                Err(crate::error::TransferError::EncryptionUnsupported.into())
            }
        }
    }

    /// Whether we can take encrypted links: passive clients dial out, active ones need the TLS
    /// listener.
    pub fn tls_available(&self) -> bool {
        self.config.peer_encryption_mode != PeerEncryptionMode::Disable
            && (self.is_passive() || self.ports.tls.is_some())
    }
}

/// Every piece of mutable client state, guarded by one lock. No I/O happens while it is held.
pub(crate) struct State {
    pub hub: HubState,
    pub peers: Roster,
    pub links: HashMap<(String, Direction), LinkEntry>,
    pub downloads: Downloads,
    pub slots: Slots,
    pub share: ShareState,
    pub terminated: bool,
}

/// A registered peer link.
pub(crate) struct LinkEntry {
    pub id: u64,
    /// Where download links take their jobs from.
    pub jobs: Option<mpsc::UnboundedSender<download::Job>>,
}

pub(crate) struct ShareState {
    pub roots: BTreeMap<String, PathBuf>,
    pub tree: Arc<ShareTree>,
    /// Our bzip2'd file list, as served to peers.
    pub file_list: Option<Arc<Vec<u8>>>,
    pub indexed: bool,
}

// ----------------------------------------------------------------------------//

/// Re-indexes the share each time `reindex` is notified. Notifications that arrive while an
/// index is running are coalesced into one more run.
async fn run_indexer(inner: Arc<Inner>) {
    let mut shutdown = inner.subscribe_shutdown();

    loop {
        tokio::select! {
            _ = inner.reindex.notified() => (),
            _ = shutdown.wait_for(|down| *down) => break,
        }

        let (roots, previous) = {
            let state = inner.lock();
            (state.share.roots.clone(), state.share.tree.clone())
        };

        let cid = inner.cid;
        let generator = inner.config.list_generator.clone();

        let indexed = task::spawn_blocking(move || {
            let (tree, stats) = indexer::index(&roots, &previous);
            let file_list = tree.to_file_list(&cid, &generator).to_bz2();
            (tree, stats, file_list)
        })
        .await;

        let (tree, stats, file_list) = match indexed {
            Ok((tree, stats, Ok(file_list))) => (tree, stats, file_list),
            Ok((_, _, Err(error))) => {
                log::error!("Failed to build the file list: {}", error);
                continue;
            }
            Err(error) => {
                log::error!("Indexer task failed: {}", error);
                continue;
            }
        };

        log::info!(
            "Indexed {} files, {} bytes ({} hashed, {} reused)",
            tree.file_count(),
            tree.total_size(),
            stats.hashed,
            stats.reused
        );

        let first = {
            let mut state = inner.lock();
            if state.terminated {
                break;
            }

            state.share.tree = Arc::new(tree);
            state.share.file_list = Some(Arc::new(file_list));
            let first = !state.share.indexed;
            state.share.indexed = true;

            hub::announce_share(&inner, &state);

            if first {
                inner.emit(ClientEvent::Initialized);
            }
            inner.emit(ClientEvent::ShareIndexed(stats));

            first
        };

        if first && !inner.config.hub_manual_connect {
            hub::connect(&inner);
        }
    }

    log::debug!("Indexer stopped");
}

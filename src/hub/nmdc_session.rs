use super::{send_datagrams, HubPhase};
use crate::{
    client::{ClientEvent, Inner, State},
    config::PeerEncryptionMode,
    conn::{ConnReader, ConnWriter},
    error::{AuthError, Error, Result, TransferError},
    link::{self, Greeting},
    nmdc::{self, lock_to_key, Message, Mode, MyInfo, SearchOrigin, STATUS_NORMAL, STATUS_TLS},
    peer::Peer,
    search::{self, LocalQuery, SearchRequest, SearchResult},
    socket::Datagram,
    transfer::download::PendingKey,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::task;

const PROTOCOL_VERSION: &str = "1,0091";

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    /// Waiting for `$Lock`.
    Connected,
    /// Key and nick sent.
    Lock,
    /// The hub listed its features.
    PreInitialized,
    /// Logged in, waiting for the user list to complete.
    LoggedIn,
    Initialized,
}

const VALIDATING: &[Phase] = &[Phase::Lock, Phase::PreInitialized];
const ONLINE: &[Phase] = &[Phase::LoggedIn, Phase::Initialized];
const AFTER_LOCK: &[Phase] = &[
    Phase::Lock,
    Phase::PreInitialized,
    Phase::LoggedIn,
    Phase::Initialized,
];

/// Order and uniqueness rules for what the hub sends.
#[derive(Debug)]
struct Sequence {
    phase: Phase,
    password_requested: bool,
    logged_in: bool,
    topic_seen: bool,
}

impl Sequence {
    fn new() -> Self {
        Self {
            phase: Phase::Connected,
            password_requested: false,
            logged_in: false,
            topic_seen: false,
        }
    }

    /// Checks `message` against the current phase. Returns the phase it moved to, if any.
    fn advance(&mut self, message: &Message, own_nick: &str) -> Result<Option<Phase>> {
        match message {
            Message::KeepAlive
            | Message::Chat { .. }
            | Message::HubName(_)
            | Message::Error(_)
            | Message::BadPass
            | Message::ValidateDenide(_)
            | Message::HubIsFull
            | Message::ForceMove(_) => Ok(None),
            Message::HubTopic(_) => {
                once(&mut self.topic_seen, "$HubTopic")?;
                Ok(None)
            }
            Message::Lock { .. } => self.enter(&[Phase::Connected], Phase::Lock, message),
            Message::Supports(_) => self.enter(&[Phase::Lock], Phase::PreInitialized, message),
            Message::GetPass => {
                self.require(VALIDATING, message)?;
                once(&mut self.password_requested, "$GetPass")?;
                Ok(None)
            }
            Message::Hello(nick) if nick == own_nick => {
                self.enter(VALIDATING, Phase::LoggedIn, message)
            }
            Message::LogedIn(_) => {
                self.require(ONLINE, message)?;
                once(&mut self.logged_in, "$LogedIn")?;
                Ok(None)
            }
            Message::OpList(_) if self.phase == Phase::LoggedIn => {
                self.enter(&[Phase::LoggedIn], Phase::Initialized, message)
            }
            Message::Hello(_)
            | Message::MyInfo(_)
            | Message::OpList(_)
            | Message::BotList(_)
            | Message::UserIp(_)
            | Message::Quit(_)
            | Message::PrivateChat { .. }
            | Message::Search(_)
            | Message::SearchReply(_)
            | Message::ConnectToMe { .. }
            | Message::RevConnectToMe { .. } => {
                self.require(ONLINE, message)?;
                Ok(None)
            }
            Message::ZOn | Message::UserCommand(_) => {
                self.require(AFTER_LOCK, message)?;
                Ok(None)
            }
            other => Err(Error::Protocol(format!("unexpected {:?} from hub", other))),
        }
    }

    fn require(&self, phases: &[Phase], message: &Message) -> Result<()> {
        if phases.contains(&self.phase) {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "unexpected {:?} in {:?}",
                message, self.phase
            )))
        }
    }

    fn enter(&mut self, from: &[Phase], to: Phase, message: &Message) -> Result<Option<Phase>> {
        self.require(from, message)?;
        self.phase = to;
        Ok(Some(to))
    }
}

fn once(seen: &mut bool, what: &str) -> Result<()> {
    if *seen {
        return Err(Error::Protocol(format!("duplicate {}", what)));
    }
    *seen = true;
    Ok(())
}

enum Action {
    Continue,
    EnableZlib,
}

struct Session<'a> {
    inner: &'a Arc<Inner>,
    writer: ConnWriter<Message>,
    sequence: Sequence,
}

pub(super) async fn run(
    inner: &Arc<Inner>,
    mut reader: ConnReader<Message>,
    writer: ConnWriter<Message>,
) -> Result<()> {
    let mut session = Session {
        inner,
        writer,
        sequence: Sequence::new(),
    };

    loop {
        let message = reader.read().await?;

        match session.handle(message)? {
            Action::Continue => (),
            Action::EnableZlib => reader.enable_zlib(),
        }
    }
}

impl Session<'_> {
    fn nick(&self) -> &str {
        &self.inner.config.nick
    }

    fn handle(&mut self, message: Message) -> Result<Action> {
        let entered = self.sequence.advance(&message, &self.inner.config.nick)?;

        match message {
            Message::KeepAlive => (),
            Message::Lock { lock, pk } => self.on_lock(&lock, &pk),
            Message::Supports(features) => {
                log::debug!("Hub supports {}", features.join(" "));
            }
            Message::HubName(name) => self.inner.lock().hub.name = name,
            Message::HubTopic(topic) => self.inner.lock().hub.topic = topic,
            Message::GetPass => self.on_get_pass()?,
            Message::BadPass => return Err(AuthError::BadPassword.into()),
            Message::ValidateDenide(_) => return Err(AuthError::NickRefused.into()),
            Message::HubIsFull => return Err(AuthError::HubFull.into()),
            Message::ForceMove(addr) => return Err(AuthError::Redirected(addr).into()),
            Message::LogedIn(_) => log::info!("Logged in as operator"),
            Message::Hello(nick) if nick == self.nick() => self.on_hello(),
            // Peers are announced by their $MyINFO.
            Message::Hello(_) => (),
            Message::MyInfo(info) => self.on_my_info(info),
            Message::OpList(nicks) => {
                self.update_peers(nicks, |peer| peer.is_operator = true);
                // The first $OpList ends the initial user list.
                if entered == Some(Phase::Initialized) {
                    self.on_initialized();
                }
            }
            Message::BotList(nicks) => self.update_peers(nicks, |peer| peer.is_bot = true),
            Message::UserIp(entries) => self.on_user_ip(entries),
            Message::Quit(nick) => {
                let mut state = self.inner.lock();
                if let Some(peer) = state.peers.remove(&nick) {
                    self.inner.emit(ClientEvent::PeerDisconnected(peer));
                }
            }
            Message::ZOn => {
                if self.inner.config.hub_disable_compression {
                    return Err(Error::protocol("hub compressed without being allowed to"));
                }
                return Ok(Action::EnableZlib);
            }
            Message::Chat { nick, text } => {
                if nick != self.nick() {
                    let _state = self.inner.lock();
                    self.inner.emit(ClientEvent::MessagePublic { nick, text });
                }
            }
            Message::PrivateChat { from, text, .. } => {
                if from != self.nick() {
                    let _state = self.inner.lock();
                    self.inner
                        .emit(ClientEvent::MessagePrivate { nick: from, text });
                }
            }
            Message::Search(search) => self.on_search(search),
            Message::SearchReply(reply) => {
                let state = self.inner.lock();
                match state.peers.get(&reply.nick) {
                    Some(peer) => self.inner.emit(ClientEvent::SearchResult(
                        SearchResult::from_nmdc(peer.clone(), &reply, false),
                    )),
                    None => log::debug!("Search result from unknown peer {}", reply.nick),
                }
            }
            Message::ConnectToMe { addr, secure, .. } => self.on_connect_to_me(&addr, secure),
            Message::RevConnectToMe { from, .. } => self.on_rev_connect_to_me(&from),
            Message::UserCommand(_) => (),
            Message::Error(text) => log::warn!("Hub error: {}", text),
            // Rejected by the sequence check above.
            _ => (),
        }

        Ok(Action::Continue)
    }

    fn on_lock(&mut self, lock: &[u8], pk: &str) {
        log::debug!("Hub lock received, pk {}", pk);

        let config = &self.inner.config;

        if lock.starts_with(nmdc::EXTENDED_PROTOCOL) {
            let mut features: Vec<String> = [
                "UserCommand",
                "NoGetINFO",
                "NoHello",
                "UserIP2",
                "TTHSearch",
            ]
            .iter()
            .map(|feature| feature.to_string())
            .collect();
            if !config.hub_disable_compression {
                features.push("ZPipe0".to_owned());
            }
            if config.peer_encryption_mode != PeerEncryptionMode::Disable {
                features.push("TLS".to_owned());
            }
            self.writer.send(&Message::Supports(features));
        }

        self.writer.send(&Message::Key(lock_to_key(lock)));
        self.writer.send(&Message::ValidateNick(config.nick.clone()));

        self.inner.lock().hub.phase = HubPhase::Authenticating;
    }

    fn on_get_pass(&mut self) -> Result<()> {
        let password = self
            .inner
            .config
            .password
            .clone()
            .ok_or(AuthError::PasswordRequired)?;

        self.writer.send(&Message::MyPass(password));
        Ok(())
    }

    fn on_hello(&mut self) {
        self.writer.send(&Message::Version(PROTOCOL_VERSION.to_owned()));
        self.writer.send(&Message::GetNickList);

        let state = self.inner.lock();
        self.writer.send(&Message::MyInfo(my_info(self.inner, &state)));
    }

    fn on_initialized(&self) {
        let mut state = self.inner.lock();
        state.hub.phase = HubPhase::Initialized;
        log::info!("Connected to hub {} ({} users)", self.inner.url, state.peers.len());
        self.inner.emit(ClientEvent::HubConnected);
    }

    fn on_my_info(&mut self, info: MyInfo) {
        if info.nick == self.nick() {
            return;
        }

        let mut state = self.inner.lock();

        let mut peer = state
            .peers
            .get(&info.nick)
            .cloned()
            .unwrap_or_else(|| Peer::new(info.nick.as_str()));

        peer.supports_tls = info.supports_tls();
        peer.description = info.description;
        peer.email = info.email;
        peer.client = info.client;
        peer.version = info.version;
        peer.share_size = info.share_size;
        peer.is_passive = info.mode != Mode::Active;
        peer.nmdc_status = info.status;

        let event = if state.peers.upsert(peer.clone()) {
            ClientEvent::PeerConnected(peer)
        } else {
            ClientEvent::PeerUpdated(peer)
        };
        self.inner.emit(event);
    }

    fn update_peers(&self, nicks: Vec<String>, update: impl Fn(&mut Peer)) {
        let mut state = self.inner.lock();

        for nick in nicks {
            if let Some(peer) = state.peers.get_mut(&nick) {
                update(peer);
                let peer = peer.clone();
                self.inner.emit(ClientEvent::PeerUpdated(peer));
            }
        }
    }

    fn on_user_ip(&self, entries: Vec<(String, String)>) {
        let mut state = self.inner.lock();

        for (nick, ip) in entries {
            if nick == self.nick() {
                // Our address as the hub sees it.
                if let Ok(ip) = ip.parse() {
                    state.hub.local_ip = Some(ip);
                }
                continue;
            }

            if let Some(peer) = state.peers.get_mut(&nick) {
                peer.ip = ip.parse().ok();
                let peer = peer.clone();
                self.inner.emit(ClientEvent::PeerUpdated(peer));
            }
        }
    }

    fn on_search(&self, search: nmdc::Search) {
        let query = match LocalQuery::from_nmdc(&search) {
            Some(query) => query,
            None => return,
        };

        let state = self.inner.lock();

        let (target, limit) = match &search.origin {
            SearchOrigin::Passive(nick) if nick == self.nick() => return,
            SearchOrigin::Passive(_) => (None, search::MAX_PASSIVE_RESULTS),
            SearchOrigin::Active(addr) => match addr.parse::<SocketAddr>() {
                Ok(addr) if Some(addr) == own_search_addr(self.inner, &state) => return,
                Ok(addr) => (Some(addr), search::MAX_ACTIVE_RESULTS),
                Err(_) => {
                    log::debug!("Search from unparseable address {}", addr);
                    return;
                }
            },
        };

        let tree = state.share.tree.clone();
        let slots = (state.slots.free_uploads(), state.slots.upload_max());
        let hub = format!("{}:{}", self.inner.url.host, self.inner.url.port);

        let replies = search::search_share(&tree, &query, limit)
            .into_iter()
            .map(|hit| hit.to_nmdc(self.nick(), slots, &hub));

        match (target, &search.origin) {
            (Some(addr), _) => {
                let datagrams = replies
                    .map(|reply| Datagram::Nmdc(Message::SearchReply(reply)))
                    .collect();
                send_datagrams(self.inner, addr, datagrams);
            }
            (None, SearchOrigin::Passive(nick)) => {
                for mut reply in replies {
                    reply.target = Some(nick.clone());
                    self.writer.send(&Message::SearchReply(reply));
                }
            }
            (None, SearchOrigin::Active(_)) => (),
        }
    }

    fn on_connect_to_me(&self, addr: &str, secure: bool) {
        let mode = self.inner.config.peer_encryption_mode;
        if (secure && mode == PeerEncryptionMode::Disable)
            || (!secure && mode == PeerEncryptionMode::Force)
        {
            log::debug!("Ignoring $ConnectToMe {} (secure: {})", addr, secure);
            return;
        }

        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_owned(), port),
                Err(_) => return,
            },
            None => return,
        };

        task::spawn(link::dial(
            self.inner.clone(),
            host,
            port,
            secure,
            Greeting::Nmdc,
        ));
    }

    fn on_rev_connect_to_me(&self, nick: &str) {
        if self.inner.is_passive() {
            log::debug!("{} and we are both passive", nick);
            return;
        }

        let state = self.inner.lock();
        let message = state
            .peers
            .get(nick)
            .ok_or_else(|| TransferError::PeerNotFound.into())
            .and_then(|peer| connect_to_me(self.inner, &state, peer));

        match message {
            Ok(message) => self.writer.send(&message),
            Err(error) => log::debug!("Cannot answer $RevConnectToMe from {}: {}", nick, error),
        }
    }
}

// ----------------------------------------------------------------------------//

fn my_info(inner: &Inner, state: &State) -> MyInfo {
    let config = &inner.config;

    let mut status = STATUS_NORMAL;
    if inner.tls_available() {
        status |= STATUS_TLS;
    }

    MyInfo {
        nick: config.nick.clone(),
        description: config.description.clone(),
        client: config.client_string.clone(),
        version: config.client_version.clone(),
        mode: if inner.is_passive() {
            Mode::Passive
        } else {
            Mode::Active
        },
        hubs: [
            config.hub_unregistered_count,
            config.hub_registered_count,
            config.hub_operator_count,
        ],
        slots: state.slots.upload_max() as u32,
        connection: config.connection.clone(),
        status,
        email: config.email.clone(),
        share_size: state.share.tree.total_size(),
    }
}

fn own_search_addr(inner: &Inner, state: &State) -> Option<SocketAddr> {
    Some(SocketAddr::new(
        inner.advertised_ip(state)?,
        inner.ports.udp?,
    ))
}

fn connect_to_me(inner: &Inner, state: &State, peer: &Peer) -> Result<Message> {
    let secure = inner.use_tls_with(peer)?;
    let port = if secure { inner.ports.tls } else { inner.ports.tcp }
        .ok_or_else(|| Error::protocol("no listener for peer links"))?;
    let ip: IpAddr = inner
        .advertised_ip(state)
        .ok_or_else(|| Error::protocol("own address is unknown"))?;

    Ok(Message::ConnectToMe {
        target: peer.nick.clone(),
        addr: SocketAddr::new(ip, port).to_string(),
        secure,
    })
}

pub(super) fn announce_share(inner: &Inner, state: &State, writer: &ConnWriter<Message>) {
    writer.send(&Message::MyInfo(my_info(inner, state)));
}

pub(super) fn send_search(
    inner: &Inner,
    state: &State,
    writer: &ConnWriter<Message>,
    request: &SearchRequest,
) -> Result<()> {
    if !request.is_valid_for_nmdc() {
        return Err(Error::protocol("search query is too short"));
    }

    let origin = match own_search_addr(inner, state) {
        Some(addr) if !inner.is_passive() => SearchOrigin::Active(addr.to_string()),
        _ => SearchOrigin::Passive(inner.config.nick.clone()),
    };

    writer.send(&Message::Search(request.to_nmdc(origin)));
    Ok(())
}

pub(super) fn request_connection(
    inner: &Inner,
    state: &State,
    writer: &ConnWriter<Message>,
    nick: &str,
) -> Result<PendingKey> {
    let peer = state.peers.get(nick).ok_or(TransferError::PeerNotFound)?;

    if inner.is_passive() {
        if peer.is_passive {
            return Err(TransferError::BothPassive.into());
        }
        // Fail early when the peer cannot satisfy our encryption mode.
        inner.use_tls_with(peer)?;

        writer.send(&Message::RevConnectToMe {
            from: inner.config.nick.clone(),
            to: peer.nick.clone(),
        });
    } else {
        writer.send(&connect_to_me(inner, state, peer)?);
    }

    Ok(PendingKey::Nick(nick.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NICK: &str = "alice";

    fn lock() -> Message {
        Message::Lock {
            lock: b"EXTENDEDPROTOCOL_hub".to_vec(),
            pk: "hub".to_owned(),
        }
    }

    fn hello() -> Message {
        Message::Hello(NICK.to_owned())
    }

    fn connect_to_me() -> Message {
        Message::ConnectToMe {
            target: NICK.to_owned(),
            addr: "127.0.0.1:4000".to_owned(),
            secure: false,
        }
    }

    fn feed(sequence: &mut Sequence, messages: &[Message]) -> Result<Vec<Option<Phase>>> {
        messages
            .iter()
            .map(|message| sequence.advance(message, NICK))
            .collect()
    }

    #[test]
    fn login_order() {
        let mut sequence = Sequence::new();
        let entered = feed(
            &mut sequence,
            &[
                lock(),
                Message::HubName("hub".to_owned()),
                Message::Supports(vec!["NoHello".to_owned()]),
                Message::GetPass,
                hello(),
                Message::Hello("bob".to_owned()),
                Message::OpList(vec![]),
                Message::OpList(vec!["bob".to_owned()]),
                connect_to_me(),
            ],
        )
        .unwrap();

        assert_eq!(
            entered,
            vec![
                Some(Phase::Lock),
                None,
                Some(Phase::PreInitialized),
                None,
                Some(Phase::LoggedIn),
                None,
                Some(Phase::Initialized),
                None,
                None,
            ]
        );
    }

    #[test]
    fn hubs_without_supports_log_in() {
        let mut sequence = Sequence::new();
        feed(&mut sequence, &[lock(), hello(), Message::OpList(vec![])]).unwrap();
        assert_eq!(sequence.phase, Phase::Initialized);
    }

    #[test]
    fn unique_commands_fail_when_repeated() {
        let mut sequence = Sequence::new();
        feed(&mut sequence, &[lock(), Message::HubTopic("one".to_owned())]).unwrap();
        assert!(sequence
            .advance(&Message::HubTopic("two".to_owned()), NICK)
            .is_err());

        let mut sequence = Sequence::new();
        feed(&mut sequence, &[lock(), Message::GetPass]).unwrap();
        assert!(sequence.advance(&Message::GetPass, NICK).is_err());

        let mut sequence = Sequence::new();
        feed(&mut sequence, &[lock(), hello()]).unwrap();
        assert!(sequence.advance(&hello(), NICK).is_err());

        let logged_in = Message::LogedIn(NICK.to_owned());
        assert!(sequence.advance(&logged_in, NICK).is_ok());
        assert!(sequence.advance(&logged_in, NICK).is_err());
    }

    #[test]
    fn commands_out_of_order_fail() {
        assert!(Sequence::new().advance(&connect_to_me(), NICK).is_err());
        assert!(Sequence::new().advance(&hello(), NICK).is_err());
        assert!(Sequence::new().advance(&Message::ZOn, NICK).is_err());

        let mut sequence = Sequence::new();
        feed(&mut sequence, &[lock()]).unwrap();
        assert!(sequence.advance(&lock(), NICK).is_err());
        assert!(sequence.advance(&Message::OpList(vec![]), NICK).is_err());
        assert!(sequence.advance(&connect_to_me(), NICK).is_err());

        feed(&mut sequence, &[hello()]).unwrap();
        assert!(sequence.advance(&Message::GetPass, NICK).is_err());
        assert!(sequence
            .advance(&Message::Supports(Vec::new()), NICK)
            .is_err());
    }

    #[test]
    fn peer_link_commands_from_hub_fail() {
        let mut sequence = Sequence::new();
        feed(&mut sequence, &[lock(), hello(), Message::OpList(vec![])]).unwrap();

        assert!(sequence.advance(&Message::Key(b"key".to_vec()), NICK).is_err());
        assert!(sequence
            .advance(&Message::MyNick("bob".to_owned()), NICK)
            .is_err());
        assert!(sequence.advance(&Message::MaxedOut, NICK).is_err());
    }

    #[test]
    fn chat_and_errors_are_accepted_in_any_phase() {
        let chat = Message::Chat {
            nick: "hub".to_owned(),
            text: "welcome".to_owned(),
        };

        let mut sequence = Sequence::new();
        assert_eq!(sequence.advance(&chat, NICK).unwrap(), None);
        assert_eq!(sequence.advance(&Message::HubIsFull, NICK).unwrap(), None);
        assert_eq!(sequence.phase, Phase::Connected);
    }
}

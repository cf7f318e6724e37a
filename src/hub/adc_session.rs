use super::{not_connected, send_datagrams, HubPhase};
use crate::{
    adc::{
        self,
        status::{self, Status},
        Header, Message, Packet, Sid, PROTOCOL_PLAIN, PROTOCOL_TLS,
    },
    client::{ClientEvent, Inner, State},
    config::PeerEncryptionMode,
    conn::{ConnReader, ConnWriter},
    error::{AuthError, Error, Result, TransferError},
    link::{self, Greeting},
    peer::{AdcIdentity, Peer},
    search::{self, LocalQuery, SearchRequest, SearchResult},
    socket::Datagram,
    tiger::{decode_base32, encode_base32, TigerHash},
    transfer::download::PendingKey,
};
use rand::{distributions::Alphanumeric, Rng};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::task;

const TOKEN_LEN: usize = 10;

// CT bits.
const TYPE_BOT: u32 = 1;
const TYPE_OPERATOR: u32 = 4;
const TYPE_SUPER_USER: u32 = 8;
const TYPE_HUB_OWNER: u32 = 16;
const TYPE_HUB: u32 = 32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    /// Waiting for `ISUP`.
    Protocol,
    /// Waiting for `ISID`.
    Supports,
    /// Waiting for the hub's `IINF`.
    SessionId,
    /// Our `BINF` is sent, the hub verifies us and lists its users.
    HubInfos,
    Normal,
}

const ANY: &[Phase] = &[
    Phase::Protocol,
    Phase::Supports,
    Phase::SessionId,
    Phase::HubInfos,
    Phase::Normal,
];
const SUPPORTS: &[Phase] = &[Phase::Supports];
const HUB_INFOS: &[Phase] = &[Phase::HubInfos];
const IDENTIFIED: &[Phase] = &[Phase::HubInfos, Phase::Normal];
const NORMAL: &[Phase] = &[Phase::Normal];

/// Commands this session knows. Anything else is skipped.
const KNOWN: &[adc::Command] = &[
    adc::CMD,
    adc::CTM,
    adc::GET,
    adc::GPA,
    adc::INF,
    adc::MSG,
    adc::PAS,
    adc::QUI,
    adc::RCM,
    adc::RES,
    adc::SCH,
    adc::SID,
    adc::SND,
    adc::STA,
    adc::SUP,
    adc::ZON,
];

/// Order and uniqueness rules for what the hub sends.
#[derive(Debug)]
struct Sequence {
    phase: Phase,
    password_requested: bool,
}

impl Sequence {
    fn new() -> Self {
        Self {
            phase: Phase::Protocol,
            password_requested: false,
        }
    }

    /// Checks `packet` against the current phase. Returns the phase it moved to, if any.
    /// `own` is our sid once the hub assigned it.
    fn advance(&mut self, packet: &Packet, own: Option<Sid>) -> Result<Option<Phase>> {
        let (allowed, next) = match (&packet.header, packet.command) {
            (Header::Info, adc::SUP) if self.phase == Phase::Protocol => {
                (ANY, Some(Phase::Supports))
            }
            (Header::Info, adc::SUP) => (NORMAL, None),
            (Header::Info, adc::SID) => (SUPPORTS, Some(Phase::SessionId)),
            (Header::Info, adc::INF) if self.phase == Phase::SessionId => {
                (ANY, Some(Phase::HubInfos))
            }
            (Header::Info, adc::INF) => (IDENTIFIED, None),
            (Header::Info, adc::GPA) => {
                if self.password_requested {
                    return Err(Error::protocol("duplicate IGPA"));
                }
                self.password_requested = true;
                (HUB_INFOS, None)
            }
            (Header::Info, adc::CMD) => (IDENTIFIED, Some(Phase::Normal)),
            (Header::Info, adc::STA | adc::QUI | adc::MSG | adc::ZON) => (ANY, None),
            (Header::Broadcast(from), adc::INF) if Some(*from) == own => {
                // The hub echoes our INF after the user list.
                (IDENTIFIED, Some(Phase::Normal))
            }
            (Header::Broadcast(_), adc::INF) => (IDENTIFIED, None),
            (Header::Broadcast(_) | Header::Echo { .. } | Header::Direct { .. }, adc::MSG)
            | (Header::Broadcast(_) | Header::Feature { .. } | Header::Direct { .. }, adc::SCH)
            | (Header::Direct { .. }, adc::RES | adc::CTM | adc::RCM | adc::STA) => (NORMAL, None),
            (_, command) if KNOWN.contains(&command) => {
                return Err(Error::Protocol(format!(
                    "unexpected {} from hub",
                    packet.command_name()
                )))
            }
            _ => return Ok(None),
        };

        if !allowed.contains(&self.phase) {
            return Err(Error::Protocol(format!(
                "unexpected {} in {:?}",
                packet.command_name(),
                self.phase
            )));
        }

        match next {
            Some(next) if next != self.phase => {
                self.phase = next;
                Ok(Some(next))
            }
            _ => Ok(None),
        }
    }
}

enum Action {
    Continue,
    EnableZlib,
}

struct Session<'a> {
    inner: &'a Arc<Inner>,
    writer: ConnWriter<Message>,
    sequence: Sequence,
    sid: Option<Sid>,
}

pub(super) async fn run(
    inner: &Arc<Inner>,
    mut reader: ConnReader<Message>,
    writer: ConnWriter<Message>,
) -> Result<()> {
    let mut features = vec!["ADBAS0", "ADBASE", "ADTIGR", "ADUCM0", "ADBLO0"];
    if !inner.config.hub_disable_compression {
        features.push("ADZLIF");
    }

    let supports = features
        .into_iter()
        .fold(Packet::new(Header::Hub, adc::SUP), |packet, feature| {
            packet.field(&feature[..2], &feature[2..])
        });
    writer.send(&supports.into());

    let mut session = Session {
        inner,
        writer,
        sequence: Sequence::new(),
        sid: None,
    };

    loop {
        let packet = match reader.read().await? {
            Message::KeepAlive => continue,
            Message::Packet(packet) => packet,
        };

        match session.handle(packet)? {
            Action::Continue => (),
            Action::EnableZlib => reader.enable_zlib(),
        }
    }
}

impl Session<'_> {
    fn handle(&mut self, packet: Packet) -> Result<Action> {
        let entered = self.sequence.advance(&packet, self.sid)?;

        match (&packet.header, packet.command) {
            (Header::Info, adc::SUP) => {
                let features: Vec<&str> = packet.get_all("AD").collect();
                log::debug!("Hub supports {}", features.join(" "));
            }
            (Header::Info, adc::SID) => self.on_sid(&packet)?,
            (Header::Info, adc::INF) => self.on_hub_info(&packet, entered),
            (Header::Info, adc::GPA) => self.on_get_password(&packet)?,
            (Header::Info, adc::STA) => self.on_hub_status(&packet)?,
            (Header::Info, adc::QUI) => self.on_quit(&packet)?,
            (Header::Info, adc::MSG) => {
                let text = packet.param_at(0)?.to_owned();
                let _state = self.inner.lock();
                self.inner.emit(ClientEvent::MessagePublic {
                    nick: String::new(),
                    text,
                });
            }
            (Header::Info, adc::ZON) => {
                if self.inner.config.hub_disable_compression {
                    return Err(Error::protocol("hub compressed without being allowed to"));
                }
                return Ok(Action::EnableZlib);
            }
            (Header::Broadcast(from), adc::INF) => {
                if Some(*from) != self.sid {
                    self.on_peer_info(*from, &packet);
                }
            }
            (Header::Broadcast(from), adc::MSG) => self.on_message(*from, &packet, false)?,
            (Header::Echo { from, .. } | Header::Direct { from, .. }, adc::MSG) => {
                self.on_message(*from, &packet, true)?
            }
            (
                Header::Broadcast(from)
                | Header::Feature { from, .. }
                | Header::Direct { from, .. },
                adc::SCH,
            ) => self.on_search(*from, &packet),
            (Header::Direct { from, .. }, adc::RES) => {
                let state = self.inner.lock();
                let result = state
                    .peers
                    .by_sid(from)
                    .and_then(|peer| SearchResult::from_adc(peer.clone(), &packet, false));
                if let Some(result) = result {
                    self.inner.emit(ClientEvent::SearchResult(result));
                }
            }
            (Header::Direct { from, .. }, adc::CTM) => self.on_connect_to_me(*from, &packet)?,
            (Header::Direct { from, .. }, adc::RCM) => self.on_rev_connect_to_me(*from, &packet)?,
            (Header::Direct { from, .. }, adc::STA) => {
                let status = Status::parse(&packet)?;
                log::debug!("Status {:?} from {}", status, from);
            }
            _ => log::debug!("Skipping {} from hub", packet.command_name()),
        }

        if entered == Some(Phase::Normal) {
            self.initialize();
        }

        Ok(Action::Continue)
    }

    fn on_sid(&mut self, packet: &Packet) -> Result<()> {
        let sid: Sid = packet.param_at(0)?.parse()?;
        log::debug!("Assigned sid {}", sid);
        self.sid = Some(sid);

        let mut state = self.inner.lock();
        state.hub.sid = Some(sid);
        state.hub.phase = HubPhase::Authenticating;

        Ok(())
    }

    fn on_hub_info(&mut self, packet: &Packet, entered: Option<Phase>) {
        let mut state = self.inner.lock();
        if let Some(name) = packet.get("NI") {
            state.hub.name = name.to_owned();
        }
        if let Some(topic) = packet.get("DE") {
            state.hub.topic = topic.to_owned();
        }

        if entered == Some(Phase::HubInfos) {
            if let Some(sid) = self.sid {
                let info = own_info(self.inner, &state, sid);
                self.writer.send(&info.into());
            }
        }
    }

    fn on_get_password(&mut self, packet: &Packet) -> Result<()> {
        let password = self
            .inner
            .config
            .password
            .as_deref()
            .ok_or(AuthError::PasswordRequired)?;
        let data = decode_base32(packet.param_at(0)?)
            .map_err(|_| Error::protocol("invalid IGPA data"))?;

        self.writer.send(
            &Packet::new(Header::Hub, adc::PAS)
                .param(password_hash(password, &data))
                .into(),
        );

        Ok(())
    }

    fn on_hub_status(&mut self, packet: &Packet) -> Result<()> {
        let status = Status::parse(packet)?;

        if !status.is_fatal() {
            if status.severity == status::SEVERITY_SUCCESS {
                log::debug!("Hub status: {}", status.description);
            } else {
                log::warn!("Hub status {}: {}", status.code, status.description);
            }
            return Ok(());
        }

        let error = match status.code {
            status::HUB_FULL => AuthError::HubFull,
            status::NICK_INVALID | status::NICK_TAKEN => AuthError::NickRefused,
            status::BAD_PASSWORD => AuthError::BadPassword,
            _ => AuthError::Refused(status.description),
        };

        Err(error.into())
    }

    fn on_quit(&mut self, packet: &Packet) -> Result<()> {
        let sid: Sid = packet.param_at(0)?.parse()?;

        if Some(sid) == self.sid {
            if let Some(address) = packet.get("RD") {
                return Err(AuthError::Redirected(address.to_owned()).into());
            }
            let reason = packet.get("MS").unwrap_or("removed from hub");
            return Err(AuthError::Refused(reason.to_owned()).into());
        }

        let mut state = self.inner.lock();
        if let Some(peer) = state.peers.remove_by_sid(&sid) {
            self.inner.emit(ClientEvent::PeerDisconnected(peer));
        }

        Ok(())
    }

    fn initialize(&self) {
        let mut state = self.inner.lock();
        state.hub.phase = HubPhase::Initialized;
        log::info!("Connected to hub {} ({} users)", self.inner.url, state.peers.len());
        self.inner.emit(ClientEvent::HubConnected);
    }

    fn on_peer_info(&self, sid: Sid, packet: &Packet) {
        let mut state = self.inner.lock();

        let existing = state.peers.by_sid(&sid).cloned();
        let is_new = existing.is_none();

        let mut peer = match existing {
            Some(peer) => peer,
            None => {
                let cid = packet.get("ID").and_then(|cid| cid.parse::<TigerHash>().ok());
                let nick = packet.get("NI");
                let (cid, nick) = match (cid, nick) {
                    (Some(cid), Some(nick)) => (cid, nick),
                    _ => {
                        log::debug!("Incomplete INF for new peer {}", sid);
                        return;
                    }
                };

                Peer {
                    adc: Some(AdcIdentity {
                        sid: sid.to_string(),
                        cid,
                        udp_port: None,
                        fingerprint: None,
                        features: Vec::new(),
                    }),
                    ..Peer::new(nick)
                }
            }
        };

        apply_info(&mut peer, packet);
        state.peers.upsert(peer.clone());

        self.inner.emit(if is_new {
            ClientEvent::PeerConnected(peer)
        } else {
            ClientEvent::PeerUpdated(peer)
        });
    }

    fn on_message(&self, from: Sid, packet: &Packet, private: bool) -> Result<()> {
        if Some(from) == self.sid {
            return Ok(());
        }

        let text = packet.param_at(0)?.to_owned();
        let state = self.inner.lock();
        let nick = match state.peers.nick_by_sid(&from) {
            Some(nick) => nick.to_owned(),
            None => {
                log::debug!("Message from unknown sid {}", from);
                return Ok(());
            }
        };

        self.inner.emit(if private {
            ClientEvent::MessagePrivate { nick, text }
        } else {
            ClientEvent::MessagePublic { nick, text }
        });

        Ok(())
    }

    fn on_search(&self, from: Sid, packet: &Packet) {
        let own = match self.sid {
            Some(own) if own != from => own,
            _ => return,
        };

        let query = match LocalQuery::from_adc(packet) {
            Some(query) => query,
            None => return,
        };

        let state = self.inner.lock();
        let peer = match state.peers.by_sid(&from) {
            Some(peer) => peer,
            None => return,
        };

        let token = packet.get("TO");
        let free_slots = state.slots.free_uploads();
        let tree = state.share.tree.clone();

        let udp_target = match (peer.is_udp_active(), peer.ip, &peer.adc) {
            (true, Some(ip), Some(identity)) => identity
                .udp_port
                .map(|port| SocketAddr::new(ip, port)),
            _ => None,
        };

        match udp_target {
            Some(addr) => {
                let header = Header::Udp(self.inner.cid);
                let datagrams = search::search_share(&tree, &query, search::MAX_ACTIVE_RESULTS)
                    .iter()
                    .map(|hit| Datagram::Adc(hit.to_adc(header.clone(), free_slots, token)))
                    .collect();
                send_datagrams(self.inner, addr, datagrams);
            }
            None => {
                for hit in search::search_share(&tree, &query, search::MAX_PASSIVE_RESULTS) {
                    let header = Header::Direct { from: own, to: from };
                    self.writer
                        .send(&hit.to_adc(header, free_slots, token).into());
                }
            }
        }
    }

    fn on_connect_to_me(&self, from: Sid, packet: &Packet) -> Result<()> {
        let protocol = packet.param_at(0)?;
        let port: u16 = packet
            .param_at(1)?
            .parse()
            .map_err(|_| Error::protocol("invalid CTM port"))?;
        let token = packet.param_at(2)?.to_owned();

        let own = self.sid.ok_or_else(not_connected)?;

        let secure = match protocol {
            PROTOCOL_PLAIN => false,
            PROTOCOL_TLS => true,
            _ => {
                self.refuse_protocol(own, from, protocol);
                return Ok(());
            }
        };

        let mode = self.inner.config.peer_encryption_mode;
        if (secure && mode == PeerEncryptionMode::Disable)
            || (!secure && mode == PeerEncryptionMode::Force)
        {
            self.refuse_protocol(own, from, protocol);
            return Ok(());
        }

        let state = self.inner.lock();
        let (ip, identity) = match state.peers.by_sid(&from) {
            Some(Peer {
                ip: Some(ip),
                adc: Some(identity),
                ..
            }) => (*ip, identity.clone()),
            _ => {
                log::debug!("CTM from {} without a known address", from);
                return Ok(());
            }
        };

        task::spawn(link::dial(
            self.inner.clone(),
            ip.to_string(),
            port,
            secure,
            Greeting::Adc {
                token,
                peer_cid: identity.cid,
                fingerprint: identity.fingerprint,
            },
        ));

        Ok(())
    }

    fn on_rev_connect_to_me(&self, from: Sid, packet: &Packet) -> Result<()> {
        let protocol = packet.param_at(0)?;
        let token = packet.param_at(1)?;
        let own = self.sid.ok_or_else(not_connected)?;

        if self.inner.is_passive() {
            log::debug!("{} and we are both passive", from);
            return Ok(());
        }

        let secure = match protocol {
            PROTOCOL_PLAIN => false,
            PROTOCOL_TLS => true,
            _ => {
                self.refuse_protocol(own, from, protocol);
                return Ok(());
            }
        };

        let port = match listening_port(self.inner, secure) {
            Some(port) => port,
            None => {
                self.refuse_protocol(own, from, protocol);
                return Ok(());
            }
        };

        self.writer.send(
            &Packet::new(Header::Direct { from: own, to: from }, adc::CTM)
                .param(protocol)
                .param(port.to_string())
                .param(token)
                .into(),
        );

        Ok(())
    }

    fn refuse_protocol(&self, own: Sid, to: Sid, protocol: &str) {
        log::debug!("Refusing {} link with {}", protocol, to);

        let status = Status::new(
            status::SEVERITY_RECOVERABLE,
            status::PROTOCOL_UNSUPPORTED,
            "Protocol unsupported",
        );
        self.writer.send(
            &status
                .into_packet(Header::Direct { from: own, to })
                .field("PR", protocol)
                .into(),
        );
    }
}

// ----------------------------------------------------------------------------//

fn apply_info(peer: &mut Peer, packet: &Packet) {
    for (name, value) in &packet.fields {
        match name {
            b"NI" => peer.nick = value.clone(),
            b"DE" => peer.description = value.clone(),
            b"EM" => peer.email = value.clone(),
            b"VE" => match value.rsplit_once(' ') {
                Some((client, version)) => {
                    peer.client = client.to_owned();
                    peer.version = version.to_owned();
                }
                None => peer.client = value.clone(),
            },
            b"SS" => peer.share_size = value.parse().unwrap_or(0),
            b"I4" => peer.ip = value.parse::<IpAddr>().ok(),
            b"CT" => {
                let kind: u32 = value.parse().unwrap_or(0);
                peer.is_bot = kind & (TYPE_BOT | TYPE_HUB) != 0;
                peer.is_operator = kind & (TYPE_OPERATOR | TYPE_SUPER_USER | TYPE_HUB_OWNER) != 0;
            }
            _ => (),
        }

        let identity = match peer.adc.as_mut() {
            Some(identity) => identity,
            None => continue,
        };

        match name {
            b"U4" => identity.udp_port = value.parse().ok(),
            b"KP" => identity.fingerprint = Some(value.clone()).filter(|kp| !kp.is_empty()),
            b"SU" => {
                identity.features = value
                    .split(',')
                    .filter(|feature| !feature.is_empty())
                    .map(str::to_owned)
                    .collect();
                let has = |wanted: &str| identity.features.iter().any(|f| f == wanted);
                peer.supports_tls = has("ADC0") || has("ADCS");
                peer.is_passive = !has("TCP4");
            }
            _ => (),
        }
    }
}

/// Our full INF, as sent once after the hub sent its own.
fn own_info(inner: &Inner, state: &State, sid: Sid) -> Packet {
    let config = &inner.config;

    let mut features = Vec::new();
    if inner.tls_available() {
        features.push("ADC0");
    }
    if !inner.is_passive() {
        features.push("TCP4");
        features.push("UDP4");
    }

    let mut packet = Packet::new(Header::Broadcast(sid), adc::INF)
        .field("ID", inner.cid.to_string())
        .field("PD", inner.pid.to_string())
        .field("NI", config.nick.as_str())
        .field("SS", state.share.tree.total_size().to_string())
        .field("SF", state.share.tree.file_count().to_string())
        .field(
            "VE",
            format!("{} {}", config.client_string, config.client_version),
        )
        .field("SL", state.slots.upload_max().to_string())
        .field("HN", config.hub_unregistered_count.to_string())
        .field("HR", config.hub_registered_count.to_string())
        .field("HO", config.hub_operator_count.to_string());

    if !config.description.is_empty() {
        packet = packet.field("DE", config.description.as_str());
    }
    if !config.email.is_empty() {
        packet = packet.field("EM", config.email.as_str());
    }
    if !features.is_empty() {
        packet = packet.field("SU", features.join(","));
    }

    if !inner.is_passive() {
        // The hub fills in the address it sees when we send 0.0.0.0.
        let ip = match inner.config.ip {
            Some(IpAddr::V4(ip)) => ip.to_string(),
            _ => "0.0.0.0".to_owned(),
        };
        packet = packet.field("I4", ip);

        if let Some(port) = inner.ports.udp {
            packet = packet.field("U4", port.to_string());
        }
    }

    if inner.tls_available() {
        packet = packet.field("KP", inner.tls.fingerprint());
    }

    packet
}

/// `HPAS` answer: Tiger of the password followed by the random data of `IGPA`.
fn password_hash(password: &str, data: &[u8]) -> String {
    let mut input = password.as_bytes().to_vec();
    input.extend_from_slice(data);
    encode_base32(TigerHash::digest(&input).as_bytes())
}

fn listening_port(inner: &Inner, secure: bool) -> Option<u16> {
    if secure {
        inner.ports.tls
    } else {
        inner.ports.tcp
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn own_sid(state: &State) -> Result<Sid> {
    state.hub.sid.ok_or_else(not_connected)
}

fn peer_sid(peer: &Peer) -> Result<Sid> {
    peer.adc
        .as_ref()
        .ok_or(TransferError::PeerNotFound)?
        .sid
        .parse()
}

pub(super) fn announce_share(state: &State, writer: &ConnWriter<Message>) {
    if let Ok(sid) = own_sid(state) {
        writer.send(
            &Packet::new(Header::Broadcast(sid), adc::INF)
                .field("SS", state.share.tree.total_size().to_string())
                .field("SF", state.share.tree.file_count().to_string())
                .into(),
        );
    }
}

pub(super) fn send_public(state: &State, writer: &ConnWriter<Message>, text: &str) -> Result<()> {
    let sid = own_sid(state)?;
    writer.send(&Packet::new(Header::Broadcast(sid), adc::MSG).param(text).into());
    Ok(())
}

pub(super) fn send_private(
    state: &State,
    writer: &ConnWriter<Message>,
    peer: &Peer,
    text: &str,
) -> Result<()> {
    let from = own_sid(state)?;
    let to = peer_sid(peer)?;

    writer.send(
        &Packet::new(Header::Echo { from, to }, adc::MSG)
            .param(text)
            .field("PM", from.to_string())
            .into(),
    );
    Ok(())
}

pub(super) fn send_search(
    state: &State,
    writer: &ConnWriter<Message>,
    request: &SearchRequest,
) -> Result<()> {
    let sid = own_sid(state)?;
    writer.send(&request.to_adc(Header::Broadcast(sid), &random_token()).into());
    Ok(())
}

pub(super) fn request_connection(
    inner: &Inner,
    state: &State,
    writer: &ConnWriter<Message>,
    nick: &str,
) -> Result<PendingKey> {
    let from = own_sid(state)?;
    let peer = state.peers.get(nick).ok_or(TransferError::PeerNotFound)?;
    let to = peer_sid(peer)?;

    let secure = inner.use_tls_with(peer)?;
    let protocol = if secure { PROTOCOL_TLS } else { PROTOCOL_PLAIN };
    let token = random_token();

    let packet = if inner.is_passive() {
        if peer.is_passive {
            return Err(TransferError::BothPassive.into());
        }

        Packet::new(Header::Direct { from, to }, adc::RCM)
            .param(protocol)
            .param(token.as_str())
    } else {
        let port = listening_port(inner, secure)
            .ok_or_else(|| Error::protocol("no listener for peer links"))?;

        Packet::new(Header::Direct { from, to }, adc::CTM)
            .param(protocol)
            .param(port.to_string())
            .param(token.as_str())
    };

    writer.send(&packet.into());
    Ok(PendingKey::Token(token))
}

//! NMDC wire format: `|`-terminated messages, most of them `$Command args`.

use crate::{
    conn::Frame,
    error::{Error, Result},
    transfer::{Direction, TransferRequest},
};
use std::fmt;

mod info;
mod key;
mod search;

pub(crate) use self::{
    info::{Mode, MyInfo, STATUS_NORMAL, STATUS_TLS},
    key::lock_to_key,
    search::{Search, SearchOrigin, SearchPattern, SearchReply, TYPE_ANY, TYPE_FOLDER, TYPE_TTH},
};

/// Lock prefix announcing support for `$Supports`.
pub(crate) const EXTENDED_PROTOCOL: &[u8] = b"EXTENDEDPROTOCOL";

#[derive(Clone, PartialEq, Eq)]
pub(crate) enum Message {
    /// An empty message.
    KeepAlive,
    /// `<nick> text`, or a bare line from the hub with an empty nick.
    Chat {
        nick: String,
        text: String,
    },
    /// `$To: <to> From: <from> $<<from>> text`
    PrivateChat {
        to: String,
        from: String,
        text: String,
    },
    Lock {
        lock: Vec<u8>,
        pk: String,
    },
    Key(Vec<u8>),
    Supports(Vec<String>),
    ValidateNick(String),
    ValidateDenide(String),
    GetPass,
    MyPass(String),
    BadPass,
    Hello(String),
    LogedIn(String),
    Version(String),
    GetNickList,
    MyInfo(MyInfo),
    UserIp(Vec<(String, String)>),
    OpList(Vec<String>),
    BotList(Vec<String>),
    HubName(String),
    HubTopic(String),
    HubIsFull,
    ForceMove(String),
    Quit(String),
    ZOn,
    UserCommand(String),
    Search(Search),
    SearchReply(SearchReply),
    ConnectToMe {
        target: String,
        addr: String,
        secure: bool,
    },
    RevConnectToMe {
        from: String,
        to: String,
    },
    MyNick(String),
    Direction {
        direction: Direction,
        bet: u16,
    },
    AdcGet(TransferRequest),
    AdcSnd(TransferRequest),
    MaxedOut,
    Error(String),
}

impl Frame for Message {
    const DELIMITER: u8 = b'|';

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::KeepAlive);
        }

        if bytes[0] != b'$' {
            return Ok(decode_chat(&text(bytes)));
        }

        let (command, args) = match bytes.iter().position(|b| *b == b' ') {
            Some(space) => (&bytes[1..space], &bytes[space + 1..]),
            None => (&bytes[1..], &b""[..]),
        };
        let command = String::from_utf8_lossy(command);
        let args_text = text(args);

        let message = match command.as_ref() {
            "Lock" => decode_lock(args),
            "Key" => Self::Key(args.to_vec()),
            "Supports" => Self::Supports(words(&args_text)),
            "ValidateNick" => Self::ValidateNick(args_text),
            "ValidateDenide" => Self::ValidateDenide(args_text),
            "GetPass" => Self::GetPass,
            "MyPass" => Self::MyPass(args_text),
            "BadPass" => Self::BadPass,
            "Hello" => Self::Hello(args_text),
            "LogedIn" => Self::LogedIn(args_text),
            "Version" => Self::Version(args_text),
            "GetNickList" => Self::GetNickList,
            "MyINFO" => Self::MyInfo(MyInfo::parse(args)?),
            "UserIP" => Self::UserIp(decode_user_ips(&args_text)),
            "OpList" => Self::OpList(nick_list(&args_text)),
            "BotList" => Self::BotList(nick_list(&args_text)),
            "HubName" => Self::HubName(args_text),
            "HubTopic" => Self::HubTopic(args_text),
            "HubIsFull" => Self::HubIsFull,
            "ForceMove" => Self::ForceMove(args_text),
            "Quit" => Self::Quit(args_text),
            "ZOn" => Self::ZOn,
            "UserCommand" => Self::UserCommand(args_text),
            "Search" => Self::Search(Search::parse(&args_text)?),
            "SR" => Self::SearchReply(SearchReply::parse(&args_text)?),
            "ConnectToMe" => decode_connect_to_me(&args_text)?,
            "RevConnectToMe" => {
                let (from, to) = args_text
                    .split_once(' ')
                    .ok_or_else(|| Error::protocol("invalid $RevConnectToMe"))?;
                Self::RevConnectToMe {
                    from: from.to_owned(),
                    to: to.to_owned(),
                }
            }
            "MyNick" => Self::MyNick(args_text),
            "Direction" => decode_direction(&args_text)?,
            "ADCGET" => Self::AdcGet(TransferRequest::parse(&words(&args_text))?),
            "ADCSND" => Self::AdcSnd(TransferRequest::parse(&words(&args_text))?),
            "MaxedOut" => Self::MaxedOut,
            "Error" => Self::Error(args_text),
            "To:" => decode_private_chat(&args_text)?,
            other => return Err(Error::Protocol(format!("unknown command ${}", other))),
        };

        Ok(message)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::KeepAlive => (),
            Self::Chat { nick, text } => {
                push(out, &format!("<{}> {}", nick, escape_chat(text)))
            }
            Self::PrivateChat { to, from, text } => push(
                out,
                &format!("$To: {} From: {} $<{}> {}", to, from, from, escape_chat(text)),
            ),
            Self::Lock { lock, pk } => {
                out.extend_from_slice(b"$Lock ");
                out.extend_from_slice(lock);
                push(out, &format!(" Pk={}", pk));
            }
            Self::Key(key) => {
                out.extend_from_slice(b"$Key ");
                out.extend_from_slice(key);
            }
            Self::Supports(features) => push(out, &format!("$Supports {}", features.join(" "))),
            Self::ValidateNick(nick) => push(out, &format!("$ValidateNick {}", nick)),
            Self::ValidateDenide(nick) => push(out, &format!("$ValidateDenide {}", nick)),
            Self::GetPass => push(out, "$GetPass"),
            Self::MyPass(password) => push(out, &format!("$MyPass {}", password)),
            Self::BadPass => push(out, "$BadPass"),
            Self::Hello(nick) => push(out, &format!("$Hello {}", nick)),
            Self::LogedIn(nick) => push(out, &format!("$LogedIn {}", nick)),
            Self::Version(version) => push(out, &format!("$Version {}", version)),
            Self::GetNickList => push(out, "$GetNickList"),
            Self::MyInfo(info) => info.encode(out),
            Self::UserIp(entries) => {
                let entries: Vec<String> = entries
                    .iter()
                    .map(|(nick, ip)| format!("{} {}", nick, ip))
                    .collect();
                push(out, &format!("$UserIP {}", entries.join("$$")))
            }
            Self::OpList(nicks) => push(out, &format!("$OpList {}$$", nicks.join("$$"))),
            Self::BotList(nicks) => push(out, &format!("$BotList {}$$", nicks.join("$$"))),
            Self::HubName(name) => push(out, &format!("$HubName {}", name)),
            Self::HubTopic(topic) => push(out, &format!("$HubTopic {}", topic)),
            Self::HubIsFull => push(out, "$HubIsFull"),
            Self::ForceMove(addr) => push(out, &format!("$ForceMove {}", addr)),
            Self::Quit(nick) => push(out, &format!("$Quit {}", nick)),
            Self::ZOn => push(out, "$ZOn"),
            Self::UserCommand(args) => push(out, &format!("$UserCommand {}", args)),
            Self::Search(search) => search.encode(out),
            Self::SearchReply(reply) => reply.encode(out),
            Self::ConnectToMe {
                target,
                addr,
                secure,
            } => push(
                out,
                &format!(
                    "$ConnectToMe {} {}{}",
                    target,
                    addr,
                    if *secure { "S" } else { "" }
                ),
            ),
            Self::RevConnectToMe { from, to } => {
                push(out, &format!("$RevConnectToMe {} {}", from, to))
            }
            Self::MyNick(nick) => push(out, &format!("$MyNick {}", nick)),
            Self::Direction { direction, bet } => {
                push(out, &format!("$Direction {} {}", direction.as_str(), bet))
            }
            Self::AdcGet(request) => push(out, &format!("$ADCGET {}", request.to_args().join(" "))),
            Self::AdcSnd(request) => push(out, &format!("$ADCSND {}", request.to_args().join(" "))),
            Self::MaxedOut => push(out, "$MaxedOut"),
            Self::Error(text) => push(out, &format!("$Error {}", text)),
        }

        out.push(Self::DELIMITER);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            // Never log the password.
            Self::MyPass(_) => f.write_str("$MyPass ***"),
            _ => {
                let mut bytes = Vec::new();
                self.encode(&mut bytes);
                bytes.pop();
                write!(f, "{}", String::from_utf8_lossy(&bytes))
            }
        }
    }
}

fn push(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn words(text: &str) -> Vec<String> {
    text.split(' ')
        .filter(|word| !word.is_empty())
        .map(str::to_owned)
        .collect()
}

fn nick_list(text: &str) -> Vec<String> {
    text.split("$$")
        .map(str::trim)
        .filter(|nick| !nick.is_empty())
        .map(str::to_owned)
        .collect()
}

fn decode_lock(args: &[u8]) -> Message {
    let marker = b" Pk=";
    match args.windows(marker.len()).position(|w| w == marker) {
        Some(pos) => {
            let pk = text(&args[pos + marker.len()..]);
            Message::Lock {
                lock: args[..pos].to_vec(),
                pk: pk.split(' ').next().unwrap_or_default().to_owned(),
            }
        }
        None => Message::Lock {
            lock: args.split(|b| *b == b' ').next().unwrap_or_default().to_vec(),
            pk: String::new(),
        },
    }
}

fn decode_user_ips(text: &str) -> Vec<(String, String)> {
    text.split("$$")
        .filter_map(|entry| entry.trim().split_once(' '))
        .map(|(nick, ip)| (nick.to_owned(), ip.to_owned()))
        .collect()
}

fn decode_connect_to_me(args: &str) -> Result<Message> {
    let invalid = || Error::Protocol(format!("invalid $ConnectToMe: {}", args));

    let mut parts = args.split(' ');
    let target = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;
    let addr = parts.next().ok_or_else(invalid)?;

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    // A trailing `S` asks for TLS; NAT traversal suffixes are not supported.
    let (port, secure) = match port.strip_suffix('S') {
        Some(port) => (port, true),
        None => (port, false),
    };
    port.parse::<u16>().map_err(|_| invalid())?;

    Ok(Message::ConnectToMe {
        target: target.to_owned(),
        addr: format!("{}:{}", host, port),
        secure,
    })
}

fn decode_direction(args: &str) -> Result<Message> {
    let invalid = || Error::Protocol(format!("invalid $Direction: {}", args));

    let (direction, bet) = args.split_once(' ').ok_or_else(invalid)?;
    Ok(Message::Direction {
        direction: Direction::parse(direction).ok_or_else(invalid)?,
        bet: bet.trim().parse().map_err(|_| invalid())?,
    })
}

fn decode_chat(line: &str) -> Message {
    if let Some(rest) = line.strip_prefix('<') {
        if let Some((nick, text)) = rest.split_once("> ") {
            return Message::Chat {
                nick: nick.to_owned(),
                text: unescape_chat(text),
            };
        }
    }

    Message::Chat {
        nick: String::new(),
        text: unescape_chat(line),
    }
}

fn decode_private_chat(args: &str) -> Result<Message> {
    let invalid = || Error::Protocol(format!("invalid private message: {}", args));

    let (to, rest) = args.split_once(" From: ").ok_or_else(invalid)?;
    let (from, rest) = rest.split_once(" $").ok_or_else(invalid)?;
    let text = match decode_chat(rest) {
        Message::Chat { text, .. } => text,
        _ => return Err(invalid()),
    };

    Ok(Message::PrivateChat {
        to: to.to_owned(),
        from: from.to_owned(),
        text,
    })
}

fn escape_chat(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('$', "&#36;")
        .replace('|', "&#124;")
}

fn unescape_chat(text: &str) -> String {
    text.replace("&#36;", "$")
        .replace("&#124;", "|")
        .replace("&amp;", "&")
}

// ----------------------------------------------------------------------------//

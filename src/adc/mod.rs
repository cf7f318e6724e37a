//! ADC wire format: newline-terminated packets of space separated, escaped tokens.
//!
//! A packet is `<type><command>` followed by the type's header tokens, the command's positional
//! parameters and finally two-letter named fields.

use crate::{
    conn::Frame,
    error::{Error, Result},
    tiger::TigerHash,
};
use std::{fmt, str::FromStr};

pub(crate) mod status;

pub(crate) type Command = [u8; 3];

pub(crate) const CMD: Command = *b"CMD";
pub(crate) const CTM: Command = *b"CTM";
pub(crate) const GET: Command = *b"GET";
pub(crate) const GPA: Command = *b"GPA";
pub(crate) const INF: Command = *b"INF";
pub(crate) const MSG: Command = *b"MSG";
pub(crate) const PAS: Command = *b"PAS";
pub(crate) const QUI: Command = *b"QUI";
pub(crate) const RCM: Command = *b"RCM";
pub(crate) const RES: Command = *b"RES";
pub(crate) const SCH: Command = *b"SCH";
pub(crate) const SID: Command = *b"SID";
pub(crate) const SND: Command = *b"SND";
pub(crate) const STA: Command = *b"STA";
pub(crate) const SUP: Command = *b"SUP";
pub(crate) const ZON: Command = *b"ZON";

/// Peer link protocols offered in `CTM`/`RCM`.
pub(crate) const PROTOCOL_PLAIN: &str = "ADC/1.0";
pub(crate) const PROTOCOL_TLS: &str = "ADCS/0.10";

/// Number of positional parameters a command carries before its named fields.
fn positional_count(command: &Command) -> usize {
    match command {
        &GET | &SND => 4,
        &CTM => 3,
        &STA | &RCM => 2,
        &MSG | &GPA | &PAS | &QUI | &SID | &CMD => 1,
        _ => 0,
    }
}

/// A four character session id assigned by the hub.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Sid([u8; 4]);

impl FromStr for Sid {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let bytes: [u8; 4] = text
            .as_bytes()
            .try_into()
            .map_err(|_| Error::Protocol(format!("invalid sid: {}", text)))?;

        if !bytes
            .iter()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(b))
        {
            return Err(Error::Protocol(format!("invalid sid: {}", text)));
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Sid({})", self)
    }
}

/// Message type and the routing tokens it carries.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum Header {
    /// `B`: broadcast from a client.
    Broadcast(Sid),
    /// `C`: client to client, on a peer link.
    Client,
    /// `D`: hub relays to one client.
    Direct { from: Sid, to: Sid },
    /// `E`: like `D`, also echoed to the sender.
    Echo { from: Sid, to: Sid },
    /// `F`: broadcast to clients with (`+`) or without (`-`) the given features.
    Feature { from: Sid, features: String },
    /// `H`: client to hub.
    Hub,
    /// `I`: hub to client.
    Info,
    /// `U`: over UDP, from the client with this CID.
    Udp(TigerHash),
}

impl Header {
    fn type_char(&self) -> char {
        match self {
            Self::Broadcast(_) => 'B',
            Self::Client => 'C',
            Self::Direct { .. } => 'D',
            Self::Echo { .. } => 'E',
            Self::Feature { .. } => 'F',
            Self::Hub => 'H',
            Self::Info => 'I',
            Self::Udp(_) => 'U',
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub header: Header,
    pub command: Command,
    pub params: Vec<String>,
    pub fields: Vec<([u8; 2], String)>,
}

impl Packet {
    pub fn new(header: Header, command: Command) -> Self {
        Self {
            header,
            command,
            params: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn param(mut self, value: impl Into<String>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<String>) -> Self {
        let mut name = [b' '; 2];
        for (dst, src) in name.iter_mut().zip(key.bytes()) {
            *dst = src;
        }
        self.fields.push((name, value.into()));
        self
    }

    /// First value of a named field.
    pub fn get<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.get_all(key).next()
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(name, _)| name.as_slice() == key.as_bytes())
            .map(|(_, value)| value.as_str())
    }

    pub fn param_at(&self, index: usize) -> Result<&str> {
        self.params.get(index).map(String::as_str).ok_or_else(|| {
            Error::Protocol(format!(
                "{} is missing parameter {}",
                String::from_utf8_lossy(&self.command),
                index
            ))
        })
    }

    pub fn command_name(&self) -> String {
        format!(
            "{}{}",
            self.header.type_char(),
            String::from_utf8_lossy(&self.command)
        )
    }

    fn decode(line: &str) -> Result<Self> {
        let invalid = || Error::Protocol(format!("invalid packet: {}", line));

        let mut tokens = line.split(' ');
        let head = tokens.next().ok_or_else(invalid)?.as_bytes();
        if head.len() != 4 {
            return Err(invalid());
        }

        let command: Command = [head[1], head[2], head[3]];
        if !command.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            return Err(invalid());
        }

        let mut next = || tokens.next().ok_or_else(invalid);
        let header = match head[0] {
            b'B' => Header::Broadcast(next()?.parse()?),
            b'C' => Header::Client,
            b'D' => Header::Direct {
                from: next()?.parse()?,
                to: next()?.parse()?,
            },
            b'E' => Header::Echo {
                from: next()?.parse()?,
                to: next()?.parse()?,
            },
            b'F' => Header::Feature {
                from: next()?.parse()?,
                features: next()?.to_owned(),
            },
            b'H' => Header::Hub,
            b'I' => Header::Info,
            b'U' => Header::Udp(next()?.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        };

        let mut packet = Packet::new(header, command);
        let positional = positional_count(&command);

        for token in tokens.filter(|token| !token.is_empty()) {
            if packet.params.len() < positional {
                packet.params.push(unescape(token));
            } else {
                let bytes = token.as_bytes();
                if bytes.len() < 2 {
                    return Err(invalid());
                }
                packet
                    .fields
                    .push(([bytes[0], bytes[1]], unescape(&token[2..])));
            }
        }

        Ok(packet)
    }

    fn encode_into(&self, out: &mut String) {
        out.push(self.header.type_char());
        out.push_str(&String::from_utf8_lossy(&self.command));

        match &self.header {
            Header::Broadcast(from) => push_token(out, &from.to_string()),
            Header::Direct { from, to } | Header::Echo { from, to } => {
                push_token(out, &from.to_string());
                push_token(out, &to.to_string());
            }
            Header::Feature { from, features } => {
                push_token(out, &from.to_string());
                push_token(out, features);
            }
            Header::Udp(cid) => push_token(out, &cid.to_string()),
            Header::Client | Header::Hub | Header::Info => (),
        }

        for param in &self.params {
            push_token(out, &escape(param));
        }

        for (name, value) in &self.fields {
            out.push(' ');
            out.push_str(&String::from_utf8_lossy(name));
            out.push_str(&escape(value));
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.command == PAS {
            return f.write_str("HPAS ***");
        }

        let mut text = String::new();
        self.encode_into(&mut text);
        f.write_str(&text)
    }
}

fn push_token(out: &mut String, token: &str) {
    out.push(' ');
    out.push_str(token);
}

/// What travels over an ADC connection: a packet, or an empty keepalive line.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum Message {
    KeepAlive,
    Packet(Packet),
}

impl From<Packet> for Message {
    fn from(packet: Packet) -> Self {
        Self::Packet(packet)
    }
}

impl Frame for Message {
    const DELIMITER: u8 = b'\n';

    fn decode(bytes: &[u8]) -> Result<Self> {
        let line = std::str::from_utf8(bytes)
            .map_err(|_| Error::protocol("packet is not valid UTF-8"))?;
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return Ok(Self::KeepAlive);
        }

        Packet::decode(line).map(Self::Packet)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        if let Self::Packet(packet) = self {
            let mut text = String::new();
            packet.encode_into(&mut text);
            out.extend_from_slice(text.as_bytes());
        }
        out.push(Self::DELIMITER);
    }
}

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }

    out
}

pub(crate) fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

// ----------------------------------------------------------------------------//

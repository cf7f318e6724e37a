use crate::error::{Error, Result};
use std::fmt;

/// Status flag bit for a user that runs a normal client.
pub(crate) const STATUS_NORMAL: u8 = 0x01;
/// Status flag bit for a user that accepts TLS peer connections.
pub(crate) const STATUS_TLS: u8 = 0x10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Mode {
    Active,
    Passive,
    Socks,
}

impl Mode {
    fn as_char(self) -> char {
        match self {
            Self::Active => 'A',
            Self::Passive => 'P',
            Self::Socks => '5',
        }
    }

    fn parse(text: &str) -> Self {
        match text {
            "A" => Self::Active,
            "5" => Self::Socks,
            _ => Self::Passive,
        }
    }
}

/// A user's `$MyINFO` record.
///
/// Wire form: `$MyINFO $ALL <nick> <description><<client> V:<version>,M:<mode>,H:<n>/<r>/<o>,
/// S:<slots>>$ $<connection><status>$<email>$<share size>$`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct MyInfo {
    pub nick: String,
    pub description: String,
    pub client: String,
    pub version: String,
    pub mode: Mode,
    pub hubs: [u32; 3],
    pub slots: u32,
    pub connection: String,
    pub status: u8,
    pub email: String,
    pub share_size: u64,
}

impl MyInfo {
    pub fn supports_tls(&self) -> bool {
        self.status & STATUS_TLS != 0
    }

    pub fn parse(args: &[u8]) -> Result<Self> {
        let invalid = || Error::protocol("invalid $MyINFO");

        let args = args.strip_prefix(b"$ALL ").ok_or_else(invalid)?;
        let space = args.iter().position(|b| *b == b' ').ok_or_else(invalid)?;
        let nick = String::from_utf8_lossy(&args[..space]).into_owned();

        let fields: Vec<&[u8]> = args[space + 1..].split(|b| *b == b'$').collect();
        if fields.len() < 5 || nick.is_empty() {
            return Err(invalid());
        }

        let (description, tag) = split_tag(&String::from_utf8_lossy(fields[0]));
        let mut info = Self {
            nick,
            description,
            client: String::new(),
            version: String::new(),
            mode: Mode::Passive,
            hubs: [0; 3],
            slots: 0,
            connection: String::new(),
            status: 0,
            email: String::from_utf8_lossy(fields[3]).into_owned(),
            share_size: 0,
        };

        if let Some(tag) = tag {
            info.apply_tag(&tag);
        }

        if let Some((&status, connection)) = fields[2].split_last() {
            info.status = status;
            info.connection = String::from_utf8_lossy(connection).into_owned();
        }

        let size = String::from_utf8_lossy(fields[4]);
        if !size.is_empty() {
            info.share_size = size.trim().parse().map_err(|_| invalid())?;
        }

        Ok(info)
    }

    fn apply_tag(&mut self, tag: &str) {
        let mut parts = tag.split(',');

        if let Some(first) = parts.next() {
            match first.split_once(" V:") {
                Some((client, version)) => {
                    self.client = client.to_owned();
                    self.version = version.to_owned();
                }
                None => self.client = first.to_owned(),
            }
        }

        for part in parts {
            match part.split_once(':') {
                Some(("M", mode)) => self.mode = Mode::parse(mode),
                Some(("H", hubs)) => {
                    for (slot, count) in self.hubs.iter_mut().zip(hubs.split('/')) {
                        *slot = count.parse().unwrap_or(0);
                    }
                }
                Some(("S", slots)) => self.slots = slots.parse().unwrap_or(0),
                _ => (),
            }
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(
            format!(
                "$MyINFO $ALL {} {}<{} V:{},M:{},H:{}/{}/{},S:{}>$ ${}",
                self.nick,
                self.description,
                self.client,
                self.version,
                self.mode.as_char(),
                self.hubs[0],
                self.hubs[1],
                self.hubs[2],
                self.slots,
                self.connection,
            )
            .as_bytes(),
        );
        out.push(self.status);
        out.extend_from_slice(format!("${}${}$", self.email, self.share_size).as_bytes());
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

fn split_tag(field: &str) -> (String, Option<String>) {
    if field.ends_with('>') {
        if let Some(open) = field.rfind('<') {
            return (
                field[..open].to_owned(),
                Some(field[open + 1..field.len() - 1].to_owned()),
            );
        }
    }

    (field.to_owned(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_record() {
        let info = MyInfo::parse(
            b"$ALL alice some words<++ V:0.868,M:A,H:1/0/2,S:3>$ $LAN(T3)\x11$a@b.c$12345$",
        )
        .unwrap();

        assert_eq!(info.nick, "alice");
        assert_eq!(info.description, "some words");
        assert_eq!(info.client, "++");
        assert_eq!(info.version, "0.868");
        assert_eq!(info.mode, Mode::Active);
        assert_eq!(info.hubs, [1, 0, 2]);
        assert_eq!(info.slots, 3);
        assert_eq!(info.connection, "LAN(T3)");
        assert_eq!(info.status, 0x11);
        assert!(info.supports_tls());
        assert_eq!(info.email, "a@b.c");
        assert_eq!(info.share_size, 12345);
    }

    #[test]
    fn parses_bare_record() {
        let info = MyInfo::parse(b"$ALL bob $ $$$$").unwrap();

        assert_eq!(info.nick, "bob");
        assert_eq!(info.description, "");
        assert_eq!(info.mode, Mode::Passive);
        assert_eq!(info.share_size, 0);
        assert!(!info.supports_tls());

        assert!(MyInfo::parse(b"$ALL carol").is_err());
        assert!(MyInfo::parse(b"carol x$ $$$$").is_err());
    }

    #[test]
    fn encodes_tag_and_status_byte() {
        let info = MyInfo {
            nick: "me".into(),
            description: "desc".into(),
            client: "dckit".into(),
            version: "0.1".into(),
            mode: Mode::Passive,
            hubs: [1, 0, 0],
            slots: 2,
            connection: "LAN(T3)".into(),
            status: STATUS_NORMAL,
            email: "".into(),
            share_size: 77,
        };

        let mut out = Vec::new();
        info.encode(&mut out);
        assert_eq!(
            out,
            b"$MyINFO $ALL me desc<dckit V:0.1,M:P,H:1/0/0,S:2>$ $LAN(T3)\x01$$77$".to_vec()
        );
        assert_eq!(MyInfo::parse(&out[8..]).unwrap(), info);
    }
}

use crate::{
    error::{Error, Result},
    tiger::{TigerHash, TIGER_HASH_BASE32_LEN},
};

pub(crate) const TYPE_ANY: u8 = 1;
pub(crate) const TYPE_FOLDER: u8 = 8;
pub(crate) const TYPE_TTH: u8 = 9;

/// Where results for a `$Search` go.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum SearchOrigin {
    /// Results are sent over UDP to this address.
    Active(String),
    /// Results are relayed by the hub to this nick.
    Passive(String),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum SearchPattern {
    Tth(TigerHash),
    Words(Vec<String>),
}

/// `$Search <origin> <restricted>?<is max>?<size>?<type>?<pattern>`
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct Search {
    pub origin: SearchOrigin,
    /// `(is_max, size)` when the search is size restricted.
    pub size_limit: Option<(bool, u64)>,
    pub data_type: u8,
    pub pattern: SearchPattern,
}

impl Search {
    pub fn parse(args: &str) -> Result<Self> {
        let invalid = || Error::Protocol(format!("invalid $Search: {}", args));

        let (origin, query) = args.split_once(' ').ok_or_else(invalid)?;
        let origin = match origin.strip_prefix("Hub:") {
            Some(nick) => SearchOrigin::Passive(nick.to_owned()),
            None => SearchOrigin::Active(origin.to_owned()),
        };

        let fields: Vec<&str> = query.splitn(5, '?').collect();
        if fields.len() != 5 {
            return Err(invalid());
        }

        let size: u64 = fields[2].parse().map_err(|_| invalid())?;
        let size_limit = match fields[0] {
            "T" => Some((fields[1] == "T", size)),
            _ => None,
        };
        let data_type = fields[3].parse().map_err(|_| invalid())?;

        let pattern = match fields[4].strip_prefix("TTH:") {
            Some(tth) if data_type == TYPE_TTH => {
                SearchPattern::Tth(tth.parse().map_err(|_| invalid())?)
            }
            _ => SearchPattern::Words(
                fields[4]
                    .split('$')
                    .filter(|word| !word.is_empty())
                    .map(str::to_owned)
                    .collect(),
            ),
        };

        Ok(Self {
            origin,
            size_limit,
            data_type,
            pattern,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let origin = match &self.origin {
            SearchOrigin::Active(addr) => addr.clone(),
            SearchOrigin::Passive(nick) => format!("Hub:{}", nick),
        };
        let (restricted, is_max, size) = match self.size_limit {
            Some((is_max, size)) => ("T", if is_max { "T" } else { "F" }, size),
            None => ("F", "T", 0),
        };
        let pattern = match &self.pattern {
            SearchPattern::Tth(tth) => format!("TTH:{}", tth),
            SearchPattern::Words(words) => words.join("$"),
        };

        out.extend_from_slice(
            format!(
                "$Search {} {}?{}?{}?{}?{}",
                origin, restricted, is_max, size, self.data_type, pattern
            )
            .as_bytes(),
        );
    }
}

/// `$SR` search result. Files carry a size, directories do not.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct SearchReply {
    pub nick: String,
    /// Backslash separated path, without a leading separator.
    pub path: String,
    pub size: Option<u64>,
    pub free_slots: u32,
    pub total_slots: u32,
    pub tth: Option<TigerHash>,
    /// Hub address as written between the parentheses.
    pub hub: String,
    /// Nick the hub should relay a passive result to.
    pub target: Option<String>,
}

impl SearchReply {
    pub fn parse(args: &str) -> Result<Self> {
        let invalid = || Error::Protocol(format!("invalid $SR: {}", args));

        let (nick, rest) = args.split_once(' ').ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('\x05').collect();

        let is_directory = parts.len() >= 2
            && (parts[1].starts_with("TTH:") || parts[1].ends_with(')'))
            && !parts[1].contains('/');

        let (path, size, slots, hub_part, target) = if is_directory {
            let (path, slots) = parts[0].rsplit_once(' ').ok_or_else(invalid)?;
            (path, None, slots, parts[1], parts.get(2))
        } else {
            if parts.len() < 3 {
                return Err(invalid());
            }
            let (size, slots) = parts[1].split_once(' ').ok_or_else(invalid)?;
            let size = size.parse().map_err(|_| invalid())?;
            (parts[0], Some(size), slots, parts[2], parts.get(3))
        };

        let (free_slots, total_slots) = slots.split_once('/').ok_or_else(invalid)?;
        let (hub_name, hub) = hub_part.rsplit_once(" (").ok_or_else(invalid)?;

        let tth = match hub_name.strip_prefix("TTH:") {
            Some(tth) => {
                let tth: TigerHash = tth.parse().map_err(|_| invalid())?;
                (tth != TigerHash::from([0; 24])).then_some(tth)
            }
            None => None,
        };

        Ok(Self {
            nick: nick.to_owned(),
            path: path.to_owned(),
            size,
            free_slots: free_slots.parse().map_err(|_| invalid())?,
            total_slots: total_slots.parse().map_err(|_| invalid())?,
            tth,
            hub: hub.trim_end_matches(')').to_owned(),
            target: target.map(|target| target.to_string()),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        // Directories without a hash advertise the all-zero one.
        let tth = self
            .tth
            .map(|tth| tth.to_string())
            .unwrap_or_else(|| "A".repeat(TIGER_HASH_BASE32_LEN));

        let head = match self.size {
            Some(size) => format!(
                "$SR {} {}\x05{} {}/{}",
                self.nick, self.path, size, self.free_slots, self.total_slots
            ),
            None => format!(
                "$SR {} {} {}/{}",
                self.nick, self.path, self.free_slots, self.total_slots
            ),
        };

        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(format!("\x05TTH:{} ({})", tth, self.hub).as_bytes());

        if let Some(target) = &self.target {
            out.extend_from_slice(format!("\x05{}", target).as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTH: &str = "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY";

    #[test]
    fn parses_word_search() {
        let search = Search::parse("Hub:bob F?T?0?1?test$file.txt").unwrap();

        assert_eq!(search.origin, SearchOrigin::Passive("bob".into()));
        assert_eq!(search.size_limit, None);
        assert_eq!(search.data_type, TYPE_ANY);
        assert_eq!(
            search.pattern,
            SearchPattern::Words(vec!["test".into(), "file.txt".into()])
        );
    }

    #[test]
    fn tth_search_survives_encoding() {
        let search = Search {
            origin: SearchOrigin::Active("1.2.3.4:412".into()),
            size_limit: Some((true, 100)),
            data_type: TYPE_TTH,
            pattern: SearchPattern::Tth(TTH.parse().unwrap()),
        };

        let mut out = Vec::new();
        search.encode(&mut out);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, format!("$Search 1.2.3.4:412 T?T?100?9?TTH:{}", TTH));
        assert_eq!(Search::parse(&text["$Search ".len()..]).unwrap(), search);
    }

    #[test]
    fn parses_file_result() {
        let args = format!(
            "alice share\\inner folder\\test file.txt\x0510000 2/3\x05TTH:{} (127.0.0.1:411)\x05bob",
            TTH
        );
        let reply = SearchReply::parse(&args).unwrap();

        assert_eq!(reply.nick, "alice");
        assert_eq!(reply.path, "share\\inner folder\\test file.txt");
        assert_eq!(reply.size, Some(10000));
        assert_eq!((reply.free_slots, reply.total_slots), (2, 3));
        assert_eq!(reply.tth, Some(TTH.parse().unwrap()));
        assert_eq!(reply.hub, "127.0.0.1:411");
        assert_eq!(reply.target.as_deref(), Some("bob"));

        let mut out = Vec::new();
        reply.encode(&mut out);
        assert_eq!(out, format!("$SR {}", args).into_bytes());
    }

    #[test]
    fn directory_result_without_hash() {
        let reply = SearchReply {
            nick: "alice".into(),
            path: "share\\inner folder".into(),
            size: None,
            free_slots: 1,
            total_slots: 1,
            tth: None,
            hub: "127.0.0.1:411".into(),
            target: None,
        };

        let mut out = Vec::new();
        reply.encode(&mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\x05TTH:AAAAAAAA"));
        assert_eq!(SearchReply::parse(&text["$SR ".len()..]).unwrap(), reply);
    }
}

//! Outgoing searches, results, and matching incoming searches against our share.

use crate::{
    adc::{self, Header, Packet},
    nmdc,
    peer::Peer,
    share::{ShareDirectory, ShareFile, ShareTree},
    tiger::TigerHash,
};

/// Results sent to a requester that can receive them over UDP.
pub(crate) const MAX_ACTIVE_RESULTS: usize = 10;
/// Results relayed through the hub.
pub(crate) const MAX_PASSIVE_RESULTS: usize = 5;
/// NMDC hubs drop shorter queries, so neither do we send nor answer them.
pub(crate) const NMDC_MIN_QUERY_LEN: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchQuery {
    /// Files and directories whose name contains every word.
    Any(String),
    /// Directories whose name contains every word.
    Directory(String),
    Tth(TigerHash),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: SearchQuery,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

impl SearchRequest {
    pub fn any(text: impl Into<String>) -> Self {
        Self::new(SearchQuery::Any(text.into()))
    }

    pub fn directory(text: impl Into<String>) -> Self {
        Self::new(SearchQuery::Directory(text.into()))
    }

    pub fn tth(tth: TigerHash) -> Self {
        Self::new(SearchQuery::Tth(tth))
    }

    pub fn min_size(mut self, size: u64) -> Self {
        self.min_size = Some(size);
        self
    }

    pub fn max_size(mut self, size: u64) -> Self {
        self.max_size = Some(size);
        self
    }

    fn new(query: SearchQuery) -> Self {
        Self {
            query,
            min_size: None,
            max_size: None,
        }
    }

    pub(crate) fn to_nmdc(&self, origin: nmdc::SearchOrigin) -> nmdc::Search {
        // NMDC carries a single bound.
        let size_limit = match (self.min_size, self.max_size) {
            (_, Some(max)) => Some((true, max)),
            (Some(min), None) => Some((false, min)),
            (None, None) => None,
        };

        let (data_type, pattern) = match &self.query {
            SearchQuery::Any(text) => (nmdc::TYPE_ANY, nmdc::SearchPattern::Words(words(text))),
            SearchQuery::Directory(text) => {
                (nmdc::TYPE_FOLDER, nmdc::SearchPattern::Words(words(text)))
            }
            SearchQuery::Tth(tth) => (nmdc::TYPE_TTH, nmdc::SearchPattern::Tth(*tth)),
        };

        nmdc::Search {
            origin,
            size_limit,
            data_type,
            pattern,
        }
    }

    pub(crate) fn to_adc(&self, header: Header, token: &str) -> Packet {
        let mut packet = Packet::new(header, adc::SCH);

        match &self.query {
            SearchQuery::Any(text) => {
                for word in words(text) {
                    packet = packet.field("AN", word);
                }
            }
            SearchQuery::Directory(text) => {
                for word in words(text) {
                    packet = packet.field("AN", word);
                }
                packet = packet.field("TY", "2");
            }
            SearchQuery::Tth(tth) => packet = packet.field("TR", tth.to_string()),
        }

        if let Some(min) = self.min_size {
            packet = packet.field("GE", min.to_string());
        }
        if let Some(max) = self.max_size {
            packet = packet.field("LE", max.to_string());
        }

        packet.field("TO", token)
    }

    /// Whether an NMDC hub would relay this search.
    pub(crate) fn is_valid_for_nmdc(&self) -> bool {
        match &self.query {
            SearchQuery::Any(text) | SearchQuery::Directory(text) => {
                text.trim().chars().count() >= NMDC_MIN_QUERY_LEN
            }
            SearchQuery::Tth(_) => true,
        }
    }
}

/// A file or directory found in a peer's share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    pub peer: Peer,
    /// `/`-separated path rooted at the peer's share alias.
    pub path: String,
    /// `None` for directories.
    pub tth: Option<TigerHash>,
    pub size: Option<u64>,
    pub slot_available: bool,
    pub is_directory: bool,
    /// Whether the result arrived over UDP rather than through the hub.
    pub is_active: bool,
}

impl SearchResult {
    pub(crate) fn from_nmdc(peer: Peer, reply: &nmdc::SearchReply, is_active: bool) -> Self {
        Self {
            peer,
            path: format!("/{}", reply.path.replace('\\', "/").trim_matches('/')),
            tth: reply.tth,
            size: reply.size,
            slot_available: reply.free_slots > 0,
            is_directory: reply.size.is_none(),
            is_active,
        }
    }

    pub(crate) fn from_adc(peer: Peer, packet: &Packet, is_active: bool) -> Option<Self> {
        let name = packet.get("FN")?;
        let is_directory = name.ends_with('/');
        let tth = match packet.get("TR") {
            Some(tth) => Some(tth.parse().ok()?),
            None => None,
        };

        Some(Self {
            peer,
            path: format!("/{}", name.trim_matches('/')),
            tth: if is_directory { None } else { tth },
            size: if is_directory {
                None
            } else {
                packet.get("SI").and_then(|size| size.parse().ok())
            },
            slot_available: packet
                .get("SL")
                .and_then(|slots| slots.parse::<u32>().ok())
                .map_or(false, |slots| slots > 0),
            is_directory,
            is_active,
        })
    }
}

fn words(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_owned).collect()
}

// ----------------------------------------------------------------------------//

/// An incoming search, whatever dialect it came in.
#[derive(Debug, Default)]
pub(crate) struct LocalQuery {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub extensions: Vec<String>,
    pub tth: Option<TigerHash>,
    pub files: bool,
    pub directories: bool,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

impl LocalQuery {
    /// `None` when the search type is one we do not answer.
    pub fn from_nmdc(search: &nmdc::Search) -> Option<Self> {
        let mut query = Self::default();

        match (&search.pattern, search.data_type) {
            (nmdc::SearchPattern::Tth(tth), _) => {
                query.tth = Some(*tth);
                query.files = true;
            }
            (nmdc::SearchPattern::Words(words), data_type) => {
                if words.join(" ").chars().count() < NMDC_MIN_QUERY_LEN {
                    return None;
                }
                match data_type {
                    nmdc::TYPE_ANY => {
                        query.files = true;
                        query.directories = true;
                    }
                    nmdc::TYPE_FOLDER => query.directories = true,
                    _ => return None,
                }
                query.include = words.iter().map(|word| word.to_lowercase()).collect();
            }
        }

        match search.size_limit {
            Some((true, size)) => query.max_size = Some(size),
            Some((false, size)) => query.min_size = Some(size),
            None => (),
        }

        Some(query)
    }

    pub fn from_adc(packet: &Packet) -> Option<Self> {
        let mut query = Self {
            include: lowercase(packet.get_all("AN")),
            exclude: lowercase(packet.get_all("NO")),
            extensions: lowercase(packet.get_all("EX")),
            ..Self::default()
        };

        if let Some(tth) = packet.get("TR") {
            query.tth = Some(tth.parse().ok()?);
            query.files = true;
            return Some(query);
        }

        match packet.get("TY") {
            Some("1") => query.files = true,
            Some("2") => query.directories = true,
            _ => {
                query.files = true;
                query.directories = query.extensions.is_empty();
            }
        }

        if let Some(size) = packet.get("EQ").and_then(|size| size.parse().ok()) {
            query.min_size = Some(size);
            query.max_size = Some(size);
        }
        if let Some(size) = packet.get("GE").and_then(|size| size.parse().ok()) {
            query.min_size = Some(size);
        }
        if let Some(size) = packet.get("LE").and_then(|size| size.parse().ok()) {
            query.max_size = Some(size);
        }

        if query.include.is_empty() && query.extensions.is_empty() {
            return None;
        }

        Some(query)
    }

    fn matches_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();

        self.include.iter().all(|word| name.contains(word.as_str()))
            && !self.exclude.iter().any(|word| name.contains(word.as_str()))
    }

    fn matches_file(&self, file: &ShareFile) -> bool {
        if self.min_size.map_or(false, |min| file.size < min)
            || self.max_size.map_or(false, |max| file.size > max)
        {
            return false;
        }

        if !self.extensions.is_empty() {
            let name = file.name.to_lowercase();
            let extension = name.rsplit_once('.').map(|(_, extension)| extension);
            if !self
                .extensions
                .iter()
                .any(|wanted| extension == Some(wanted.as_str()))
            {
                return false;
            }
        }

        self.matches_name(&file.name)
    }

    fn matches_directory(&self, directory: &ShareDirectory) -> bool {
        // Sizes only restrict files.
        self.min_size.is_none() && self.max_size.is_none() && self.matches_name(&directory.name)
    }
}

fn lowercase<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    values.map(str::to_lowercase).collect()
}

#[derive(Debug)]
pub(crate) enum Hit<'a> {
    File(&'a ShareFile),
    Directory(&'a ShareDirectory),
}

impl Hit<'_> {
    /// `/`-separated path rooted at the share alias.
    pub fn path(&self) -> &str {
        match self {
            Self::File(file) => &file.path,
            Self::Directory(directory) => &directory.path,
        }
    }

    pub fn to_nmdc(&self, nick: &str, slots: (usize, usize), hub: &str) -> nmdc::SearchReply {
        let (size, tth) = match self {
            Self::File(file) => (Some(file.size), Some(file.tth)),
            Self::Directory(_) => (None, None),
        };

        nmdc::SearchReply {
            nick: nick.to_owned(),
            path: self.path().trim_start_matches('/').replace('/', "\\"),
            size,
            free_slots: slots.0 as u32,
            total_slots: slots.1 as u32,
            tth,
            hub: hub.to_owned(),
            target: None,
        }
    }

    pub fn to_adc(&self, header: Header, free_slots: usize, token: Option<&str>) -> Packet {
        let mut packet = Packet::new(header, adc::RES);

        packet = match self {
            Self::File(file) => packet
                .field("FN", file.path.clone())
                .field("SI", file.size.to_string())
                .field("TR", file.tth.to_string()),
            Self::Directory(directory) => packet.field("FN", format!("{}/", directory.path)),
        };

        packet = packet.field("SL", free_slots.to_string());

        if let Some(token) = token {
            packet = packet.field("TO", token);
        }

        packet
    }
}

/// Matches a query against the share, returning at most `limit` hits.
pub(crate) fn search_share<'a>(
    tree: &'a ShareTree,
    query: &LocalQuery,
    limit: usize,
) -> Vec<Hit<'a>> {
    if let Some(tth) = &query.tth {
        return tree.file_by_tth(tth).map(Hit::File).into_iter().collect();
    }

    let mut hits = Vec::new();

    if query.directories {
        let mut directories = tree.directories();
        directories.sort_by(|a, b| a.path.cmp(&b.path));
        hits.extend(
            directories
                .into_iter()
                .filter(|directory| query.matches_directory(directory))
                .map(Hit::Directory),
        );
    }

    if query.files {
        let mut files: Vec<&ShareFile> = tree.files().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        hits.extend(
            files
                .into_iter()
                .filter(|file| query.matches_file(file))
                .map(Hit::File),
        );
    }

    hits.truncate(limit);
    hits
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::indexer;
    use std::{collections::BTreeMap, fs};

    const TTH: &str = "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY";

    fn share() -> (tempfile::TempDir, ShareTree) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("inner folder")).unwrap();
        fs::write(dir.path().join("inner folder/test file.txt"), [b'A'; 10000]).unwrap();
        fs::write(dir.path().join("other.bin"), b"xyz").unwrap();

        let roots: BTreeMap<_, _> = [("aliasname".to_owned(), dir.path().to_path_buf())].into();
        let (tree, _) = indexer::index(&roots, &ShareTree::default());
        (dir, tree)
    }

    #[track_caller]
    fn paths(hits: &[Hit]) -> Vec<String> {
        hits.iter().map(|hit| hit.path().to_owned()).collect()
    }

    fn nmdc_search(data_type: u8, pattern: nmdc::SearchPattern) -> nmdc::Search {
        nmdc::Search {
            origin: nmdc::SearchOrigin::Passive("bob".to_owned()),
            size_limit: None,
            data_type,
            pattern,
        }
    }

    #[test]
    fn directory_substring() {
        let (_dir, tree) = share();
        let query = LocalQuery::from_nmdc(&nmdc_search(
            nmdc::TYPE_FOLDER,
            nmdc::SearchPattern::Words(vec!["ner".to_owned(), "fo".to_owned()]),
        ))
        .unwrap();

        let hits = search_share(&tree, &query, MAX_ACTIVE_RESULTS);
        assert_eq!(paths(&hits), vec!["/aliasname/inner folder"]);

        let reply = hits[0].to_nmdc("alice", (1, 2), "127.0.0.1:411");
        assert_eq!(reply.path, "aliasname\\inner folder");
        assert_eq!(reply.size, None);
    }

    #[test]
    fn any_matches_all_words_case_insensitively() {
        let (_dir, tree) = share();
        let query = LocalQuery::from_nmdc(&nmdc_search(
            nmdc::TYPE_ANY,
            nmdc::SearchPattern::Words(vec!["TEST".to_owned(), "file".to_owned()]),
        ))
        .unwrap();

        let hits = search_share(&tree, &query, MAX_ACTIVE_RESULTS);
        assert_eq!(paths(&hits), vec!["/aliasname/inner folder/test file.txt"]);

        let query = LocalQuery::from_nmdc(&nmdc_search(
            nmdc::TYPE_ANY,
            nmdc::SearchPattern::Words(vec!["test".to_owned(), "missing".to_owned()]),
        ))
        .unwrap();
        assert!(search_share(&tree, &query, MAX_ACTIVE_RESULTS).is_empty());
    }

    #[test]
    fn short_and_unsupported_nmdc_searches_are_ignored() {
        assert!(LocalQuery::from_nmdc(&nmdc_search(
            nmdc::TYPE_ANY,
            nmdc::SearchPattern::Words(vec!["ab".to_owned()]),
        ))
        .is_none());

        assert!(LocalQuery::from_nmdc(&nmdc_search(
            3,
            nmdc::SearchPattern::Words(vec!["music".to_owned()]),
        ))
        .is_none());

        assert!(!SearchRequest::any("ab").is_valid_for_nmdc());
        assert!(SearchRequest::tth(TTH.parse().unwrap()).is_valid_for_nmdc());
    }

    #[test]
    fn by_tth() {
        let (_dir, tree) = share();
        let query = LocalQuery::from_nmdc(&nmdc_search(
            nmdc::TYPE_TTH,
            nmdc::SearchPattern::Tth(TTH.parse().unwrap()),
        ))
        .unwrap();

        let hits = search_share(&tree, &query, MAX_ACTIVE_RESULTS);
        assert_eq!(paths(&hits), vec!["/aliasname/inner folder/test file.txt"]);

        let packet = hits[0].to_adc(Header::Client, 3, Some("tok"));
        assert_eq!(packet.get("TR"), Some(TTH));
        assert_eq!(packet.get("SI"), Some("10000"));
        assert_eq!(packet.get("TO"), Some("tok"));
    }

    #[test]
    fn adc_extension_and_size_filters() {
        let (_dir, tree) = share();

        let packet = Packet::new(Header::Hub, adc::SCH)
            .field("EX", "bin")
            .field("LE", "100");
        let query = LocalQuery::from_adc(&packet).unwrap();
        assert_eq!(
            paths(&search_share(&tree, &query, MAX_ACTIVE_RESULTS)),
            vec!["/aliasname/other.bin"]
        );

        let packet = Packet::new(Header::Hub, adc::SCH)
            .field("AN", "folder")
            .field("TY", "2");
        let query = LocalQuery::from_adc(&packet).unwrap();
        let hits = search_share(&tree, &query, MAX_ACTIVE_RESULTS);
        assert_eq!(paths(&hits), vec!["/aliasname/inner folder"]);
        assert_eq!(
            hits[0].to_adc(Header::Client, 0, None).get("FN"),
            Some("/aliasname/inner folder/")
        );
    }

    #[test]
    fn outgoing_requests() {
        let search = SearchRequest::directory("ner fo")
            .to_nmdc(nmdc::SearchOrigin::Active("10.0.0.1:412".to_owned()));
        assert_eq!(search.data_type, nmdc::TYPE_FOLDER);
        assert_eq!(
            search.pattern,
            nmdc::SearchPattern::Words(vec!["ner".to_owned(), "fo".to_owned()])
        );

        let packet = SearchRequest::any("a b").max_size(10).to_adc(Header::Hub, "tok");
        assert_eq!(packet.get_all("AN").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(packet.get("LE"), Some("10"));
        assert_eq!(packet.get("TO"), Some("tok"));
    }

    #[test]
    fn results_use_slash_paths() {
        let peer = Peer::new("alice");
        let reply = nmdc::SearchReply {
            nick: "alice".to_owned(),
            path: "aliasname\\inner folder".to_owned(),
            size: None,
            free_slots: 0,
            total_slots: 1,
            tth: None,
            hub: "hub".to_owned(),
            target: None,
        };
        let result = SearchResult::from_nmdc(peer.clone(), &reply, false);
        assert_eq!(result.path, "/aliasname/inner folder");
        assert!(result.is_directory);
        assert!(!result.slot_available);

        let packet = Packet::new(Header::Client, adc::RES)
            .field("FN", "/aliasname/inner folder/test file.txt")
            .field("SI", "10000")
            .field("SL", "2")
            .field("TR", TTH);
        let result = SearchResult::from_adc(peer, &packet, true).unwrap();
        assert_eq!(result.tth, Some(TTH.parse().unwrap()));
        assert_eq!(result.size, Some(10000));
        assert!(result.slot_available && result.is_active && !result.is_directory);
    }
}

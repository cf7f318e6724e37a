//! Tiger Tree Hash (THEX) over 1 KiB leaves.

use crate::tiger::{DecodeError, TigerHash, TIGER_HASH_LEN};
use std::{fs::File, io, io::Read, path::Path};
use tiger::{Digest, Tiger};

/// Size of a leaf block.
pub const LEAF_SIZE: usize = 1024;

const READ_BUFFER_LEN: usize = 64 * LEAF_SIZE;

/// The bottom level of a hash tree. Serialized as the concatenation of the leaf hashes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Leaves(Vec<TigerHash>);

impl Leaves {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() || bytes.len() % TIGER_HASH_LEN != 0 {
            return Err(DecodeError::Length);
        }

        let hashes = bytes
            .chunks_exact(TIGER_HASH_LEN)
            .map(|chunk| TigerHash::try_from(chunk).map_err(|_| DecodeError::Length))
            .collect::<Result<_, _>>()?;

        Ok(Self(hashes))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * TIGER_HASH_LEN);
        for hash in &self.0 {
            out.extend_from_slice(hash.as_bytes());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TigerHash> {
        self.0.iter()
    }

    /// Reduces the leaves pairwise up to the root. An odd hash at the end of a level is
    /// promoted unchanged.
    pub fn root(&self) -> TigerHash {
        let mut level = self.0.clone();

        if level.is_empty() {
            return leaf_hash(&[]);
        }

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    [single] => *single,
                    _ => unreachable!(),
                })
                .collect();
        }

        level[0]
    }
}

/// Incremental tree hasher. Feed it any number of byte slices, then call `finish`.
#[derive(Default)]
pub struct Hasher {
    leaves: Vec<TigerHash>,
    pending: Vec<u8>,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            leaves: Vec::new(),
            pending: Vec::with_capacity(LEAF_SIZE),
        }
    }

    pub fn update(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let take = (LEAF_SIZE - self.pending.len()).min(bytes.len());
            self.pending.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.pending.len() == LEAF_SIZE {
                self.leaves.push(leaf_hash(&self.pending));
                self.pending.clear();
            }
        }
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        (self.leaves.len() * LEAF_SIZE + self.pending.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(mut self) -> Leaves {
        // Empty input still yields one leaf.
        if !self.pending.is_empty() || self.leaves.is_empty() {
            self.leaves.push(leaf_hash(&self.pending));
        }

        Leaves(self.leaves)
    }
}

pub fn leaf_hash(block: &[u8]) -> TigerHash {
    let mut hasher = Tiger::new();
    hasher.update([0u8]);
    hasher.update(block);
    TigerHash::from(<[u8; TIGER_HASH_LEN]>::from(hasher.finalize()))
}

pub fn node_hash(left: &TigerHash, right: &TigerHash) -> TigerHash {
    let mut hasher = Tiger::new();
    hasher.update([1u8]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    TigerHash::from(<[u8; TIGER_HASH_LEN]>::from(hasher.finalize()))
}

pub fn leaves_bytes(bytes: &[u8]) -> Leaves {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finish()
}

pub fn hash_bytes(bytes: &[u8]) -> TigerHash {
    leaves_bytes(bytes).root()
}

pub fn leaves_to_root(leaves: &Leaves) -> TigerHash {
    leaves.root()
}

/// Hashes a file from disk. This blocks; call it from a blocking context.
pub fn leaves_file(path: &Path) -> io::Result<Leaves> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_LEN];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finish())
}

pub fn hash_file(path: &Path) -> io::Result<TigerHash> {
    leaves_file(path).map(|leaves| leaves.root())
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[track_caller]
    fn assert_root(bytes: &[u8], expected: &str) {
        assert_eq!(hash_bytes(bytes).to_string(), expected);
    }

    #[test]
    fn known_roots() {
        assert_root(b"", "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ");
        assert_root(b"\0", "VK54ZIEEVTWNAUI5D5RDFIL37LX2IQNSTAXFKSA");
        assert_root(&[b'A'; 1024], "L66Q4YVNAFWVS23X2HJIRA5ZJ7WXR3F26RSASFA");
        assert_root(&[b'A'; 1025], "PZMRYHGY6LTBEH63ZWAHDORHSYTLO4LEFUIKHWY");
        assert_root(&[b'A'; 10000], "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY");
    }

    #[test]
    fn leaf_counts() {
        assert_eq!(leaves_bytes(b"").len(), 1);
        assert_eq!(leaves_bytes(&[0; 1024]).len(), 1);
        assert_eq!(leaves_bytes(&[0; 1025]).len(), 2);
        assert_eq!(leaves_bytes(&[0; 10000]).len(), 10);
    }

    #[test]
    fn leaf_boundaries() {
        let data = [b'A'; 1025];

        // Up to one full block is a single leaf.
        assert_eq!(hash_bytes(&data[..1023]), leaf_hash(&data[..1023]));
        assert_eq!(hash_bytes(&data[..1024]), leaf_hash(&data[..1024]));
        assert_eq!(leaves_bytes(&data[..1023]).len(), 1);

        // One byte more starts a second leaf.
        assert_eq!(
            hash_bytes(&data),
            node_hash(&leaf_hash(&data[..1024]), &leaf_hash(&data[1024..]))
        );

        let mut hasher = Hasher::new();
        hasher.update(&data[..1023]);
        hasher.update(&data[1023..1024]);
        assert_eq!(hasher.len(), 1024);
        hasher.update(&data[1024..]);
        assert_eq!(
            hasher.finish().root().to_string(),
            "PZMRYHGY6LTBEH63ZWAHDORHSYTLO4LEFUIKHWY"
        );
    }

    #[test]
    fn incremental_updates_match_one_shot() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let mut hasher = Hasher::new();
        for chunk in data.chunks(333) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.len(), 5000);

        assert_eq!(hasher.finish(), leaves_bytes(&data));
    }

    #[test]
    fn leaves_bytes_reduce_to_same_root() {
        let leaves = leaves_bytes(&[b'A'; 10000]);
        let parsed = Leaves::from_bytes(&leaves.to_bytes()).unwrap();

        assert_eq!(parsed.root(), leaves_to_root(&leaves));
        assert!(Leaves::from_bytes(&[0; 25]).is_err());
        assert!(Leaves::from_bytes(&[]).is_err());
    }

    #[test]
    fn file_hash_matches_memory_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'A'; 10000]).unwrap();
        file.flush().unwrap();

        assert_eq!(
            hash_file(file.path()).unwrap().to_string(),
            "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY"
        );
    }
}

use data_encoding::BASE32_NOPAD;
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{
    de::{Deserialize, Deserializer, Error as _},
    ser::{Serialize, Serializer},
};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    str::FromStr,
};
use thiserror::Error;
use tiger::{Digest, Tiger};

/// Length of a Tiger hash.
pub const TIGER_HASH_LEN: usize = 24;

/// Length of a Tiger hash in its unpadded base32 text form.
pub const TIGER_HASH_BASE32_LEN: usize = 39;

/// Tiger hash wrapper type. Used for file TTHs as well as ADC client and private ids.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TigerHash([u8; TIGER_HASH_LEN]);

impl TigerHash {
    /// Create a TigerHash by hashing the given bytes using Tiger.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(Tiger::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; TIGER_HASH_LEN] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    pub fn from_base32(text: &str) -> Result<Self, DecodeError> {
        if text.len() != TIGER_HASH_BASE32_LEN {
            return Err(DecodeError::Length);
        }

        let bytes = decode_base32(text)?;
        Self::try_from(bytes.as_slice()).map_err(|_| DecodeError::Length)
    }
}

impl AsRef<[u8]> for TigerHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<TigerHash> for [u8; TIGER_HASH_LEN] {
    fn from(hash: TigerHash) -> [u8; TIGER_HASH_LEN] {
        hash.0
    }
}

impl From<[u8; TIGER_HASH_LEN]> for TigerHash {
    fn from(hash: [u8; TIGER_HASH_LEN]) -> TigerHash {
        Self(hash)
    }
}

#[derive(Debug, Error)]
#[error("invalid Tiger hash length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for TigerHash {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl Distribution<TigerHash> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> TigerHash {
        TigerHash(rng.gen())
    }
}

impl FromStr for TigerHash {
    type Err = DecodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::from_base32(text)
    }
}

impl fmt::Display for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TigerHash({})", self)
    }
}

impl Serialize for TigerHash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for TigerHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base32 text")]
    Base32,
    #[error("invalid hash length")]
    Length,
}

pub(crate) fn encode_base32(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes)
}

pub(crate) fn decode_base32(text: &str) -> Result<Vec<u8>, DecodeError> {
    BASE32_NOPAD
        .decode(text.as_bytes())
        .map_err(|_| DecodeError::Base32)
}

/// Builds a magnet link for a file: `magnet:?xt=urn:tree:tiger:<tth>&xl=<size>&dn=<name>`.
pub fn magnet_link(tth: &TigerHash, size: u64, name: &str) -> String {
    format!(
        "magnet:?xt=urn:tree:tiger:{}&xl={}&dn={}",
        tth,
        size,
        query_escape(name)
    )
}

fn query_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }

    out
}

// ----------------------------------------------------------------------------//

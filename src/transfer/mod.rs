//! Download and upload drivers, the transfer query format shared by both dialects, and slot
//! accounting.

use crate::{
    error::{Error, Result},
    tiger::TigerHash,
};
use std::fmt;

pub mod download;
pub(crate) mod upload;

/// Name under which peers request our file list.
pub const FILE_LIST_NAME: &str = "files.xml.bz2";

/// Requested ranges shorter than this are not worth compressing.
pub(crate) const COMPRESSION_THRESHOLD: u64 = 10 * 1024;

/// What a transfer fetches.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Query {
    /// The peer's bzip2-compressed XML file list.
    FileList,
    /// A shared file, by its tree hash root.
    File(TigerHash),
    /// The leaf level of a shared file's hash tree.
    Leaves(TigerHash),
}

impl Query {
    pub(crate) fn from_wire(kind: &str, identifier: &str) -> Result<Self> {
        match (kind, identifier) {
            ("file", FILE_LIST_NAME) => Ok(Self::FileList),
            ("file", identifier) => Ok(Self::File(parse_tth_identifier(identifier)?)),
            ("tthl", identifier) => Ok(Self::Leaves(parse_tth_identifier(identifier)?)),
            _ => Err(Error::Protocol(format!(
                "unsupported transfer query: {} {}",
                kind, identifier
            ))),
        }
    }

    pub(crate) fn to_wire(self) -> (&'static str, String) {
        match self {
            Self::FileList => ("file", FILE_LIST_NAME.to_owned()),
            Self::File(tth) => ("file", format!("TTH/{}", tth)),
            Self::Leaves(tth) => ("tthl", format!("TTH/{}", tth)),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (kind, identifier) = self.to_wire();
        write!(f, "{} {}", kind, identifier)
    }
}

fn parse_tth_identifier(identifier: &str) -> Result<TigerHash> {
    identifier
        .strip_prefix("TTH/")
        .and_then(|tth| tth.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid transfer identifier: {}", identifier)))
}

/// A `GET`/`SND` line: the query, the byte range and whether the data is deflated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct TransferRequest {
    pub query: Query,
    pub start: u64,
    /// `None` reads to the end.
    pub length: Option<u64>,
    pub compressed: bool,
}

impl TransferRequest {
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() < 4 {
            return Err(Error::protocol("truncated transfer request"));
        }

        let query = Query::from_wire(args[0].as_ref(), args[1].as_ref())?;
        let start = args[2]
            .as_ref()
            .parse()
            .map_err(|_| Error::protocol("invalid transfer start"))?;
        let length = match args[3].as_ref() {
            "-1" => None,
            length => Some(
                length
                    .parse()
                    .map_err(|_| Error::protocol("invalid transfer length"))?,
            ),
        };
        let compressed = args[4..]
            .iter()
            .any(|flag| matches!(flag.as_ref(), "ZL1" | "ZL"));

        Ok(Self {
            query,
            start,
            length,
            compressed,
        })
    }

    pub fn to_args(&self) -> Vec<String> {
        let (kind, identifier) = self.query.to_wire();
        let mut args = vec![
            kind.to_owned(),
            identifier,
            self.start.to_string(),
            self.length
                .map(|length| length.to_string())
                .unwrap_or_else(|| "-1".to_owned()),
        ];

        if self.compressed {
            args.push("ZL1".to_owned());
        }

        args
    }

    /// Checks a peer's `SND` against what we asked for. An open-ended request accepts any
    /// length.
    pub fn check_reply(&self, reply: &TransferRequest) -> Result<u64> {
        use crate::error::TransferError;

        if reply.query != self.query {
            return Err(TransferError::QueryMismatch.into());
        }

        if reply.start != self.start {
            return Err(TransferError::StartMismatch.into());
        }

        let got = reply
            .length
            .ok_or_else(|| Error::protocol("transfer reply without a length"))?;

        if let Some(wanted) = self.length {
            if wanted != got {
                return Err(TransferError::LengthMismatch { wanted, got }.into());
            }
        }

        if reply.compressed && !self.compressed {
            return Err(TransferError::UnexpectedCompression.into());
        }

        Ok(got)
    }
}

/// Which side of a peer link sends the data.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "Upload",
            Self::Download => "Download",
        }
    }

    pub(crate) fn parse(text: &str) -> Option<Self> {
        match text {
            "Upload" => Some(Self::Upload),
            "Download" => Some(Self::Download),
            _ => None,
        }
    }
}

/// Download and upload slot counters.
#[derive(Debug)]
pub(crate) struct Slots {
    download_max: usize,
    downloads: usize,
    upload_max: usize,
    uploads: usize,
}

impl Slots {
    pub fn new(download_max: usize, upload_max: usize) -> Self {
        Self {
            download_max,
            downloads: 0,
            upload_max,
            uploads: 0,
        }
    }

    pub fn try_acquire_download(&mut self) -> bool {
        if self.downloads < self.download_max {
            self.downloads += 1;
            true
        } else {
            false
        }
    }

    pub fn release_download(&mut self) {
        self.downloads = self.downloads.saturating_sub(1);
    }

    pub fn try_acquire_upload(&mut self) -> bool {
        if self.uploads < self.upload_max {
            self.uploads += 1;
            true
        } else {
            false
        }
    }

    pub fn release_upload(&mut self) {
        self.uploads = self.uploads.saturating_sub(1);
    }

    pub fn free_uploads(&self) -> usize {
        self.upload_max - self.uploads.min(self.upload_max)
    }

    pub fn upload_max(&self) -> usize {
        self.upload_max
    }
}

// ----------------------------------------------------------------------------//

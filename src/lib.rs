//! Client for the Direct Connect peer-to-peer networks, speaking both NMDC and ADC.
//!
//! A client logs into a single hub, shares local directories, searches other users' shares
//! and downloads from them over direct peer links, optionally encrypted.

// NMDC peer links speak `ADCGet` only. The legacy `$Get`/`$Send` pair is not implemented, so
// clients without the `ADCGet` feature cannot download from us.

pub mod tth;

mod adc;
mod builder;
mod client;
mod config;
mod conn;
mod error;
mod hub;
mod link;
mod listener;
mod nmdc;
mod peer;
mod search;
mod share;
mod socket;
mod tiger;
mod tls;
mod transfer;

pub use crate::builder::ClientBuilder;
pub use crate::client::{Client, ClientEvent};
pub use crate::config::{
    Config, HubUrl, LogLevel, PeerEncryptionMode, Protocol, DEFAULT_ADC_PORT, DEFAULT_NMDC_PORT,
};
pub use crate::error::{AuthError, Error, Result, TransferError};
pub use crate::hub::HubPhase;
pub use crate::peer::{AdcIdentity, Peer};
pub use crate::search::{SearchQuery, SearchRequest, SearchResult};
pub use crate::share::{
    FileList, FileListDirectory, FileListFile, IndexStats, ShareDirectory, ShareFile, ShareRoot,
    ShareTree,
};
pub use crate::socket::SocketTrait;
pub use crate::tiger::{
    magnet_link, DecodeError, LengthError, TigerHash, TIGER_HASH_BASE32_LEN, TIGER_HASH_LEN,
};
pub use crate::transfer::{
    download::{Download, DownloadConfig, DownloadState},
    Direction, Query, FILE_LIST_NAME,
};

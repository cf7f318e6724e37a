//! `STA` status codes.

use super::{Header, Packet, STA};
use crate::error::{Error, Result};

pub(crate) const SEVERITY_SUCCESS: u8 = 0;
pub(crate) const SEVERITY_RECOVERABLE: u8 = 1;
pub(crate) const SEVERITY_FATAL: u8 = 2;

pub(crate) const HUB_FULL: u8 = 11;
pub(crate) const NICK_INVALID: u8 = 21;
pub(crate) const NICK_TAKEN: u8 = 22;
pub(crate) const BAD_PASSWORD: u8 = 23;
pub(crate) const PROTOCOL_UNSUPPORTED: u8 = 41;
pub(crate) const FILE_NOT_AVAILABLE: u8 = 51;
pub(crate) const SLOTS_FULL: u8 = 53;

#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct Status {
    pub severity: u8,
    pub code: u8,
    pub description: String,
}

impl Status {
    pub fn new(severity: u8, code: u8, description: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            description: description.into(),
        }
    }

    pub fn parse(packet: &Packet) -> Result<Self> {
        let code = packet.param_at(0)?;
        let invalid = || Error::Protocol(format!("invalid status code: {}", code));

        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let number: u16 = code.parse().map_err(|_| invalid())?;

        Ok(Self {
            severity: (number / 100) as u8,
            code: (number % 100) as u8,
            description: packet.params.get(1).cloned().unwrap_or_default(),
        })
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == SEVERITY_FATAL
    }

    pub fn into_packet(self, header: Header) -> Packet {
        Packet::new(header, STA)
            .param(format!("{}{:02}", self.severity, self.code))
            .param(self.description)
    }
}

//! Users seen on the hub.

use crate::{adc::Sid, tiger::TigerHash};
use std::{collections::HashMap, net::IpAddr};

/// A user on the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub nick: String,
    pub description: String,
    pub email: String,
    pub client: String,
    pub version: String,
    pub share_size: u64,
    pub is_operator: bool,
    pub is_bot: bool,
    pub is_passive: bool,
    pub ip: Option<IpAddr>,
    pub adc: Option<AdcIdentity>,
    /// NMDC status byte. Bit 4 announces TLS support.
    pub nmdc_status: u8,
    /// Whether the peer accepts encrypted peer links.
    pub supports_tls: bool,
}

impl Peer {
    pub(crate) fn new(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            description: String::new(),
            email: String::new(),
            client: String::new(),
            version: String::new(),
            share_size: 0,
            is_operator: false,
            is_bot: false,
            is_passive: true,
            ip: None,
            adc: None,
            nmdc_status: 0,
            supports_tls: false,
        }
    }

    /// ADC peers are active when they advertise `UDP4` together with an address and port.
    pub fn is_udp_active(&self) -> bool {
        match &self.adc {
            Some(identity) => {
                identity.features.iter().any(|f| f == "UDP4")
                    && self.ip.is_some()
                    && identity.udp_port.is_some()
            }
            None => !self.is_passive,
        }
    }
}

/// ADC-specific identity of a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdcIdentity {
    pub sid: String,
    pub cid: TigerHash,
    pub udp_port: Option<u16>,
    /// `SHA256/<base32>` fingerprint of the peer's TLS certificate.
    pub fingerprint: Option<String>,
    pub features: Vec<String>,
}

/// Peers by nick, with secondary indexes by ADC sid and CID.
#[derive(Default, Debug)]
pub(crate) struct Roster {
    by_nick: HashMap<String, Peer>,
    nick_by_sid: HashMap<Sid, String>,
    nick_by_cid: HashMap<TigerHash, String>,
}

impl Roster {
    pub fn get(&self, nick: &str) -> Option<&Peer> {
        self.by_nick.get(nick)
    }

    pub fn get_mut(&mut self, nick: &str) -> Option<&mut Peer> {
        self.by_nick.get_mut(nick)
    }

    pub fn by_sid(&self, sid: &Sid) -> Option<&Peer> {
        self.nick_by_sid
            .get(sid)
            .and_then(|nick| self.by_nick.get(nick))
    }

    pub fn nick_by_sid(&self, sid: &Sid) -> Option<&str> {
        self.nick_by_sid.get(sid).map(String::as_str)
    }

    pub fn by_cid(&self, cid: &TigerHash) -> Option<&Peer> {
        self.nick_by_cid
            .get(cid)
            .and_then(|nick| self.by_nick.get(nick))
    }

    pub fn contains(&self, nick: &str) -> bool {
        self.by_nick.contains_key(nick)
    }

    /// Inserts or replaces a peer, refreshing the secondary indexes. Returns whether it is new.
    pub fn upsert(&mut self, peer: Peer) -> bool {
        if let Some(identity) = &peer.adc {
            if let Ok(sid) = identity.sid.parse() {
                // An ADC peer may change nick within its session.
                if let Some(old_nick) = self.nick_by_sid.insert(sid, peer.nick.clone()) {
                    if old_nick != peer.nick {
                        self.by_nick.remove(&old_nick);
                    }
                }
            }
            self.nick_by_cid.insert(identity.cid, peer.nick.clone());
        }

        self.by_nick.insert(peer.nick.clone(), peer).is_none()
    }

    pub fn remove(&mut self, nick: &str) -> Option<Peer> {
        let peer = self.by_nick.remove(nick)?;

        if let Some(identity) = &peer.adc {
            if let Ok(sid) = identity.sid.parse::<Sid>() {
                self.nick_by_sid.remove(&sid);
            }
            self.nick_by_cid.remove(&identity.cid);
        }

        Some(peer)
    }

    pub fn remove_by_sid(&mut self, sid: &Sid) -> Option<Peer> {
        let nick = self.nick_by_sid.get(sid)?.clone();
        self.remove(&nick)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.by_nick.values()
    }

    pub fn clear(&mut self) -> Vec<Peer> {
        self.nick_by_sid.clear();
        self.nick_by_cid.clear();
        self.by_nick.drain().map(|(_, peer)| peer).collect()
    }

    pub fn len(&self) -> usize {
        self.by_nick.len()
    }
}

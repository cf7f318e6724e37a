//! Client configuration.
//!
//! Option names follow the kebab-case form used in configuration files, e.g. `hub-url` or
//! `download-max-parallel`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::{fmt, net::IpAddr, str::FromStr};

pub const DEFAULT_NMDC_PORT: u16 = 411;
pub const DEFAULT_ADC_PORT: u16 = 5000;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub hub_url: String,
    /// Do not connect to the hub once the share is first indexed; call `Client::hub_connect`.
    pub hub_manual_connect: bool,
    pub hub_conn_tries: u32,
    pub hub_disable_compression: bool,
    pub hub_disable_keepalive: bool,

    pub nick: String,
    pub password: Option<String>,
    pub description: String,
    pub email: String,
    pub connection: String,
    pub client_string: String,
    pub client_version: String,
    pub pk_value: String,
    pub list_generator: String,

    pub is_passive: bool,
    /// Address advertised to peers. Detected from the hub connection when unset.
    pub ip: Option<IpAddr>,
    /// Listening ports. `0` binds an ephemeral port and advertises whatever was bound.
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub tls_port: Option<u16>,

    pub peer_encryption_mode: PeerEncryptionMode,
    pub peer_disable_compression: bool,

    pub download_max_parallel: usize,
    pub upload_max_parallel: usize,

    pub log_level: Option<LogLevel>,

    pub hub_unregistered_count: u32,
    pub hub_registered_count: u32,
    pub hub_operator_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_url: String::new(),
            hub_manual_connect: false,
            hub_conn_tries: 3,
            hub_disable_compression: false,
            hub_disable_keepalive: false,
            nick: String::new(),
            password: None,
            description: String::new(),
            email: String::new(),
            connection: "LAN(T3)".to_owned(),
            client_string: "++".to_owned(),
            client_version: "0.868".to_owned(),
            pk_value: "DCPLUSPLUS0.868".to_owned(),
            list_generator: format!("dckit {}", env!("CARGO_PKG_VERSION")),
            is_passive: false,
            ip: None,
            tcp_port: None,
            udp_port: None,
            tls_port: None,
            peer_encryption_mode: PeerEncryptionMode::Prefer,
            peer_disable_compression: false,
            download_max_parallel: 6,
            upload_max_parallel: 10,
            log_level: None,
            hub_unregistered_count: 1,
            hub_registered_count: 0,
            hub_operator_count: 0,
        }
    }
}

impl Config {
    /// Checks required options and the ports needed by active mode.
    pub fn validate(&self) -> Result<HubUrl> {
        let url: HubUrl = self.hub_url.parse()?;

        if self.nick.is_empty() {
            return Err(Error::InvalidConfig("nick is required".to_owned()));
        }

        if self.nick.contains(|c: char| c.is_whitespace() || c == '$' || c == '|') {
            return Err(Error::InvalidConfig(format!("invalid nick: {}", self.nick)));
        }

        if self.download_max_parallel == 0 {
            return Err(Error::InvalidConfig(
                "download-max-parallel must be at least 1".to_owned(),
            ));
        }

        if self.is_passive {
            return Ok(url);
        }

        if self.tcp_port.is_none() && self.peer_encryption_mode != PeerEncryptionMode::Force {
            return Err(Error::InvalidConfig(
                "tcp-port is required in active mode".to_owned(),
            ));
        }

        if self.udp_port.is_none() {
            return Err(Error::InvalidConfig(
                "udp-port is required in active mode".to_owned(),
            ));
        }

        if self.tls_port.is_none() && self.peer_encryption_mode != PeerEncryptionMode::Disable {
            return Err(Error::InvalidConfig(
                "tls-port is required in active mode unless encryption is disabled".to_owned(),
            ));
        }

        Ok(url)
    }
}

/// Whether peer links are encrypted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerEncryptionMode {
    /// Encrypt when the peer supports it.
    Prefer,
    Disable,
    /// Only talk to peers over TLS.
    Force,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

// ----------------------------------------------------------------------------//

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Nmdc,
    Adc,
}

/// `{nmdc|nmdcs|adc|adcs}://host[:port]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubUrl {
    pub protocol: Protocol,
    pub secure: bool,
    pub host: String,
    pub port: u16,
}

impl FromStr for HubUrl {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = || Error::InvalidUrl(text.to_owned());

        let (scheme, rest) = text.split_once("://").ok_or_else(invalid)?;
        let (protocol, secure) = match scheme {
            "nmdc" => (Protocol::Nmdc, false),
            "nmdcs" => (Protocol::Nmdc, true),
            "adc" => (Protocol::Adc, false),
            "adcs" => (Protocol::Adc, true),
            _ => return Err(invalid()),
        };

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(invalid());
        }

        let (host, port) = match authority.rsplit_once(':') {
            // Bracketed IPv6 without a port.
            Some((_, tail)) if tail.ends_with(']') => (authority, None),
            Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            None => (authority, None),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        let port = port.unwrap_or(match protocol {
            Protocol::Nmdc => DEFAULT_NMDC_PORT,
            Protocol::Adc => DEFAULT_ADC_PORT,
        });

        Ok(Self {
            protocol,
            secure,
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for HubUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = match (self.protocol, self.secure) {
            (Protocol::Nmdc, false) => "nmdc",
            (Protocol::Nmdc, true) => "nmdcs",
            (Protocol::Adc, false) => "adc",
            (Protocol::Adc, true) => "adcs",
        };

        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn assert_url(text: &str, protocol: Protocol, secure: bool, host: &str, port: u16) {
        let url: HubUrl = text.parse().unwrap();
        assert_eq!(url.protocol, protocol);
        assert_eq!(url.secure, secure);
        assert_eq!(url.host, host);
        assert_eq!(url.port, port);
    }

    #[test]
    fn hub_urls() {
        assert_url("nmdc://hub.example", Protocol::Nmdc, false, "hub.example", 411);
        assert_url("nmdcs://hub.example:1411", Protocol::Nmdc, true, "hub.example", 1411);
        assert_url("adc://127.0.0.1", Protocol::Adc, false, "127.0.0.1", 5000);
        assert_url("adcs://[::1]:5001/", Protocol::Adc, true, "::1", 5001);
        assert_url("adc://[::1]", Protocol::Adc, false, "::1", 5000);

        assert_eq!(
            "adcs://[::1]:5001".parse::<HubUrl>().unwrap().to_string(),
            "adcs://[::1]:5001"
        );
    }

    #[test]
    fn bad_hub_urls() {
        for text in ["", "hub:411", "http://hub", "nmdc://", "nmdc://hub:port", "adc://h/x"] {
            assert!(
                matches!(text.parse::<HubUrl>(), Err(Error::InvalidUrl(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn loads_kebab_case_options() {
        let config: Config = toml::from_str(
            r#"
            hub-url = "nmdc://localhost:1411"
            nick = "tester"
            is-passive = true
            peer-encryption-mode = "disable"
            download-max-parallel = 2
            log-level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.nick, "tester");
        assert!(config.is_passive);
        assert_eq!(config.peer_encryption_mode, PeerEncryptionMode::Disable);
        assert_eq!(config.download_max_parallel, 2);
        assert_eq!(config.upload_max_parallel, 10);
        assert_eq!(config.hub_conn_tries, 3);
        assert_eq!(
            config.log_level.map(log::LevelFilter::from),
            Some(log::LevelFilter::Debug)
        );

        assert!(toml::from_str::<Config>("no-such-option = 1").is_err());
    }

    #[test]
    fn active_mode_needs_ports() {
        let mut config = Config {
            hub_url: "nmdc://localhost".to_owned(),
            nick: "tester".to_owned(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.tcp_port = Some(3009);
        config.udp_port = Some(3009);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.peer_encryption_mode = PeerEncryptionMode::Disable;
        assert!(config.validate().is_ok());

        config.tcp_port = None;
        config.is_passive = true;
        assert!(config.validate().is_ok());

        config.nick = "two words".to_owned();
        assert!(config.validate().is_err());
    }
}

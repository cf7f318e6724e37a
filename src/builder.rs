use crate::{
    client::{Client, ClientEvent},
    config::{Config, LogLevel, PeerEncryptionMode},
    error::Result,
};
use std::{collections::BTreeMap, net::IpAddr, path::PathBuf};
use tokio::sync::mpsc;

/// Stores information for starting a client.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    config: Config,
    shares: BTreeMap<String, PathBuf>,
}

impl ClientBuilder {
    pub(crate) fn new(hub_url: impl Into<String>, nick: impl Into<String>) -> Self {
        Self::from_config(Config {
            hub_url: hub_url.into(),
            nick: nick.into(),
            ..Config::default()
        })
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            shares: BTreeMap::new(),
        }
    }

    /// Share a directory from the start, so the first index already includes it.
    pub fn share(mut self, alias: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.shares.insert(alias.into(), path.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = description.into();
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.config.email = email.into();
        self
    }

    /// Only dial out. Passive clients cannot download from other passive clients.
    pub fn passive(mut self, is_passive: bool) -> Self {
        self.config.is_passive = is_passive;
        self
    }

    /// Address advertised to peers. Defaults to the local address of the hub connection.
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.config.ip = Some(ip);
        self
    }

    /// Set the listening ports used in active mode. `0` picks an ephemeral port.
    pub fn ports(mut self, tcp: u16, udp: u16, tls: u16) -> Self {
        self.config.tcp_port = Some(tcp);
        self.config.udp_port = Some(udp);
        self.config.tls_port = Some(tls);
        self
    }

    pub fn peer_encryption_mode(mut self, mode: PeerEncryptionMode) -> Self {
        self.config.peer_encryption_mode = mode;
        self
    }

    pub fn peer_disable_compression(mut self, disable: bool) -> Self {
        self.config.peer_disable_compression = disable;
        self
    }

    pub fn hub_disable_compression(mut self, disable: bool) -> Self {
        self.config.hub_disable_compression = disable;
        self
    }

    /// Do not connect to the hub after the first index; call [`Client::hub_connect`].
    pub fn hub_manual_connect(mut self, manual: bool) -> Self {
        self.config.hub_manual_connect = manual;
        self
    }

    pub fn download_max_parallel(mut self, max: usize) -> Self {
        self.config.download_max_parallel = max;
        self
    }

    pub fn upload_max_parallel(mut self, max: usize) -> Self {
        self.config.upload_max_parallel = max;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = Some(level);
        self
    }

    /// Adjust any other option.
    pub fn configure(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    /// Start the client. Must be called from within a tokio runtime.
    pub async fn start(self) -> Result<(Client, mpsc::UnboundedReceiver<ClientEvent>)> {
        Client::start(self.config, self.shares).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn rejects_incomplete_config() {
        let result = ClientBuilder::new("nmdc://localhost:1", "").start().await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let result = ClientBuilder::new("ftp://localhost", "me").start().await;
        assert!(matches!(result, Err(Error::InvalidUrl(_))));

        // Active mode without ports.
        let result = ClientBuilder::new("nmdc://localhost:1", "me").start().await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn setters_fill_config() {
        let builder = ClientBuilder::new("adc://hub", "me")
            .passive(true)
            .password("secret")
            .share("music", "/srv/music")
            .configure(|config| config.hub_conn_tries = 5);

        assert!(builder.config.is_passive);
        assert_eq!(builder.config.password.as_deref(), Some("secret"));
        assert_eq!(builder.config.hub_conn_tries, 5);
        assert_eq!(builder.shares["music"], PathBuf::from("/srv/music"));
    }
}

#![allow(dead_code)]

pub mod hub;

use dckit::{Client, ClientBuilder, ClientEvent, PeerEncryptionMode};
use std::{path::Path, time::Duration};
use tokio::{sync::mpsc, time};

pub type Events = mpsc::UnboundedReceiver<ClientEvent>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn init_log() {
    let _ = pretty_env_logger::try_init();
}

/// An active client on ephemeral ports.
pub fn active(url: &str, nick: &str, mode: PeerEncryptionMode) -> ClientBuilder {
    Client::builder(url, nick)
        .ports(0, 0, 0)
        .ip("127.0.0.1".parse().unwrap())
        .peer_encryption_mode(mode)
}

pub fn passive(url: &str, nick: &str) -> ClientBuilder {
    Client::builder(url, nick).passive(true)
}

pub fn with_share(builder: ClientBuilder, dir: &Path) -> ClientBuilder {
    builder.share("share", dir)
}

/// Waits for the first event `f` accepts, skipping the others.
pub async fn wait_for<T>(events: &mut Events, mut f: impl FnMut(ClientEvent) -> Option<T>) -> T {
    let result = time::timeout(EVENT_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let Some(value) = f(event) {
                return Some(value);
            }
        }
        None
    })
    .await;

    match result {
        Ok(Some(value)) => value,
        Ok(None) => panic!("event channel closed"),
        Err(_) => panic!("timed out waiting for an event"),
    }
}

pub async fn hub_connected(events: &mut Events) {
    wait_for(events, |event| match event {
        ClientEvent::HubConnected => Some(()),
        ClientEvent::HubError(error) => panic!("hub error: {}", error),
        _ => None,
    })
    .await
}

pub async fn peer_connected(events: &mut Events, nick: &str) {
    wait_for(events, |event| match event {
        ClientEvent::PeerConnected(peer) if peer.nick == nick => Some(()),
        _ => None,
    })
    .await
}

mod common;

use common::{hub::NmdcHub, Events};
use dckit::{
    tth, AuthError, Client, ClientEvent, DownloadConfig, Error, FileList, PeerEncryptionMode,
    SearchRequest, TransferError,
};
use std::{fs, path::Path};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

const FILE_NAME: &str = "report.txt";

fn content() -> Vec<u8> {
    (0..64 * 1024u32).map(|i| (i * 31 % 251) as u8).collect()
}

fn share_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(FILE_NAME), content()).unwrap();
    fs::create_dir(dir.path().join("empty")).unwrap();
    dir
}

async fn start(builder: dckit::ClientBuilder) -> (Client, Events) {
    let (client, mut events) = builder.start().await.unwrap();
    common::hub_connected(&mut events).await;
    (client, events)
}

async fn start_with_share(builder: dckit::ClientBuilder, dir: &Path) -> (Client, Events) {
    start(common::with_share(builder, dir)).await
}

async fn hub_error(builder: dckit::ClientBuilder) -> Error {
    let (_client, mut events) = builder.start().await.unwrap();
    common::wait_for(&mut events, |event| match event {
        ClientEvent::HubError(error) => Some(error),
        ClientEvent::HubConnected => panic!("logged in"),
        _ => None,
    })
    .await
}

async fn downloaded(events: &mut Events) -> dckit::Download {
    common::wait_for(events, |event| match event {
        ClientEvent::DownloadSuccessful(download) => Some(download),
        ClientEvent::DownloadError(download, error) => {
            panic!("{:?} failed: {:?}", download, error)
        }
        _ => None,
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn login_and_chat() {
    common::init_log();
    let hub = NmdcHub::start().await;

    let (alice, mut alice_events) = start(common::passive(&hub.url(), "alice")).await;
    let (bob, mut bob_events) = start(common::passive(&hub.url(), "bob")).await;
    common::peer_connected(&mut alice_events, "bob").await;

    assert_eq!(alice.hub_name(), "Test Hub");
    assert!(bob.peer("alice").is_some());

    alice.message_public("hello | $world").unwrap();
    let (nick, text) = common::wait_for(&mut bob_events, |event| match event {
        ClientEvent::MessagePublic { nick, text } => Some((nick, text)),
        _ => None,
    })
    .await;
    assert_eq!(nick, "alice");
    assert_eq!(text, "hello | $world");

    let alice_peer = bob.peer("alice").unwrap();
    bob.message_private(&alice_peer, "psst").unwrap();
    let (nick, text) = common::wait_for(&mut alice_events, |event| match event {
        ClientEvent::MessagePrivate { nick, text } => Some((nick, text)),
        _ => None,
    })
    .await;
    assert_eq!(nick, "bob");
    assert_eq!(text, "psst");

    bob.close();
    common::wait_for(&mut alice_events, |event| match event {
        ClientEvent::PeerDisconnected(peer) if peer.nick == "bob" => Some(()),
        _ => None,
    })
    .await;
    assert!(alice.peer("bob").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn every_index_is_reported() {
    common::init_log();
    let dir = share_dir();
    let more = share_dir();

    let builder = common::passive("nmdc://127.0.0.1:1", "alice").hub_manual_connect(true);
    let (client, mut events) = common::with_share(builder, dir.path()).start().await.unwrap();

    common::wait_for(&mut events, |event| match event {
        ClientEvent::Initialized => Some(()),
        ClientEvent::ShareIndexed(_) => panic!("indexed before initialized"),
        _ => None,
    })
    .await;
    let stats = common::wait_for(&mut events, |event| match event {
        ClientEvent::ShareIndexed(stats) => Some(stats),
        _ => None,
    })
    .await;
    assert_eq!(stats.hashed, 1);
    assert_eq!(stats.reused, 0);

    client.share_add("more", more.path()).unwrap();
    let stats = common::wait_for(&mut events, |event| match event {
        ClientEvent::ShareIndexed(stats) => Some(stats),
        ClientEvent::Initialized => panic!("initialized twice"),
        _ => None,
    })
    .await;
    assert_eq!(stats.hashed, 1);
    assert_eq!(stats.reused, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn password_login() {
    common::init_log();
    let hub = NmdcHub::with_password(Some("secret")).await;

    let (client, _events) = start(common::passive(&hub.url(), "alice").password("secret")).await;
    assert_eq!(client.hub_phase(), dckit::HubPhase::Initialized);

    let error = hub_error(common::passive(&hub.url(), "bob").password("wrong")).await;
    assert!(matches!(error, Error::Auth(AuthError::BadPassword)));

    let error = hub_error(common::passive(&hub.url(), "carol")).await;
    assert!(matches!(error, Error::Auth(AuthError::PasswordRequired)));
}

#[tokio::test(flavor = "multi_thread")]
async fn nick_taken() {
    common::init_log();
    let hub = NmdcHub::start().await;

    let (_alice, _events) = start(common::passive(&hub.url(), "alice")).await;
    let error = hub_error(common::passive(&hub.url(), "alice")).await;

    assert!(matches!(error, Error::Auth(AuthError::NickRefused)));
}

/// A hub that sends `script` to the first client, then only reads.
async fn scripted_hub(script: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("nmdc://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(script.as_bytes()).await.unwrap();

        let mut buffer = [0; 1024];
        while let Ok(n) = stream.read(&mut buffer).await {
            if n == 0 {
                break;
            }
        }
    });

    url
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_hub_topic_is_fatal() {
    common::init_log();
    let url = scripted_hub(
        "$Lock EXTENDEDPROTOCOL_x Pk=x|$HubTopic one|$HubTopic two|$Hello alice|$OpList $$|",
    )
    .await;

    let error = hub_error(common::passive(&url, "alice")).await;
    assert!(matches!(error, Error::Protocol(_)), "{:?}", error);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_to_me_before_lock_is_fatal() {
    common::init_log();
    let url = scripted_hub("$ConnectToMe alice 127.0.0.1:1|").await;

    let error = hub_error(common::passive(&url, "alice")).await;
    assert!(matches!(error, Error::Protocol(_)), "{:?}", error);
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_link_command_from_hub_is_fatal() {
    common::init_log();
    let url = scripted_hub("$Lock EXTENDEDPROTOCOL_x Pk=x|$MaxedOut|").await;

    let error = hub_error(common::passive(&url, "alice")).await;
    assert!(matches!(error, Error::Protocol(_)), "{:?}", error);
}

async fn search(searcher: dckit::ClientBuilder, expect_active: bool) {
    common::init_log();
    let hub = NmdcHub::start().await;
    let dir = share_dir();

    let (_bob, _bob_events) = start_with_share(
        common::active(&hub.url(), "bob", PeerEncryptionMode::Disable),
        dir.path(),
    )
    .await;
    let (alice, mut alice_events) = start(searcher.configure(|config| {
        config.hub_url = hub.url();
    }))
    .await;

    alice.search(&SearchRequest::any("report")).unwrap();
    let result = common::wait_for(&mut alice_events, |event| match event {
        ClientEvent::SearchResult(result) => Some(result),
        _ => None,
    })
    .await;

    assert_eq!(result.peer.nick, "bob");
    assert!(result.path.ends_with(FILE_NAME));
    assert_eq!(result.size, Some(content().len() as u64));
    assert_eq!(result.tth, Some(tth::hash_bytes(&content())));
    assert_eq!(result.is_active, expect_active);

    // Too short for NMDC hubs.
    assert!(alice.search(&SearchRequest::any("re")).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn active_search() {
    search(
        common::active("", "alice", PeerEncryptionMode::Disable),
        true,
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn passive_search() {
    search(common::passive("", "alice"), false).await;
}

async fn download(downloader: dckit::ClientBuilder, uploader: dckit::ClientBuilder) {
    common::init_log();
    let hub = NmdcHub::start().await;
    let dir = share_dir();
    let target = tempfile::tempdir().unwrap();

    let (_bob, _bob_events) = start_with_share(
        uploader.configure(|config| config.hub_url = hub.url()),
        dir.path(),
    )
    .await;
    let (alice, mut alice_events) =
        start(downloader.configure(|config| config.hub_url = hub.url())).await;

    let bob = match alice.peer("bob") {
        Some(peer) => peer,
        None => {
            common::peer_connected(&mut alice_events, "bob").await;
            alice.peer("bob").unwrap()
        }
    };

    // File list.
    alice.download_file_list(&bob).unwrap();
    let download = downloaded(&mut alice_events).await;
    let xml = download.content().unwrap();
    let list = FileList::parse(std::str::from_utf8(&xml).unwrap()).unwrap();

    let file = list.find_file(&format!("/share/{}", FILE_NAME)).unwrap().clone();
    assert_eq!(file.size, content().len() as u64);
    assert_eq!(file.tth, tth::hash_bytes(&content()));
    assert!(list.find_directory("/share/empty").is_some());

    // Whole file into memory, reusing the link.
    alice.download_file(DownloadConfig::file(&bob, file.tth)).unwrap();
    let download = downloaded(&mut alice_events).await;
    assert_eq!(download.content().unwrap().as_slice(), content().as_slice());

    // A range, to disk at its offset in the file.
    let path = target.path().join("part.bin");
    alice
        .download_file(
            DownloadConfig::file(&bob, file.tth)
                .range(1000, Some(5000))
                .save_to(&path),
        )
        .unwrap();
    downloaded(&mut alice_events).await;
    let saved = fs::read(&path).unwrap();
    assert_eq!(saved.len(), 6000);
    assert_eq!(&saved[1000..], &content()[1000..6000]);

    // Leaves.
    alice.download_file(DownloadConfig::leaves(&bob, file.tth)).unwrap();
    let download = downloaded(&mut alice_events).await;
    let leaves = tth::Leaves::from_bytes(&download.content().unwrap()).unwrap();
    assert_eq!(leaves.root(), file.tth);

    // Something bob does not have.
    alice
        .download_file(DownloadConfig::file(&bob, tth::hash_bytes(b"missing")))
        .unwrap();
    let error = common::wait_for(&mut alice_events, |event| match event {
        ClientEvent::DownloadError(_, error) => Some(error),
        ClientEvent::DownloadSuccessful(_) => panic!("downloaded a missing file"),
        _ => None,
    })
    .await;
    assert!(matches!(
        error,
        Error::Transfer(TransferError::NotAvailable)
    ));

    assert_eq!(alice.download_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn download_between_active_clients() {
    download(
        common::active("", "alice", PeerEncryptionMode::Disable),
        common::active("", "bob", PeerEncryptionMode::Disable),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn download_over_tls() {
    download(
        common::active("", "alice", PeerEncryptionMode::Force),
        common::active("", "bob", PeerEncryptionMode::Force),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn passive_downloads_from_active() {
    download(
        common::passive("", "alice"),
        common::active("", "bob", PeerEncryptionMode::Prefer),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uncompressed_download() {
    download(
        common::active("", "alice", PeerEncryptionMode::Disable).peer_disable_compression(true),
        common::active("", "bob", PeerEncryptionMode::Disable),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn download_from_departed_peer() {
    common::init_log();
    let hub = NmdcHub::start().await;

    let (alice, mut alice_events) = start(common::passive(&hub.url(), "alice")).await;
    let (bob, _bob_events) = start(common::passive(&hub.url(), "bob")).await;
    common::peer_connected(&mut alice_events, "bob").await;

    let peer = alice.peer("bob").unwrap();
    bob.close();
    common::wait_for(&mut alice_events, |event| match event {
        ClientEvent::PeerDisconnected(peer) if peer.nick == "bob" => Some(()),
        _ => None,
    })
    .await;

    let download = alice.download_file_list(&peer).unwrap();
    let error = common::wait_for(&mut alice_events, |event| match event {
        ClientEvent::DownloadError(failed, error) if failed == download => Some(error),
        _ => None,
    })
    .await;

    assert!(matches!(error, Error::Transfer(TransferError::PeerNotFound)));
    assert_eq!(download.state(), dckit::DownloadState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn passive_pair_cannot_connect() {
    common::init_log();
    let hub = NmdcHub::start().await;

    let (alice, mut alice_events) = start(common::passive(&hub.url(), "alice")).await;
    let (_bob, _bob_events) = start(common::passive(&hub.url(), "bob")).await;
    common::peer_connected(&mut alice_events, "bob").await;

    let peer = alice.peer("bob").unwrap();
    alice.download_file_list(&peer).unwrap();
    let error = common::wait_for(&mut alice_events, |event| match event {
        ClientEvent::DownloadError(_, error) => Some(error),
        _ => None,
    })
    .await;

    assert!(matches!(error, Error::Transfer(TransferError::BothPassive)));
}

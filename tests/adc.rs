mod common;

use dckit::{AuthError, ClientEvent, Error, TigerHash};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpListener},
};

const OWN_SID: &str = "AAAB";
const PEER_SID: &str = "BBBC";

/// One scripted ADC hub connection.
struct Script {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Script {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, writer) = stream.into_split();

        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Next non-empty line, which must start with `prefix`.
    async fn expect(&mut self, prefix: &str) -> String {
        loop {
            let line = self.lines.next_line().await.unwrap().unwrap();
            if line.is_empty() {
                continue;
            }
            assert!(line.starts_with(prefix), "expected {}, got {}", prefix, line);
            return line;
        }
    }

    /// Protocol and identify phases, up to the point where the hub would verify the client.
    async fn identify(&mut self) -> String {
        let supports = self.expect("HSUP ").await;
        assert!(supports.contains("ADBASE"));
        assert!(supports.contains("ADTIGR"));

        self.send("ISUP ADBAS0 ADBASE ADTIGR").await;
        self.send(&format!("ISID {}", OWN_SID)).await;
        self.send("IINF CT32 NIScripted\\sHub DEA\\stest\\shub").await;

        self.expect(&format!("BINF {} ", OWN_SID)).await
    }

    /// User list and the echo of the client's own INF.
    async fn finish_login(&mut self, own_info: &str) {
        let peer_cid = TigerHash::digest(b"bob");
        self.send(&format!(
            "BINF {} ID{} NIbob SS1048576 SF3 SL2 I4127.0.0.1 SUTCP4,UDP4 U45000",
            PEER_SID, peer_cid
        ))
        .await;
        self.send(own_info).await;
    }
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.split(' ').find_map(|part| part.strip_prefix(name))
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("adc://{}", listener.local_addr().unwrap());
    (listener, url)
}

#[tokio::test(flavor = "multi_thread")]
async fn login_and_chat() {
    common::init_log();
    let (listener, url) = listen().await;

    let (client, mut events) = common::passive(&url, "alice").start().await.unwrap();

    let mut hub = Script::accept(&listener).await;
    let own_info = hub.identify().await;

    assert_eq!(field(&own_info, "NI"), Some("alice"));
    assert_eq!(field(&own_info, "ID"), Some(client.cid().to_string().as_str()));
    let pid: TigerHash = field(&own_info, "PD").unwrap().parse().unwrap();
    assert_eq!(TigerHash::digest(pid.as_bytes()), client.cid());
    // Passive clients advertise no address.
    assert_eq!(field(&own_info, "I4"), None);

    hub.finish_login(&own_info).await;

    let bob = common::wait_for(&mut events, |event| match event {
        ClientEvent::PeerConnected(peer) => Some(peer),
        _ => None,
    })
    .await;
    assert_eq!(bob.nick, "bob");
    assert_eq!(bob.share_size, 1048576);
    assert!(!bob.is_passive);

    common::hub_connected(&mut events).await;
    assert_eq!(client.hub_name(), "Scripted Hub");

    hub.send(&format!("BMSG {} hello\\sthere", PEER_SID)).await;
    let (nick, text) = common::wait_for(&mut events, |event| match event {
        ClientEvent::MessagePublic { nick, text } => Some((nick, text)),
        _ => None,
    })
    .await;
    assert_eq!(nick, "bob");
    assert_eq!(text, "hello there");

    client.message_public("hi all").unwrap();
    hub.expect(&format!("BMSG {} hi\\sall", OWN_SID)).await;

    client.message_private(&bob, "psst").unwrap();
    let line = hub
        .expect(&format!("EMSG {} {} psst", OWN_SID, PEER_SID))
        .await;
    assert_eq!(field(&line, "PM"), Some(OWN_SID));

    hub.send(&format!("IQUI {}", PEER_SID)).await;
    common::wait_for(&mut events, |event| match event {
        ClientEvent::PeerDisconnected(peer) if peer.nick == "bob" => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn password_login() {
    common::init_log();
    let (listener, url) = listen().await;

    let (_client, mut events) = common::passive(&url, "alice")
        .password("secret")
        .start()
        .await
        .unwrap();

    let mut hub = Script::accept(&listener).await;
    let own_info = hub.identify().await;

    let salt = TigerHash::digest(b"salt");
    hub.send(&format!("IGPA {}", salt)).await;

    let answer = hub.expect("HPAS ").await;
    let mut input = b"secret".to_vec();
    input.extend_from_slice(salt.as_bytes());
    assert_eq!(answer, format!("HPAS {}", TigerHash::digest(&input)));

    hub.finish_login(&own_info).await;
    common::hub_connected(&mut events).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_by_status() {
    common::init_log();
    let (listener, url) = listen().await;

    let (_client, mut events) = common::passive(&url, "alice").start().await.unwrap();

    let mut hub = Script::accept(&listener).await;
    hub.identify().await;
    hub.send("ISTA 222 Nick\\staken").await;

    let error = common::wait_for(&mut events, |event| match event {
        ClientEvent::HubError(error) => Some(error),
        _ => None,
    })
    .await;
    assert!(matches!(error, Error::Auth(AuthError::NickRefused)));
}

#[tokio::test(flavor = "multi_thread")]
async fn redirected() {
    common::init_log();
    let (listener, url) = listen().await;

    let (_client, mut events) = common::passive(&url, "alice").start().await.unwrap();

    let mut hub = Script::accept(&listener).await;
    let own_info = hub.identify().await;
    hub.finish_login(&own_info).await;
    common::hub_connected(&mut events).await;

    hub.send(&format!("IQUI {} RDadc://elsewhere:5000", OWN_SID))
        .await;

    let error = common::wait_for(&mut events, |event| match event {
        ClientEvent::HubError(error) => Some(error),
        _ => None,
    })
    .await;
    match error {
        Error::Auth(AuthError::Redirected(address)) => assert_eq!(address, "adc://elsewhere:5000"),
        other => panic!("unexpected {:?}", other),
    }
}

async fn hub_error(events: &mut common::Events) -> Error {
    common::wait_for(events, |event| match event {
        ClientEvent::HubError(error) => Some(error),
        ClientEvent::HubConnected => panic!("logged in"),
        _ => None,
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn sid_before_supports_is_fatal() {
    common::init_log();
    let (listener, url) = listen().await;

    let (_client, mut events) = common::passive(&url, "alice").start().await.unwrap();

    let mut hub = Script::accept(&listener).await;
    hub.expect("HSUP ").await;
    hub.send(&format!("ISID {}", OWN_SID)).await;

    let error = hub_error(&mut events).await;
    assert!(matches!(error, Error::Protocol(_)), "{:?}", error);
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_message_before_hub_info_is_fatal() {
    common::init_log();
    let (listener, url) = listen().await;

    let (_client, mut events) = common::passive(&url, "alice").start().await.unwrap();

    let mut hub = Script::accept(&listener).await;
    hub.expect("HSUP ").await;
    hub.send("ISUP ADBASE ADTIGR").await;
    hub.send(&format!("ISID {}", OWN_SID)).await;
    // Peer traffic before the hub identified itself.
    hub.send(&format!("BMSG {} early", PEER_SID)).await;

    let error = hub_error(&mut events).await;
    assert!(matches!(error, Error::Protocol(_)), "{:?}", error);
}

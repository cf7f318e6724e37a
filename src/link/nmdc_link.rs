use super::Handshake;
use crate::{
    client::Inner,
    conn::{ConnReader, ConnWriter},
    error::{Error, Result},
    hub,
    nmdc::{lock_to_key, Message, EXTENDED_PROTOCOL},
    transfer::{download::PendingKey, Direction},
};
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;

pub(super) const FILE_NOT_AVAILABLE: &str = "File Not Available";

const COMPRESSION_FEATURE: &str = "ZLIG";
const MAX_BET: u16 = 0x7FFF;

/// Our half of the handshake, fixed before anything is sent.
struct Local {
    lock: Vec<u8>,
    wanted: Direction,
    bet: u16,
}

/// What the peer told us.
#[derive(Default)]
struct Remote {
    nick: String,
    lock: Vec<u8>,
    features: Vec<String>,
    direction: Option<(Direction, u16)>,
    key: Vec<u8>,
}

fn random_lock() -> Vec<u8> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();

    let mut lock = EXTENDED_PROTOCOL.to_vec();
    lock.push(b'_');
    lock.extend_from_slice(suffix.as_bytes());
    lock
}

fn local(inner: &Inner, nick: Option<&str>) -> Local {
    let wanted = match nick {
        Some(nick) if wants_download(inner, nick) => Direction::Download,
        _ => Direction::Upload,
    };

    Local {
        lock: random_lock(),
        wanted,
        bet: rand::thread_rng().gen_range(1..=MAX_BET),
    }
}

fn wants_download(inner: &Inner, nick: &str) -> bool {
    let state = inner.lock();
    state
        .downloads
        .pending
        .contains_key(&PendingKey::Nick(nick.to_owned()))
        && !state.links.contains_key(&(nick.to_owned(), Direction::Download))
}

fn supports(inner: &Inner) -> Message {
    let mut features: Vec<String> = ["MiniSlots", "XmlBZList", "ADCGet", "TTHL", "TTHF"]
        .iter()
        .map(|feature| feature.to_string())
        .collect();

    if !inner.config.peer_disable_compression {
        features.push(COMPRESSION_FEATURE.to_owned());
    }

    Message::Supports(features)
}

async fn next(reader: &mut ConnReader<Message>) -> Result<Message> {
    loop {
        match reader.read().await? {
            Message::KeepAlive => continue,
            message => return Ok(message),
        }
    }
}

async fn read_identity(reader: &mut ConnReader<Message>, remote: &mut Remote) -> Result<()> {
    match next(reader).await? {
        Message::MyNick(nick) => remote.nick = nick,
        other => return Err(Error::Protocol(format!("expected $MyNick, got {:?}", other))),
    }

    match next(reader).await? {
        Message::Lock { lock, .. } => remote.lock = lock,
        other => return Err(Error::Protocol(format!("expected $Lock, got {:?}", other))),
    }

    Ok(())
}

/// Reads `$Supports` and `$Direction` up to `$Key`.
async fn read_negotiation(reader: &mut ConnReader<Message>, remote: &mut Remote) -> Result<()> {
    loop {
        match next(reader).await? {
            Message::Supports(features) => remote.features = features,
            Message::Direction { direction, bet } => remote.direction = Some((direction, bet)),
            Message::Key(key) => {
                remote.key = key;
                return Ok(());
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?} during handshake",
                    other
                )))
            }
        }
    }
}

fn send_negotiation(inner: &Inner, writer: &ConnWriter<Message>, local: &Local, remote: &Remote) {
    writer.send(&supports(inner));
    writer.send(&Message::Direction {
        direction: local.wanted,
        bet: local.bet,
    });
    writer.send(&Message::Key(lock_to_key(&remote.lock)));
}

fn check_peer(inner: &Inner, nick: &str) -> Result<()> {
    if inner.lock().peers.contains(nick) {
        Ok(())
    } else {
        Err(Error::Protocol(format!("{} is not on the hub", nick)))
    }
}

/// Settles the direction from both sides' wishes.
fn resolve(local: &Local, remote: Option<(Direction, u16)>) -> Result<Direction> {
    let (theirs, their_bet) = match remote {
        Some(remote) => remote,
        None => (Direction::Download, 0),
    };

    match (local.wanted, theirs) {
        (Direction::Download, Direction::Upload) => Ok(Direction::Download),
        (Direction::Upload, Direction::Download) => Ok(Direction::Upload),
        (Direction::Download, Direction::Download) if local.bet > their_bet => {
            Ok(Direction::Download)
        }
        (Direction::Download, Direction::Download) if local.bet < their_bet => {
            Ok(Direction::Upload)
        }
        (Direction::Download, Direction::Download) => {
            Err(Error::protocol("both sides bet the same"))
        }
        (Direction::Upload, Direction::Upload) => Err(Error::protocol("nobody wants to download")),
    }
}

fn finish(
    inner: &Inner,
    local: Local,
    remote: Remote,
    reader: ConnReader<Message>,
    writer: ConnWriter<Message>,
) -> Result<Handshake<Message>> {
    if remote.key != lock_to_key(&local.lock) {
        return Err(Error::protocol("peer sent a wrong key"));
    }

    let direction = resolve(&local, remote.direction)?;

    let pending = match direction {
        Direction::Download => Some(PendingKey::Nick(remote.nick.clone())),
        Direction::Upload => {
            if local.wanted == Direction::Download {
                // We lost the bet; our download needs another link.
                let state = inner.lock();
                if let Err(error) = hub::request_connection(inner, &state, &remote.nick) {
                    log::debug!("Failed to request another link to {}: {}", remote.nick, error);
                }
            }
            None
        }
    };

    let compression = !inner.config.peer_disable_compression
        && remote
            .features
            .iter()
            .any(|feature| feature == COMPRESSION_FEATURE);

    Ok(Handshake {
        nick: remote.nick,
        direction,
        pending,
        compression,
        reader,
        writer,
    })
}

/// Handshake as the connecting side.
pub(super) async fn dial(
    inner: &Arc<Inner>,
    mut reader: ConnReader<Message>,
    writer: ConnWriter<Message>,
) -> Result<Handshake<Message>> {
    let lock = random_lock();

    writer.send(&Message::MyNick(inner.config.nick.clone()));
    writer.send(&Message::Lock {
        lock: lock.clone(),
        pk: inner.config.pk_value.clone(),
    });

    let mut remote = Remote::default();
    read_identity(&mut reader, &mut remote).await?;
    check_peer(inner, &remote.nick)?;

    let local = Local {
        lock,
        ..local(inner, Some(&remote.nick))
    };

    read_negotiation(&mut reader, &mut remote).await?;
    send_negotiation(inner, &writer, &local, &remote);

    finish(inner, local, remote, reader, writer)
}

/// Handshake as the listening side.
pub(super) async fn accept(
    inner: &Arc<Inner>,
    mut reader: ConnReader<Message>,
    writer: ConnWriter<Message>,
) -> Result<Handshake<Message>> {
    let mut remote = Remote::default();
    read_identity(&mut reader, &mut remote).await?;
    check_peer(inner, &remote.nick)?;

    let local = local(inner, Some(&remote.nick));

    writer.send(&Message::MyNick(inner.config.nick.clone()));
    writer.send(&Message::Lock {
        lock: local.lock.clone(),
        pk: inner.config.pk_value.clone(),
    });
    send_negotiation(inner, &writer, &local, &remote);

    read_negotiation(&mut reader, &mut remote).await?;

    finish(inner, local, remote, reader, writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wanting(wanted: Direction, bet: u16) -> Local {
        Local {
            lock: random_lock(),
            wanted,
            bet,
        }
    }

    #[test]
    fn higher_bet_downloads() {
        let local = wanting(Direction::Download, 500);

        assert_eq!(
            resolve(&local, Some((Direction::Download, 100))).unwrap(),
            Direction::Download
        );
        assert_eq!(
            resolve(&local, Some((Direction::Download, 900))).unwrap(),
            Direction::Upload
        );
        assert!(resolve(&local, Some((Direction::Download, 500))).is_err());
    }

    #[test]
    fn complementary_wishes() {
        assert_eq!(
            resolve(&wanting(Direction::Upload, 1), Some((Direction::Download, 2))).unwrap(),
            Direction::Upload
        );
        assert_eq!(
            resolve(&wanting(Direction::Download, 1), Some((Direction::Upload, 2))).unwrap(),
            Direction::Download
        );
        assert!(resolve(&wanting(Direction::Upload, 1), Some((Direction::Upload, 2))).is_err());
    }

    #[test]
    fn lock_is_extended() {
        let lock = random_lock();
        assert!(lock.starts_with(EXTENDED_PROTOCOL));
        assert_eq!(lock.len(), EXTENDED_PROTOCOL.len() + 17);
    }
}

use super::Handshake;
use crate::{
    adc::{
        self,
        status::{Status, SEVERITY_RECOVERABLE},
        Command, Header, Message, Packet,
    },
    client::Inner,
    conn::{ConnReader, ConnWriter},
    error::{Error, Result},
    tiger::TigerHash,
    transfer::{download::PendingKey, Direction, TransferRequest},
};
use std::sync::Arc;

const COMPRESSION_FEATURE: &str = "ZLIG";

pub(super) fn transfer_packet(command: Command, request: &TransferRequest) -> Packet {
    let (kind, identifier) = request.query.to_wire();

    let packet = Packet::new(Header::Client, command)
        .param(kind)
        .param(identifier)
        .param(request.start.to_string())
        .param(
            request
                .length
                .map(|length| length.to_string())
                .unwrap_or_else(|| "-1".to_owned()),
        );

    if request.compressed {
        packet.field("ZL", "1")
    } else {
        packet
    }
}

pub(super) fn parse_transfer(packet: &Packet) -> Result<TransferRequest> {
    let mut request = TransferRequest::parse(&packet.params)?;
    request.compressed = packet.get("ZL") == Some("1");
    Ok(request)
}

pub(super) fn status(code: u8, description: &str) -> Packet {
    Status::new(SEVERITY_RECOVERABLE, code, description).into_packet(Header::Client)
}

fn supports(inner: &Inner) -> Packet {
    let mut packet = Packet::new(Header::Client, adc::SUP)
        .field("AD", "BAS0")
        .field("AD", "BASE")
        .field("AD", "TIGR");

    if !inner.config.peer_disable_compression {
        packet = packet.field("AD", COMPRESSION_FEATURE);
    }

    packet
}

async fn expect(reader: &mut ConnReader<Message>, command: Command) -> Result<Packet> {
    loop {
        match reader.read().await? {
            Message::KeepAlive => continue,
            Message::Packet(packet) if packet.command == command => return Ok(packet),
            Message::Packet(packet) => {
                return Err(Error::Protocol(format!(
                    "expected C{}, got {:?}",
                    String::from_utf8_lossy(&command),
                    packet
                )))
            }
        }
    }
}

fn peer_cid(packet: &Packet) -> Result<TigerHash> {
    packet
        .get("ID")
        .and_then(|cid| cid.parse().ok())
        .ok_or_else(|| Error::protocol("CINF without a valid ID"))
}

fn compression(inner: &Inner, peer_supports: &Packet) -> bool {
    !inner.config.peer_disable_compression
        && peer_supports
            .get_all("AD")
            .any(|feature| feature == COMPRESSION_FEATURE)
}

fn direction(inner: &Inner, token: &str) -> (Direction, Option<PendingKey>) {
    let key = PendingKey::Token(token.to_owned());

    if inner.lock().downloads.pending.contains_key(&key) {
        (Direction::Download, Some(key))
    } else {
        (Direction::Upload, None)
    }
}

/// Handshake as the connecting side. The token comes from the `CTM` that made us dial.
pub(super) async fn dial(
    inner: &Arc<Inner>,
    mut reader: ConnReader<Message>,
    writer: ConnWriter<Message>,
    token: String,
    expected_cid: TigerHash,
) -> Result<Handshake<Message>> {
    writer.send(&supports(inner).into());
    let their_supports = expect(&mut reader, adc::SUP).await?;

    let info = expect(&mut reader, adc::INF).await?;
    if peer_cid(&info)? != expected_cid {
        return Err(Error::protocol("peer identified with an unexpected CID"));
    }

    writer.send(
        &Packet::new(Header::Client, adc::INF)
            .field("ID", inner.cid.to_string())
            .field("TO", token.as_str())
            .into(),
    );

    let nick = inner
        .lock()
        .peers
        .by_cid(&expected_cid)
        .map(|peer| peer.nick.clone())
        .ok_or_else(|| Error::protocol("peer left the hub"))?;
    let (direction, pending) = direction(inner, &token);

    Ok(Handshake {
        nick,
        direction,
        pending,
        compression: compression(inner, &their_supports),
        reader,
        writer,
    })
}

/// Handshake as the listening side.
pub(super) async fn accept(
    inner: &Arc<Inner>,
    mut reader: ConnReader<Message>,
    writer: ConnWriter<Message>,
) -> Result<Handshake<Message>> {
    let their_supports = expect(&mut reader, adc::SUP).await?;

    writer.send(&supports(inner).into());
    writer.send(
        &Packet::new(Header::Client, adc::INF)
            .field("ID", inner.cid.to_string())
            .into(),
    );

    let info = expect(&mut reader, adc::INF).await?;
    let cid = peer_cid(&info)?;
    let token = info
        .get("TO")
        .ok_or_else(|| Error::protocol("CINF without a token"))?;

    let nick = inner
        .lock()
        .peers
        .by_cid(&cid)
        .map(|peer| peer.nick.clone())
        .ok_or_else(|| Error::Protocol(format!("unknown peer {}", cid)))?;
    let (direction, pending) = direction(inner, token);

    Ok(Handshake {
        nick,
        direction,
        pending,
        compression: compression(inner, &their_supports),
        reader,
        writer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::Query;

    #[test]
    fn compression_flag_is_a_field() {
        let request = TransferRequest {
            query: Query::FileList,
            start: 0,
            length: None,
            compressed: true,
        };

        let packet = transfer_packet(adc::GET, &request);
        assert_eq!(packet.params.len(), 4);
        assert_eq!(packet.get("ZL"), Some("1"));
        assert_eq!(parse_transfer(&packet).unwrap(), request);

        let plain = transfer_packet(adc::SND, &TransferRequest {
            compressed: false,
            ..request
        });
        assert!(!parse_transfer(&plain).unwrap().compressed);
    }

    #[test]
    fn status_codes() {
        let packet = status(adc::status::SLOTS_FULL, "Slots full");
        assert_eq!(packet.params[0], "153");
    }
}

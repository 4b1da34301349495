use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bendy::decoding::{Decoder, Object};
use percent_encoding::{percent_encode, AsciiSet, CONTROLS};

use crate::error::EngineError;
use crate::tracker::{parse_compact_peers, AnnounceRequest, AnnounceResponse};

const QUERY_SET: &AsciiSet = &CONTROLS
    .add(b' ').add(b'!').add(b'"').add(b'#').add(b'$').add(b'%').add(b'&')
    .add(b'\'').add(b'(').add(b')').add(b'*').add(b'+').add(b',').add(b'/')
    .add(b':').add(b';').add(b'=').add(b'?').add(b'@').add(b'[').add(b']');

/// Build the announce GET URL. The info-hash and peer id are raw bytes
/// and must be percent-encoded by hand.
pub fn build_announce_url(base: &str, req: &AnnounceRequest) -> String {
    let mut url = String::from(base);
    if !url.contains('?') {
        url.push('?');
    } else if !url.ends_with('&') {
        url.push('&');
    }

    url.push_str("info_hash=");
    url.push_str(&percent_encode(&req.info_hash, QUERY_SET).to_string());
    url.push_str("&peer_id=");
    url.push_str(&percent_encode(&req.peer_id, QUERY_SET).to_string());
    url.push_str(&format!(
        "&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        req.port, req.uploaded, req.downloaded, req.left, req.numwant
    ));
    if let Some(event) = req.event {
        url.push_str("&event=");
        url.push_str(event.as_str());
    }
    url
}

/// Perform the HTTP GET announce.
pub async fn announce(url: &str) -> Result<AnnounceResponse, EngineError> {
    let resp = reqwest::Client::new()
        .get(url)
        .send()
        .await?
        .error_for_status()?;
    let bytes = resp.bytes().await?;
    parse_announce_response(&bytes)
}

/// Parse a bencoded tracker response. A `failure reason` key turns into
/// a tracker error; peers may be the compact string or a dict list.
pub fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse, EngineError> {
    let mut decoder = Decoder::new(bytes);
    let obj = decoder
        .next_object()?
        .ok_or_else(|| EngineError::Tracker("empty tracker response".into()))?;
    let mut dict = obj.try_into_dictionary()?;

    let mut interval: Option<u32> = None;
    let mut peers: Vec<SocketAddr> = Vec::new();

    while let Some((key, value)) = dict.next_pair()? {
        match key {
            b"failure reason" => {
                let reason = String::from_utf8_lossy(value.try_into_bytes()?).into_owned();
                return Err(EngineError::Tracker(reason));
            }
            b"interval" => {
                let v = value.try_into_integer()?;
                interval = Some(
                    v.parse::<u32>()
                        .map_err(|e| EngineError::Tracker(e.to_string()))?,
                );
            }
            b"peers" => match value {
                Object::Bytes(blob) => peers = parse_compact_peers(blob),
                other => peers = parse_peer_dicts(other)?,
            },
            _ => {}
        }
    }

    Ok(AnnounceResponse {
        interval: interval.unwrap_or(1800),
        peers,
    })
}

/// Non-compact form: a list of dicts with `ip` and `port`. Anything that
/// is not a plain IPv4 address is skipped.
fn parse_peer_dicts(obj: Object) -> Result<Vec<SocketAddr>, EngineError> {
    let mut list = obj.try_into_list()?;
    let mut out = Vec::new();
    while let Some(entry) = list.next_object()? {
        let mut dict = entry.try_into_dictionary()?;
        let mut ip: Option<String> = None;
        let mut port: Option<u16> = None;
        while let Some((key, value)) = dict.next_pair()? {
            match key {
                b"ip" => {
                    ip = Some(String::from_utf8_lossy(value.try_into_bytes()?).into_owned());
                }
                b"port" => {
                    let v = value.try_into_integer()?;
                    port = Some(
                        v.parse::<u16>()
                            .map_err(|e| EngineError::Tracker(e.to_string()))?,
                    );
                }
                _ => {}
            }
        }
        if let (Some(ip), Some(port)) = (ip, port) {
            if let Ok(v4) = ip.parse::<Ipv4Addr>() {
                out.push(SocketAddr::new(IpAddr::V4(v4), port));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AnnounceEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xAB; 20],
            peer_id: *b"-BC0100-123456789012",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            numwant: 50,
            event: Some(AnnounceEvent::Started),
        }
    }

    #[test]
    fn announce_url_has_all_params() {
        let url = build_announce_url("http://tracker.test/announce", &request());
        assert!(url.starts_with("http://tracker.test/announce?info_hash=%AB%AB"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=0"));
        assert!(url.contains("&downloaded=0"));
        assert!(url.contains("&left=1000"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=50"));
        assert!(url.contains("&event=started"));
    }

    #[test]
    fn announce_url_appends_to_existing_query() {
        let url = build_announce_url("http://tracker.test/announce?key=1", &request());
        assert!(url.contains("announce?key=1&info_hash="));
    }

    #[test]
    fn parse_compact_response() {
        // d8:intervali900e5:peers6:......e with one peer 127.0.0.1:6881
        let mut bytes = b"d8:intervali900e5:peers6:".to_vec();
        bytes.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        bytes.push(b'e');
        let resp = parse_announce_response(&bytes).unwrap();
        assert_eq!(resp.interval, 900);
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parse_dict_peers_response() {
        let bytes =
            b"d8:intervali60e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip3:bad4:porti1eeee";
        let resp = parse_announce_response(bytes).unwrap();
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn failure_reason_is_an_error() {
        let bytes = b"d14:failure reason9:not founde";
        match parse_announce_response(bytes) {
            Err(EngineError::Tracker(reason)) => assert_eq!(reason, "not found"),
            other => panic!("expected tracker error, got {:?}", other),
        }
    }

    #[test]
    fn missing_interval_defaults() {
        let bytes = b"d5:peers0:e";
        let resp = parse_announce_response(bytes).unwrap();
        assert_eq!(resp.interval, 1800);
        assert!(resp.peers.is_empty());
    }
}

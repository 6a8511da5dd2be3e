use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};

/// Magic constant opening every connect request.
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
/// Whole round trips must fail fast rather than hang.
const UDP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct UdpTracker {
    socket: UdpSocket,
    connection_id: Option<u64>,
}

impl UdpTracker {
    /// Resolves a `udp://host:port[/...]` URL and performs the connect
    /// phase.
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let authority = parse_udp_url(url)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(authority).await?;

        let mut tracker = Self {
            socket,
            connection_id: None,
        };
        tracker.do_connect().await?;

        Ok(tracker)
    }

    async fn do_connect(&mut self) -> Result<(), TrackerError> {
        let transaction_id: u32 = rand::rng().random();
        let request = build_connect_request(transaction_id);

        let response = self.round_trip(&request, 16).await?;
        self.connection_id = Some(parse_connect_response(&response, transaction_id)?);

        Ok(())
    }

    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self
            .connection_id
            .ok_or_else(|| TrackerError::InvalidResponse("not connected".into()))?;

        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();
        let packet = build_announce_request(connection_id, transaction_id, key, request);

        let response = self.round_trip(&packet, 20).await?;
        parse_announce_response(&response, transaction_id)
    }

    async fn round_trip(
        &self,
        request: &[u8],
        min_response_size: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; 2048];

        self.socket.send(request).await?;

        match timeout(UDP_TIMEOUT, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= min_response_size => Ok(buf[..n].to_vec()),
            Ok(Ok(_)) => Err(TrackerError::InvalidResponse("response too short".into())),
            Ok(Err(e)) => Err(TrackerError::Io(e)),
            Err(_) => Err(TrackerError::Timeout),
        }
    }
}

pub(super) fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

pub(super) fn parse_connect_response(
    response: &[u8],
    transaction_id: u32,
) -> Result<u64, TrackerError> {
    if response.len() < 16 {
        return Err(TrackerError::InvalidResponse("connect response too short".into()));
    }

    let mut cursor = response;
    let action = cursor.get_u32();
    let tid = cursor.get_u32();

    if action != ACTION_CONNECT || tid != transaction_id {
        return Err(TrackerError::InvalidResponse(
            "connect response mismatch".into(),
        ));
    }

    Ok(cursor.get_u64())
}

pub(super) fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&request.info_hash);
    buf.put_slice(&request.peer_id);
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(request.event.as_udp_id());
    buf.put_u32(0); // IP address, 0 = use the sender's
    buf.put_u32(key);
    buf.put_i32(-1); // num_want, -1 = tracker default
    buf.put_u16(request.port);
    buf.to_vec()
}

pub(super) fn parse_announce_response(
    response: &[u8],
    transaction_id: u32,
) -> Result<AnnounceResponse, TrackerError> {
    if response.len() < 20 {
        return Err(TrackerError::InvalidResponse(
            "announce response too short".into(),
        ));
    }

    let mut cursor = response;
    let action = cursor.get_u32();
    let tid = cursor.get_u32();

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&response[8..]).to_string();
        return Err(TrackerError::Failure(message));
    }

    if action != ACTION_ANNOUNCE || tid != transaction_id {
        return Err(TrackerError::InvalidResponse(
            "announce response mismatch".into(),
        ));
    }

    let interval = cursor.get_u32();
    let leechers = cursor.get_u32();
    let seeders = cursor.get_u32();

    Ok(AnnounceResponse {
        interval,
        complete: Some(seeders),
        incomplete: Some(leechers),
        peers: parse_compact_peers(cursor),
    })
}

fn parse_udp_url(url: &str) -> Result<String, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() || !authority.contains(':') {
        return Err(TrackerError::InvalidUrl(url.to_string()));
    }

    Ok(authority.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_url() {
        assert_eq!(
            parse_udp_url("udp://tracker.example.com:6969/announce").unwrap(),
            "tracker.example.com:6969"
        );
        assert!(parse_udp_url("http://tracker.example.com").is_err());
        assert!(parse_udp_url("udp://nohost").is_err());
    }
}

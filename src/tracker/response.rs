use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::error::TrackerError;
use crate::bencode::{decode, Value};

/// What an announce reports about this session.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until this tracker wants the next announce.
    pub interval: u32,
    /// Seeder count, when reported.
    pub complete: Option<u32>,
    /// Leecher count, when reported.
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Parses the compact peer list: 6 bytes per peer, 4 IPv4 octets then a
/// big-endian port. A trailing partial entry is ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Parses a bencoded HTTP announce response body.
pub fn parse_http_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::InvalidResponse("expected dict".into()))?;

    if let Some(reason) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_integer())
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?
        as u32;

    let complete = dict
        .get(b"complete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    let incomplete = dict
        .get(b"incomplete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    let mut peers = Vec::new();
    match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(compact)) => {
            peers = parse_compact_peers(compact);
        }
        Some(Value::List(list)) => {
            // Non-compact form: a list of {ip, port} dicts.
            for peer in list {
                let ip = peer
                    .get(b"ip")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<IpAddr>().ok());
                let port = peer
                    .get(b"port")
                    .and_then(|v| v.as_integer())
                    .map(|p| p as u16);

                if let (Some(ip), Some(port)) = (ip, port) {
                    peers.push(SocketAddr::new(ip, port));
                }
            }
        }
        _ => {}
    }

    Ok(AnnounceResponse {
        interval,
        complete,
        incomplete,
        peers,
    })
}

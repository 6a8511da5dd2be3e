use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use sha1::Digest;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::session::frame_length;
use super::*;
use crate::bencode::{encode, Value};
use crate::metainfo::Metainfo;
use crate::storage::PieceStore;

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("SW0001"));
}

#[test]
fn test_bitfield_set_clear() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));

    bf.set(0);
    bf.set(99);
    assert!(bf.has(0));
    assert!(bf.has(99));
    assert_eq!(bf.count(), 2);

    bf.clear(0);
    assert!(!bf.has(0));

    // Out-of-range indexes are inert.
    bf.set(100);
    assert_eq!(bf.count(), 1);
    assert!(!bf.has(100));
}

#[test]
fn test_bitfield_wire_order() {
    // Piece 0 is the most significant bit of byte 0.
    let bf = Bitfield::from_bytes(&[0x80, 0x01], 16);
    assert!(bf.has(0));
    assert!(!bf.has(1));
    assert!(bf.has(15));
}

#[test]
fn test_bitfield_roundtrip_non_multiple_of_8() {
    for piece_count in [1usize, 7, 8, 9, 13, 64, 100] {
        let flags: Vec<bool> = (0..piece_count).map(|i| i % 3 == 0).collect();
        let bf = Bitfield::from_flags(&flags);
        let back = Bitfield::from_bytes(bf.as_bytes(), piece_count);
        assert_eq!(back.flags(), flags, "piece_count {piece_count}");
    }
}

#[test]
fn test_bitfield_spare_bits_cleared() {
    let bf = Bitfield::from_bytes(&[0xFF, 0xFF], 9);
    assert_eq!(bf.count(), 9);
    assert_eq!(bf.as_bytes()[1], 0x80);
}

#[test]
fn test_handshake_roundtrip() {
    let handshake = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, [1u8; 20]);
    assert_eq!(decoded.peer_id, [2u8; 20]);
}

#[test]
fn test_handshake_rejects_bad_layout() {
    let good = Handshake::new([1u8; 20], [2u8; 20]).encode();

    let mut short = good.to_vec();
    short.pop();
    assert!(Handshake::decode(&short).is_err());

    let mut bad_tag = good.to_vec();
    bad_tag[0] = 18;
    assert!(Handshake::decode(&bad_tag).is_err());

    let mut bad_name = good.to_vec();
    bad_name[1] = b'X';
    assert!(Handshake::decode(&bad_name).is_err());
}

#[test]
fn test_message_roundtrip() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA5, 0x80])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 0,
            data: Bytes::from_static(b"block bytes"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Port(6881),
    ];

    for message in messages {
        let decoded = Message::decode(message.encode()).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn test_decode_rejects_wrong_declared_length() {
    // A have message claiming length 6.
    let mut buf = BytesMut::new();
    buf.put_u32(6);
    buf.put_u8(MessageId::Have as u8);
    buf.put_u32(7);
    buf.put_u8(0);
    assert!(Message::decode(buf.freeze()).is_err());

    // A choke with a stray payload byte.
    let mut buf = BytesMut::new();
    buf.put_u32(2);
    buf.put_u8(MessageId::Choke as u8);
    buf.put_u8(0);
    assert!(Message::decode(buf.freeze()).is_err());

    // Request must be exactly 13.
    let mut buf = BytesMut::new();
    buf.put_u32(9);
    buf.put_u8(MessageId::Request as u8);
    buf.put_u32(1);
    buf.put_u32(2);
    assert!(Message::decode(buf.freeze()).is_err());
}

#[test]
fn test_decode_rejects_unknown_id() {
    let mut buf = BytesMut::new();
    buf.put_u32(1);
    buf.put_u8(14);
    assert!(matches!(
        Message::decode(buf.freeze()),
        Err(PeerError::InvalidMessageId(14))
    ));
}

#[test]
fn test_frame_length() {
    // Before the handshake everything is a 68-byte frame.
    assert_eq!(frame_length(&[], false), Some(68));
    assert_eq!(frame_length(&[0, 0], false), Some(68));

    // After it the 4-byte prefix governs.
    assert_eq!(frame_length(&[0, 0], true), None);
    assert_eq!(frame_length(&[0, 0, 0, 0], true), Some(4));
    assert_eq!(frame_length(&[0, 0, 0, 13, 6], true), Some(17));
}

// --- session tests over loopback sockets -----------------------------------

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

async fn test_store(dir: &std::path::Path) -> Arc<PieceStore> {
    let content = vec![0x5Au8; 2048];
    let digest: [u8; 20] = sha1::Sha1::digest(&content).into();

    let mut info = BTreeMap::new();
    info.insert(key("name"), Value::string("seed.bin"));
    info.insert(key("length"), Value::Integer(content.len() as i64));
    info.insert(key("piece length"), Value::Integer(2048));
    info.insert(key("pieces"), Value::Bytes(Bytes::copy_from_slice(&digest)));

    let mut root = BTreeMap::new();
    root.insert(key("info"), Value::Dict(info));

    let metainfo = Metainfo::from_bytes(&encode(&Value::Dict(root))).unwrap();
    std::fs::write(dir.join("seed.bin"), &content).unwrap();

    Arc::new(PieceStore::open(&metainfo, dir).await.unwrap())
}

#[tokio::test]
async fn test_handshake_mismatch_disconnects() {
    let dir = tempdir().unwrap();
    let store = test_store(dir.path()).await;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = listener.local_addr().unwrap();

    // Remote side answers the handshake with a different info-hash.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut incoming = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut incoming).await.unwrap();

        let reply = Handshake::new([0xEE; 20], [9u8; 20]).encode();
        stream.write_all(&reply).await.unwrap();
        // Keep the socket open so the close is driven by our side.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    });

    let peer = Peer::connect(remote_addr, store, PeerId::generate(), events_tx);

    loop {
        match events_rx.recv().await.expect("event stream ended") {
            PeerEvent::Disconnected { addr } => {
                assert_eq!(addr, remote_addr);
                break;
            }
            other => panic!("unexpected event before disconnect: {other:?}"),
        }
    }

    assert!(peer.is_disconnected());
    assert!(!peer.handshake_received());
}

#[tokio::test]
async fn test_handshake_match_sends_bitfield() {
    let dir = tempdir().unwrap();
    let store = test_store(dir.path()).await;
    let info_hash = *store.info_hash().as_bytes();
    let (events_tx, _events_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = listener.local_addr().unwrap();

    let remote = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut incoming = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut incoming).await.unwrap();
        let handshake = Handshake::decode(&incoming).unwrap();
        assert_eq!(handshake.info_hash, info_hash);

        let reply = Handshake::new(info_hash, [9u8; 20]).encode();
        stream.write_all(&reply).await.unwrap();

        // The verified bitfield must follow: 1 piece -> 2-byte frame body.
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await.unwrap();
        assert_eq!(u32::from_be_bytes(prefix), 2);

        let mut body = [0u8; 2];
        stream.read_exact(&mut body).await.unwrap();
        assert_eq!(body[0], MessageId::Bitfield as u8);
        assert_eq!(body[1], 0x80);
    });

    let peer = Peer::connect(remote_addr, store, PeerId::generate(), events_tx);

    remote.await.unwrap();
    assert!(peer.is_handshake_complete());
    assert_eq!(peer.peer_id().unwrap().0, [9u8; 20]);
}

#[tokio::test]
async fn test_incoming_messages_update_state_and_emit_events() {
    let dir = tempdir().unwrap();
    let store = test_store(dir.path()).await;
    let info_hash = *store.info_hash().as_bytes();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut incoming = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut incoming).await.unwrap();
        stream
            .write_all(&Handshake::new(info_hash, [7u8; 20]).encode())
            .await
            .unwrap();

        // Several complete frames in one burst: unchoke, have, request.
        let mut burst = BytesMut::new();
        burst.extend_from_slice(&Message::Unchoke.encode());
        burst.extend_from_slice(&Message::Have { piece: 0 }.encode());
        burst.extend_from_slice(
            &Message::Request {
                index: 0,
                begin: 0,
                length: 1024,
            }
            .encode(),
        );
        stream.write_all(&burst).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    });

    let peer = Peer::connect(remote_addr, store, PeerId::generate(), events_tx);

    let mut saw_state_change = false;
    loop {
        match events_rx.recv().await.expect("event stream ended") {
            PeerEvent::StateChanged { .. } => saw_state_change = true,
            PeerEvent::BlockRequested(request) => {
                assert_eq!(request.piece, 0);
                assert_eq!(request.begin, 0);
                assert_eq!(request.length, 1024);
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert!(saw_state_change);
    assert!(!peer.is_peer_choking());
    assert!(peer.has_piece(0));
}

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;

use super::queues::OutgoingQueue;
use super::scheduler::{plan_requests, rank_pieces};
use super::*;
use crate::bencode::{encode, Value};
use crate::constants::BLOCK_SIZE;
use crate::metainfo::Metainfo;
use crate::peer::{BlockRequest, PeerSnapshot};
use crate::storage::{PieceStore, StoreSnapshot};
use crate::throttle::Throttle;

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// A descriptor for 3 pieces of 2 blocks each; no data exists on disk.
fn torrent_bytes() -> Vec<u8> {
    let piece_length = 2 * BLOCK_SIZE as i64;

    let mut info = BTreeMap::new();
    info.insert(key("name"), Value::string("large.bin"));
    info.insert(key("length"), Value::Integer(3 * piece_length));
    info.insert(key("piece length"), Value::Integer(piece_length));
    info.insert(key("pieces"), Value::Bytes(Bytes::from(vec![0x11; 3 * 20])));

    let mut root = BTreeMap::new();
    root.insert(key("announce"), Value::string("http://tracker.test/announce"));
    root.insert(key("info"), Value::Dict(info));

    encode(&Value::Dict(root))
}

async fn empty_store(dir: &Path) -> Arc<PieceStore> {
    let metainfo = Metainfo::from_bytes(&torrent_bytes()).unwrap();
    Arc::new(PieceStore::open(&metainfo, dir).await.unwrap())
}

fn addr(host: u8, port: u16) -> SocketAddr {
    format!("10.0.0.{host}:{port}").parse().unwrap()
}

fn view(addr: SocketAddr, has: &[bool]) -> PeerSnapshot {
    PeerSnapshot {
        addr,
        has: has.to_vec(),
        requested: vec![vec![false; 2]; 3],
    }
}

fn wide_throttle() -> Throttle {
    Throttle::new(u64::MAX, Duration::from_secs(1))
}

#[test]
fn test_rank_pieces_prefers_rare() {
    // Piece 1 is held by one peer out of four, the others by all.
    let peers: Vec<PeerSnapshot> = (0..4)
        .map(|i| view(addr(i, 6881), &[true, i == 0, true]))
        .collect();
    let snapshot = StoreSnapshot {
        verified: vec![false; 3],
        acquired: vec![vec![false; 2]; 3],
    };

    let mut rng = StdRng::seed_from_u64(7);
    let ranked = rank_pieces(&snapshot, &peers, &mut rng);
    assert_eq!(ranked[0], 1);
}

#[test]
fn test_rank_pieces_penalizes_partial_progress() {
    // Equal rarity, but piece 0 already has half its blocks.
    let peers = vec![view(addr(1, 6881), &[true, true, true])];
    let snapshot = StoreSnapshot {
        verified: vec![false; 3],
        acquired: vec![vec![true, false], vec![false, false], vec![false, false]],
    };

    let mut rng = StdRng::seed_from_u64(7);
    let ranked = rank_pieces(&snapshot, &peers, &mut rng);
    assert_eq!(*ranked.last().unwrap(), 0);
}

#[tokio::test]
async fn test_plan_respects_outstanding_limit_per_peer() {
    let dir = tempdir().unwrap();
    let store = empty_store(dir.path()).await;
    let snapshot = store.snapshot();

    let mut views = vec![view(addr(1, 6881), &[true, true, true])];
    let throttle = wide_throttle();
    let mut rng = StdRng::seed_from_u64(1);

    let plan = plan_requests(&snapshot, &mut views, &store, &throttle, &mut rng);

    // A peer takes new requests only while it has at most one outstanding.
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|r| r.addr == views[0].addr));
}

#[tokio::test]
async fn test_plan_respects_per_block_limit() {
    let dir = tempdir().unwrap();
    let store = empty_store(dir.path()).await;
    let snapshot = store.snapshot();

    // Three peers already asked for piece 0 block 0; a fourth must not.
    let mut views: Vec<PeerSnapshot> = (0..4)
        .map(|i| view(addr(i, 6881), &[true, false, false]))
        .collect();
    for peer in views.iter_mut().take(3) {
        peer.requested[0][0] = true;
    }

    let throttle = wide_throttle();
    let mut rng = StdRng::seed_from_u64(1);
    let plan = plan_requests(&snapshot, &mut views, &store, &throttle, &mut rng);

    assert!(plan
        .iter()
        .all(|r| !(r.piece == 0 && r.begin == 0 && r.addr == addr(3, 6881))));
}

#[tokio::test]
async fn test_plan_skips_acquired_and_verified() {
    let dir = tempdir().unwrap();
    let store = empty_store(dir.path()).await;

    let mut snapshot = store.snapshot();
    snapshot.verified[0] = true;
    snapshot.acquired[1][0] = true;

    let mut views = vec![view(addr(1, 6881), &[true, true, true])];
    let throttle = wide_throttle();
    let mut rng = StdRng::seed_from_u64(1);
    let plan = plan_requests(&snapshot, &mut views, &store, &throttle, &mut rng);

    assert!(plan.iter().all(|r| r.piece != 0));
    assert!(plan.iter().all(|r| !(r.piece == 1 && r.begin == 0)));
}

#[tokio::test]
async fn test_plan_stops_when_throttled() {
    let dir = tempdir().unwrap();
    let store = empty_store(dir.path()).await;
    let snapshot = store.snapshot();

    let mut views = vec![view(addr(1, 6881), &[true, true, true])];
    let throttle = Throttle::new(10, Duration::from_secs(1));
    throttle.add(10, None);

    let mut rng = StdRng::seed_from_u64(1);
    let plan = plan_requests(&snapshot, &mut views, &store, &throttle, &mut rng);
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_rerequest_from_surviving_peer() {
    // Peer A had piece 2 on request; A is gone before delivery. The next
    // pass must pick the surviving peer B for piece 2.
    let dir = tempdir().unwrap();
    let store = empty_store(dir.path()).await;
    let snapshot = store.snapshot();

    let b = addr(2, 6881);
    // A's requested flags died with its session; only B remains.
    let mut views = vec![view(b, &[false, false, true])];

    let throttle = wide_throttle();
    let mut rng = StdRng::seed_from_u64(99);
    let plan = plan_requests(&snapshot, &mut views, &store, &throttle, &mut rng);

    assert!(!plan.is_empty());
    assert!(plan.iter().all(|r| r.addr == b && r.piece == 2));
}

#[test]
fn test_outgoing_queue_cancellation() {
    let queue = OutgoingQueue::default();
    let request = BlockRequest {
        addr: addr(1, 6881),
        piece: 0,
        begin: 0,
        length: BLOCK_SIZE,
    };
    let other = BlockRequest {
        addr: addr(1, 6881),
        piece: 1,
        begin: 0,
        length: BLOCK_SIZE,
    };

    queue.push(request.clone());
    queue.push(other.clone());
    queue.cancel(&request);

    let first = queue.pop().unwrap();
    assert!(first.cancelled);
    assert_eq!(first.request, request);

    let second = queue.pop().unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.request, other);
}

#[test]
fn test_resume_record_roundtrip() {
    let dir = tempdir().unwrap();
    let torrent_path = dir.path().join("large.torrent");
    std::fs::write(&torrent_path, torrent_bytes()).unwrap();

    let record_path = write_record(&torrent_path, Path::new("/downloads/large")).unwrap();
    let record = read_record(&record_path).unwrap();

    assert_eq!(record.torrent_path, torrent_path);
    assert_eq!(record.download_dir, Path::new("/downloads/large"));
}

#[tokio::test]
async fn test_merge_endpoints_skips_own_address_and_duplicates() {
    let dir = tempdir().unwrap();
    let downloads = tempdir().unwrap();
    let torrent_path = dir.path().join("large.torrent");
    std::fs::write(&torrent_path, torrent_bytes()).unwrap();

    let client = Client::new(6881, &torrent_path, downloads.path())
        .await
        .unwrap();

    // A compact response worth of two peers plus our own listen address.
    let own: SocketAddr = "127.0.0.1:6881".parse().unwrap();
    let peers = vec![own, addr(1, 7000), addr(2, 7001)];

    client.merge_endpoints(peers.clone());
    assert_eq!(client.peer_count(), 2);

    // Merging the same list again creates no extra sessions.
    client.merge_endpoints(peers);
    assert_eq!(client.peer_count(), 2);
}

#[tokio::test]
async fn test_client_counters_start_empty() {
    let dir = tempdir().unwrap();
    let downloads = tempdir().unwrap();
    let torrent_path = dir.path().join("large.torrent");
    std::fs::write(&torrent_path, torrent_bytes()).unwrap();

    let client = Client::new(6881, &torrent_path, downloads.path())
        .await
        .unwrap();

    assert_eq!(client.progress(), 0.0);
    assert!(!client.is_complete());
    assert_eq!(client.download_rate(), 0);
    assert_eq!(client.upload_rate(), 0);
    assert!(client.peer_stats().is_empty());
    assert!(!client.is_running());

    // Runtime limit setters take effect immediately.
    client.set_max_download_rate(1);
    client.set_max_upload_rate(1);
    client.set_max_seeders(5);
    client.set_max_leechers(5);
}

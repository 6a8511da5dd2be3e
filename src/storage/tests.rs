use std::collections::BTreeMap;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tempfile::tempdir;

use super::*;
use crate::bencode::{encode, Value};
use crate::constants::BLOCK_SIZE;
use crate::metainfo::Metainfo;

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn piece_hashes(content: &[u8], piece_length: usize) -> Bytes {
    let mut hashes = Vec::new();
    for chunk in content.chunks(piece_length) {
        let digest: [u8; 20] = Sha1::digest(chunk).into();
        hashes.extend_from_slice(&digest);
    }
    Bytes::from(hashes)
}

fn single_file_metainfo(name: &str, content: &[u8], piece_length: usize) -> Metainfo {
    let mut info = BTreeMap::new();
    info.insert(key("name"), Value::string(name));
    info.insert(key("length"), Value::Integer(content.len() as i64));
    info.insert(key("piece length"), Value::Integer(piece_length as i64));
    info.insert(key("pieces"), Value::Bytes(piece_hashes(content, piece_length)));

    let mut root = BTreeMap::new();
    root.insert(key("info"), Value::Dict(info));

    Metainfo::from_bytes(&encode(&Value::Dict(root))).unwrap()
}

fn multi_file_metainfo(name: &str, files: &[(&str, &[u8])], piece_length: usize) -> Metainfo {
    let mut all = Vec::new();
    let mut entries = Vec::new();
    for (file_name, content) in files {
        all.extend_from_slice(content);
        let mut dict = BTreeMap::new();
        dict.insert(key("path"), Value::List(vec![Value::string(file_name)]));
        dict.insert(key("length"), Value::Integer(content.len() as i64));
        entries.push(Value::Dict(dict));
    }

    let mut info = BTreeMap::new();
    info.insert(key("name"), Value::string(name));
    info.insert(key("files"), Value::List(entries));
    info.insert(key("piece length"), Value::Integer(piece_length as i64));
    info.insert(key("pieces"), Value::Bytes(piece_hashes(&all, piece_length)));

    let mut root = BTreeMap::new();
    root.insert(key("info"), Value::Dict(info));

    Metainfo::from_bytes(&encode(&Value::Dict(root))).unwrap()
}

fn deterministic_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_out_of_order_blocks_verify_and_match_disk() {
    // One piece of 16 KiB blocks, delivered out of order from one peer.
    let piece_length = 4 * BLOCK_SIZE as usize;
    let content = deterministic_bytes(piece_length);
    let metainfo = single_file_metainfo("data.bin", &content, piece_length);
    let dir = tempdir().unwrap();

    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();
    assert!(!store.is_verified(0));

    for block in [2u32, 0, 3] {
        let start = block as usize * BLOCK_SIZE as usize;
        let outcome = store
            .write_block(0, block, &content[start..start + BLOCK_SIZE as usize])
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Incomplete);
    }

    let start = BLOCK_SIZE as usize;
    let outcome = store
        .write_block(0, 1, &content[start..start + BLOCK_SIZE as usize])
        .await
        .unwrap();
    assert_eq!(
        outcome,
        VerifyOutcome::Verified {
            newly_verified: true,
            all_complete: true
        }
    );

    assert!(store.is_verified(0));
    assert!(store.is_complete());
    assert_eq!(store.progress(), 1.0);

    let on_disk = std::fs::read(dir.path().join("data.bin")).unwrap();
    assert_eq!(on_disk, content);
}

#[tokio::test]
async fn test_corrupt_piece_resets_blocks() {
    let piece_length = 2 * BLOCK_SIZE as usize;
    let content = deterministic_bytes(piece_length);
    let metainfo = single_file_metainfo("data.bin", &content, piece_length);
    let dir = tempdir().unwrap();

    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();

    let garbage = vec![0x55u8; BLOCK_SIZE as usize];
    store.write_block(0, 0, &garbage).await.unwrap();
    let outcome = store
        .write_block(0, 1, &content[BLOCK_SIZE as usize..])
        .await
        .unwrap();

    // All blocks acquired but the hash failed: bitmap resets for re-download.
    assert_eq!(outcome, VerifyOutcome::Rejected);
    assert!(!store.is_verified(0));
    let snapshot = store.snapshot();
    assert!(snapshot.acquired[0].iter().all(|&b| !b));
}

#[tokio::test]
async fn test_verify_is_idempotent() {
    let content = deterministic_bytes(1024);
    let metainfo = single_file_metainfo("small.bin", &content, 1024);
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("small.bin"), &content).unwrap();

    // Opening re-hashes the existing file.
    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();
    assert!(store.is_verified(0));

    let outcome = store.verify(0).await.unwrap();
    assert_eq!(
        outcome,
        VerifyOutcome::Verified {
            newly_verified: false,
            all_complete: true
        }
    );
    assert!(store.is_verified(0));
}

#[tokio::test]
async fn test_verified_implies_all_blocks_acquired() {
    let piece_length = 2 * BLOCK_SIZE as usize;
    let content = deterministic_bytes(3 * BLOCK_SIZE as usize);
    let metainfo = single_file_metainfo("data.bin", &content, piece_length);
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("data.bin"), &content).unwrap();

    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();

    let snapshot = store.snapshot();
    for (piece, verified) in snapshot.verified.iter().enumerate() {
        assert!(verified);
        assert!(snapshot.acquired[piece].iter().all(|&b| b));
    }
}

#[tokio::test]
async fn test_read_missing_file_is_not_an_error() {
    let content = deterministic_bytes(4096);
    let metainfo = single_file_metainfo("missing.bin", &content, 4096);
    let dir = tempdir().unwrap();

    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();
    assert_eq!(store.read_piece(0).await.unwrap(), None);
    assert_eq!(store.read_block(0, 0, 1024).await.unwrap(), None);
    assert!(!store.is_verified(0));
}

#[tokio::test]
async fn test_blocks_spanning_multiple_files() {
    // 3000 + 5000 + 2000 bytes, pieces of 4096: piece 0 crosses into the
    // second file, piece 1 crosses into the third.
    let a = deterministic_bytes(3000);
    let b = vec![0xbbu8; 5000];
    let c = vec![0xccu8; 2000];
    let metainfo = multi_file_metainfo(
        "set",
        &[("a.bin", &a), ("b.bin", &b), ("c.bin", &c)],
        4096,
    );
    let dir = tempdir().unwrap();

    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();
    assert_eq!(store.piece_count(), 3);

    let mut all = Vec::new();
    all.extend_from_slice(&a);
    all.extend_from_slice(&b);
    all.extend_from_slice(&c);

    for piece in 0..3u32 {
        let start = piece as usize * 4096;
        let end = (start + 4096).min(all.len());
        let outcome = store.write_block(piece, 0, &all[start..end]).await.unwrap();
        assert!(matches!(outcome, VerifyOutcome::Verified { .. }));
    }

    assert!(store.is_complete());
    assert_eq!(
        std::fs::read(dir.path().join("set/a.bin")).unwrap(),
        a
    );
    assert_eq!(std::fs::read(dir.path().join("set/b.bin")).unwrap(), b);
    assert_eq!(std::fs::read(dir.path().join("set/c.bin")).unwrap(), c);
}

#[tokio::test]
async fn test_short_final_piece_and_block_sizes() {
    let piece_length = 2 * BLOCK_SIZE as usize;
    // 2.5 pieces, final piece is one block and a half.
    let content = deterministic_bytes(piece_length * 2 + BLOCK_SIZE as usize + 100);
    let metainfo = single_file_metainfo("data.bin", &content, piece_length);
    let dir = tempdir().unwrap();

    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();
    assert_eq!(store.piece_count(), 3);

    assert_eq!(store.piece_size(0), piece_length as u64);
    assert_eq!(store.piece_size(2), BLOCK_SIZE as u64 + 100);
    assert_eq!(store.block_count(2), 2);
    assert_eq!(store.block_size(2, 0), BLOCK_SIZE);
    assert_eq!(store.block_size(2, 1), 100);
    // Exact multiples fall back to the full unit.
    assert_eq!(store.block_size(0, 1), BLOCK_SIZE);
}

#[tokio::test]
async fn test_progress_is_mean_of_block_means() {
    let piece_length = 2 * BLOCK_SIZE as usize;
    let content = deterministic_bytes(2 * piece_length);
    let metainfo = single_file_metainfo("data.bin", &content, piece_length);
    let dir = tempdir().unwrap();

    let store = PieceStore::open(&metainfo, dir.path()).await.unwrap();
    assert_eq!(store.progress(), 0.0);

    store
        .write_block(0, 0, &content[..BLOCK_SIZE as usize])
        .await
        .unwrap();

    // One of two blocks in one of two pieces.
    assert_eq!(store.progress(), 0.25);
}

#[tokio::test]
async fn test_path_traversal_rejected() {
    let content = deterministic_bytes(256);
    let metainfo = multi_file_metainfo("set", &[("..", &content)], 256);
    let dir = tempdir().unwrap();

    assert!(matches!(
        PieceStore::open(&metainfo, dir.path()).await,
        Err(StorageError::PathTraversal(_))
    ));
}

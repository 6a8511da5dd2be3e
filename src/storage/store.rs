use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as FileMutex;

use super::error::StorageError;
use super::layout::spans_for;
use crate::constants::BLOCK_SIZE;
use crate::metainfo::{FileEntry, InfoHash, Metainfo};

/// Result of hashing a piece against its expected SHA-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Hash does not match and blocks are still missing; nothing to do yet.
    Incomplete,
    /// Hash matched; the piece is verified and all its blocks forced acquired.
    Verified {
        /// False when the piece was already verified before this call.
        newly_verified: bool,
        /// True when this was the last unverified piece.
        all_complete: bool,
    },
    /// Hash mismatched with every block acquired: the piece is corrupt and
    /// its block bitmap was reset for a full re-download.
    Rejected,
}

/// Point-in-time copy of the piece/block bitmaps for scheduling.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub verified: Vec<bool>,
    pub acquired: Vec<Vec<bool>>,
}

struct Bitmaps {
    verified: Vec<bool>,
    acquired: Vec<Vec<bool>>,
}

/// Owns file layout, piece/block bitmaps, hash verification and disk I/O for
/// one torrent.
///
/// Constructed once per download and never destroyed mid-run; stopping a
/// session merely stops calling into it.
pub struct PieceStore {
    name: String,
    info_hash: InfoHash,
    download_dir: PathBuf,
    files: Vec<FileEntry>,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
    state: Mutex<Bitmaps>,
    /// One lock per file: writes to the same file are serialized, different
    /// files may proceed concurrently.
    file_locks: Vec<FileMutex<()>>,
    uploaded: AtomicU64,
}

impl PieceStore {
    /// Builds a store and re-hashes every piece against the files on disk,
    /// recovering the bitmaps of a previous run.
    pub async fn open(
        metainfo: &Metainfo,
        download_dir: impl Into<PathBuf>,
    ) -> Result<Self, StorageError> {
        let store = Self::new(metainfo, download_dir)?;

        for piece in 0..store.piece_count() as u32 {
            store.verify(piece).await?;
        }

        tracing::info!(
            name = %store.name,
            verified = store.verified_count(),
            pieces = store.piece_count(),
            "opened piece store"
        );

        Ok(store)
    }

    fn new(metainfo: &Metainfo, download_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        for file in &metainfo.files {
            validate_file_path(&file.path)?;
        }

        let piece_count = metainfo.piece_count();
        let store = Self {
            name: metainfo.name.clone(),
            info_hash: metainfo.info_hash,
            download_dir: download_dir.into(),
            files: metainfo.files.clone(),
            piece_hashes: metainfo.pieces.clone(),
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length,
            state: Mutex::new(Bitmaps {
                verified: vec![false; piece_count],
                acquired: Vec::new(),
            }),
            file_locks: metainfo.files.iter().map(|_| FileMutex::new(())).collect(),
            uploaded: AtomicU64::new(0),
        };

        let acquired = (0..piece_count as u32)
            .map(|p| vec![false; store.block_count(p) as usize])
            .collect();
        store.state.lock().acquired = acquired;

        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of a piece; the final piece carries the remainder when the total
    /// is not an exact multiple.
    pub fn piece_size(&self, piece: u32) -> u64 {
        if piece as usize == self.piece_count() - 1 {
            let remainder = self.total_length % self.piece_length;
            if remainder != 0 {
                return remainder;
            }
        }
        self.piece_length
    }

    pub fn block_count(&self, piece: u32) -> u32 {
        self.piece_size(piece).div_ceil(BLOCK_SIZE as u64) as u32
    }

    /// Size of a block; the final block of a piece carries the remainder when
    /// the piece size is not an exact multiple.
    pub fn block_size(&self, piece: u32, block: u32) -> u32 {
        if block == self.block_count(piece) - 1 {
            let remainder = (self.piece_size(piece) % BLOCK_SIZE as u64) as u32;
            if remainder != 0 {
                return remainder;
            }
        }
        BLOCK_SIZE
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.state
            .lock()
            .verified
            .get(piece as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn verified_count(&self) -> usize {
        self.state.lock().verified.iter().filter(|&&v| v).count()
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.piece_count()
    }

    /// Whether at least one piece has been verified.
    pub fn is_started(&self) -> bool {
        self.state.lock().verified.iter().any(|&v| v)
    }

    pub fn verified_flags(&self) -> Vec<bool> {
        self.state.lock().verified.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            verified: state.verified.clone(),
            acquired: state.acquired.clone(),
        }
    }

    /// Fraction of blocks acquired, averaged per piece then over pieces.
    ///
    /// A completion estimate, not a byte-accurate counter: short final
    /// pieces weigh as much as full ones.
    pub fn progress(&self) -> f64 {
        let state = self.state.lock();
        if state.acquired.is_empty() {
            return 1.0;
        }

        let per_piece: f64 = state
            .acquired
            .iter()
            .map(|blocks| {
                let have = blocks.iter().filter(|&&b| b).count() as f64;
                have / blocks.len() as f64
            })
            .sum();

        per_piece / state.acquired.len() as f64
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Bytes accounted as downloaded for tracker announces: whole verified
    /// pieces only.
    pub fn downloaded(&self) -> u64 {
        self.piece_length * self.verified_count() as u64
    }

    pub fn left(&self) -> u64 {
        self.total_length.saturating_sub(self.downloaded())
    }

    /// Reads a whole piece. `Ok(None)` means some covered file is missing or
    /// short on disk: the data is not locally available, which is not an
    /// error.
    pub async fn read_piece(&self, piece: u32) -> Result<Option<Bytes>, StorageError> {
        self.check_piece(piece)?;
        self.read_range(piece as u64 * self.piece_length, self.piece_size(piece))
            .await
    }

    /// Reads part of a piece, `offset`/`length` in bytes within the piece.
    pub async fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Option<Bytes>, StorageError> {
        self.check_piece(piece)?;
        if offset as u64 + length as u64 > self.piece_size(piece) {
            return Err(StorageError::InvalidBlock {
                piece,
                block: offset / BLOCK_SIZE,
            });
        }
        self.read_range(piece as u64 * self.piece_length + offset as u64, length as u64)
            .await
    }

    async fn read_range(&self, start: u64, length: u64) -> Result<Option<Bytes>, StorageError> {
        let spans = spans_for(&self.files, start, length);
        let mut data = Vec::with_capacity(length as usize);

        for span in spans {
            let path = self.file_path(span.file_index);
            if !path.exists() {
                return Ok(None);
            }

            let _guard = self.file_locks[span.file_index].lock().await;
            let mut file = File::open(&path).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let mut buf = vec![0u8; span.length as usize];
            match file.read_exact(&mut buf).await {
                Ok(_) => data.extend_from_slice(&buf),
                // A short file holds no data for this range yet.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(Bytes::from(data)))
    }

    /// Writes one block, marks it acquired and verifies the piece.
    ///
    /// Containing directories are created as needed. Writes to one file are
    /// serialized by that file's lock.
    pub async fn write_block(
        &self,
        piece: u32,
        block: u32,
        data: &[u8],
    ) -> Result<VerifyOutcome, StorageError> {
        self.check_piece(piece)?;
        if block >= self.block_count(piece)
            || block as u64 * BLOCK_SIZE as u64 + data.len() as u64 > self.piece_size(piece)
        {
            return Err(StorageError::InvalidBlock { piece, block });
        }

        let start = piece as u64 * self.piece_length + block as u64 * BLOCK_SIZE as u64;
        let spans = spans_for(&self.files, start, data.len() as u64);
        let mut data_offset = 0usize;

        for span in spans {
            let path = self.file_path(span.file_index);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let _guard = self.file_locks[span.file_index].lock().await;
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;

            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&data[data_offset..data_offset + span.length as usize])
                .await?;

            data_offset += span.length as usize;
        }

        self.state.lock().acquired[piece as usize][block as usize] = true;

        self.verify(piece).await
    }

    /// Re-hashes a piece and reconciles the bitmaps with the result.
    ///
    /// Safe to invoke redundantly: a verified piece that still hashes clean
    /// stays verified.
    pub async fn verify(&self, piece: u32) -> Result<VerifyOutcome, StorageError> {
        self.check_piece(piece)?;

        let hash = match self.read_piece(piece).await? {
            Some(data) => {
                let digest: [u8; 20] = tokio::task::spawn_blocking(move || Sha1::digest(&data).into())
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
                Some(digest)
            }
            None => None,
        };

        let matches = hash.is_some_and(|h| h == self.piece_hashes[piece as usize]);

        let mut state = self.state.lock();
        let index = piece as usize;

        if matches {
            let newly_verified = !state.verified[index];
            state.verified[index] = true;
            for flag in state.acquired[index].iter_mut() {
                *flag = true;
            }
            let all_complete = state.verified.iter().all(|&v| v);

            if newly_verified {
                tracing::debug!(piece, "piece verified");
            }
            if all_complete && newly_verified {
                tracing::info!(name = %self.name, "download complete");
            }

            return Ok(VerifyOutcome::Verified {
                newly_verified,
                all_complete,
            });
        }

        state.verified[index] = false;

        // Every block present but the hash is wrong: the piece is corrupt
        // and must be fetched again from scratch.
        if state.acquired[index].iter().all(|&b| b) {
            tracing::warn!(piece, "piece hash mismatch, resetting blocks");
            for flag in state.acquired[index].iter_mut() {
                *flag = false;
            }
            return Ok(VerifyOutcome::Rejected);
        }

        Ok(VerifyOutcome::Incomplete)
    }

    fn file_path(&self, file_index: usize) -> PathBuf {
        self.download_dir.join(&self.files[file_index].path)
    }

    fn check_piece(&self, piece: u32) -> Result<(), StorageError> {
        if (piece as usize) < self.piece_count() {
            Ok(())
        } else {
            Err(StorageError::InvalidPiece(piece))
        }
    }
}

fn validate_file_path(path: &Path) -> Result<(), StorageError> {
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

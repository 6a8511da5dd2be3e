//! Resume sidecar records.
//!
//! One small bencoded file per active torrent maps the descriptor to its
//! download directory, so a restart can reconstruct its sessions. Bitmaps
//! are deliberately not persisted; the store re-hashes on-disk data at
//! startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::error::ClientError;
use crate::bencode::{decode, encode, Value};

/// The sidecar lives next to the descriptor as `<name>.torrent.session`.
pub const RECORD_EXTENSION: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub torrent_path: PathBuf,
    pub download_dir: PathBuf,
}

pub fn record_path(torrent_path: &Path) -> PathBuf {
    let mut path = torrent_path.as_os_str().to_owned();
    path.push(".");
    path.push(RECORD_EXTENSION);
    PathBuf::from(path)
}

/// Writes the sidecar for a torrent, returning its path.
pub fn write_record(torrent_path: &Path, download_dir: &Path) -> Result<PathBuf, ClientError> {
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"directory"),
        Value::string(&download_dir.to_string_lossy()),
    );
    dict.insert(
        Bytes::from_static(b"torrent"),
        Value::string(&torrent_path.to_string_lossy()),
    );

    let path = record_path(torrent_path);
    std::fs::write(&path, encode(&Value::Dict(dict)))?;
    Ok(path)
}

/// Reads a sidecar written by [`write_record`].
pub fn read_record(path: &Path) -> Result<ResumeRecord, ClientError> {
    let data = std::fs::read(path)?;
    let value = decode(&data).map_err(|_| ClientError::InvalidRecord("not bencode"))?;

    let directory = value
        .get(b"directory")
        .and_then(|v| v.as_str())
        .ok_or(ClientError::InvalidRecord("missing directory"))?;
    let torrent = value
        .get(b"torrent")
        .and_then(|v| v.as_str())
        .ok_or(ClientError::InvalidRecord("missing torrent"))?;

    Ok(ResumeRecord {
        torrent_path: PathBuf::from(torrent),
        download_dir: PathBuf::from(directory),
    })
}

use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// A parsed torrent descriptor.
///
/// # Examples
///
/// ```no_run
/// use swarmbit::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let metainfo = Metainfo::from_file("example.torrent")?;
/// println!("{}: {} bytes", metainfo.name, metainfo.total_length);
/// println!("info hash: {}", metainfo.info_hash);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Suggested name for the file or root directory.
    pub name: String,
    /// Bytes per piece (the final piece may be shorter).
    pub piece_length: u64,
    /// SHA-1 hash per piece.
    pub pieces: Vec<[u8; 20]>,
    /// Files in on-disk order, offsets a running sum over the list.
    pub files: Vec<FileEntry>,
    /// Total size of all files combined.
    pub total_length: u64,
    /// Tracker URLs, deduplicated case-insensitively in first-seen order.
    pub trackers: Vec<String>,
    /// SHA-1 of the canonical bencoded `info` dictionary.
    pub info_hash: InfoHash,
    /// If set, clients should only use trackers from the metainfo.
    pub private: Option<bool>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    /// Unix timestamp when the torrent was created.
    pub creation_date: Option<i64>,
    pub encoding: Option<String>,
    raw_info: Bytes,
}

/// A file within a torrent, placed at `offset` in the concatenated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the download directory.
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl Metainfo {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parses a torrent descriptor from raw bytes.
    ///
    /// # Errors
    ///
    /// Fails if the data is not valid bencode, required fields are missing
    /// (`info`, `name`, `piece length`, `pieces`, `length`/`files`), or the
    /// `pieces` string is not a whole number of 20-byte hashes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let info = info_value
            .as_dict()
            .ok_or(MetainfoError::InvalidField("info"))?;

        // The info-hash is computed over the canonical re-encoding, so the
        // same dictionary always hashes to the same 20 bytes.
        let raw_info = Bytes::from(encode(info_value));
        let info_hash = InfoHash::from_info_bytes(&raw_info);

        let name = info
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = info
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::MissingField("piece length"))? as u64;

        let pieces_bytes = info
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;

        if pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPiecesLength);
        }

        let pieces: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) = parse_files(info, &name)?;

        let trackers = collect_trackers(&value);

        let private = info
            .get(b"private".as_slice())
            .and_then(|v| v.as_integer())
            .map(|v| v == 1);

        let comment = dict
            .get(b"comment".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let created_by = dict
            .get(b"created by".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let creation_date = dict
            .get(b"creation date".as_slice())
            .and_then(|v| v.as_integer());

        let encoding = dict
            .get(b"encoding".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            name,
            piece_length,
            pieces,
            files,
            total_length,
            trackers,
            info_hash,
            private,
            comment,
            created_by,
            creation_date,
            encoding,
            raw_info,
        })
    }

    /// The raw bencoded `info` dictionary the info-hash was computed over.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

fn parse_files(
    info: &std::collections::BTreeMap<Bytes, Value>,
    name: &str,
) -> Result<(Vec<FileEntry>, u64), MetainfoError> {
    if let Some(length) = info.get(b"length".as_slice()).and_then(|v| v.as_integer()) {
        let length = length as u64;
        let file = FileEntry {
            path: PathBuf::from(name),
            length,
            offset: 0,
        };
        return Ok((vec![file], length));
    }

    let files_list = info
        .get(b"files".as_slice())
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length or files"))?;

    let mut files = Vec::with_capacity(files_list.len());
    let mut offset = 0u64;

    for file_value in files_list {
        let file_dict = file_value
            .as_dict()
            .ok_or(MetainfoError::InvalidField("files"))?;

        let length = file_dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("file length"))? as u64;

        let segments = file_dict
            .get(b"path".as_slice())
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("file path"))?;

        // Multi-file layouts live under a directory named after the torrent.
        let path: PathBuf = std::iter::once(name.to_string())
            .chain(
                segments
                    .iter()
                    .filter_map(|seg| seg.as_str().map(String::from)),
            )
            .collect();

        files.push(FileEntry {
            path,
            length,
            offset,
        });

        offset += length;
    }

    if files.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    Ok((files, offset))
}

fn collect_trackers(root: &Value) -> Vec<String> {
    let mut trackers: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    let mut push = |url: &str| {
        let folded = url.to_lowercase();
        if !seen.contains(&folded) {
            seen.push(folded);
            trackers.push(url.to_string());
        }
    };

    if let Some(announce) = root.get(b"announce").and_then(|v| v.as_str()) {
        push(announce);
    }

    if let Some(tiers) = root.get(b"announce-list").and_then(|v| v.as_list()) {
        for tier in tiers {
            let Some(urls) = tier.as_list() else { continue };
            for url in urls {
                if let Some(url) = url.as_str() {
                    push(url);
                }
            }
        }
    }

    trackers
}

//! swarmbit - a BitTorrent peer-to-peer file transfer engine
//!
//! This library implements the BitTorrent wire and tracker protocols: it
//! parses torrent descriptors, verifies and stores file pieces on disk,
//! discovers peers via HTTP/UDP trackers, negotiates the peer wire protocol,
//! and schedules block requests and uploads under bandwidth limits.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - Torrent descriptor parsing and the info-hash
//! - [`storage`] - Disk I/O, piece/block bitmaps and hash verification
//! - [`peer`] - Peer wire protocol codec and per-connection sessions
//! - [`tracker`] - BEP-3/15 HTTP and UDP tracker protocols
//! - [`throttle`] - Sliding-window rate limiting
//! - [`client`] - The session controller tying everything together
//!
//! # Example
//!
//! ```no_run
//! use swarmbit::Client;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(6881, "example.torrent", "downloads").await?;
//! client.start().await?;
//!
//! println!("{:.1}% done", client.progress() * 100.0);
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bencode;
pub mod client;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod storage;
pub mod throttle;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use client::{Client, ClientError, PeerStats};
pub use metainfo::{FileEntry, InfoHash, Metainfo, MetainfoError};
pub use peer::{
    Bitfield, BlockData, BlockRequest, Handshake, Message, Peer, PeerError, PeerEvent, PeerId,
};
pub use storage::{PieceStore, StorageError, VerifyOutcome};
pub use throttle::Throttle;
pub use tracker::{AnnounceRequest, AnnounceResponse, Tracker, TrackerError, TrackerEvent};

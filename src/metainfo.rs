//! Torrent metainfo parsing ([BEP-3]).
//!
//! Turns a bencoded `.torrent` descriptor into a [`Metainfo`] domain object:
//! file layout with running byte offsets, piece hashes, tracker URLs, and
//! the info-hash that identifies the torrent on the wire.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod error;
mod info_hash;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use torrent::{FileEntry, Metainfo};

//! Disk storage and piece verification.
//!
//! The [`PieceStore`] owns the torrent's on-disk layout: it maps piece/block
//! byte ranges onto the file list, tracks which blocks have been acquired and
//! which pieces have passed their hash check, and serializes writes per file
//! so concurrent block arrivals cannot race on one file.
//!
//! Bitmaps are never persisted; a store re-hashes every piece against the
//! files on disk when it is opened.

mod error;
mod layout;
mod store;

pub use error::StorageError;
pub use layout::{spans_for, FileSpan};
pub use store::{PieceStore, StoreSnapshot, VerifyOutcome};

#[cfg(test)]
mod tests;

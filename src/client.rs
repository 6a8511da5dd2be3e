//! Session controller.
//!
//! A [`Client`] orchestrates one torrent: it owns the peer table, the
//! seeder/leecher subsets, the block queues and the throttles, runs the
//! listener plus four periodic scheduling loops, and exposes the small
//! control surface an embedding program needs (start/stop, counters,
//! runtime limits).

mod controller;
mod error;
mod queues;
mod resume;
mod scheduler;

pub use controller::{Client, PeerStats};
pub use error::ClientError;
pub use resume::{read_record, write_record, ResumeRecord};

#[cfg(test)]
mod tests;

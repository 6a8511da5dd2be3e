//! Tracker protocols ([BEP-3] HTTP, [BEP-15] UDP).
//!
//! A [`Tracker`] keeps one announce endpoint's cadence state and dispatches
//! to the HTTP or UDP protocol by URL scheme. Every announce reports the
//! session's counters and gets back an interval plus candidate peer
//! endpoints.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-15]: http://bittorrent.org/beps/bep_0015.html

mod error;
mod http;
mod record;
mod response;
mod udp;

pub use error::TrackerError;
pub use http::HttpTracker;
pub use record::Tracker;
pub use response::{parse_compact_peers, AnnounceRequest, AnnounceResponse, TrackerEvent};
pub use udp::UdpTracker;

//! Peer wire protocol ([BEP-3]).
//!
//! [`message`] is the binary codec: handshake framing plus the tagged,
//! length-prefixed protocol messages. [`session`] builds the per-connection
//! state machine on top of it: one [`Peer`] per remote endpoint, owning the
//! socket and reporting everything of interest to the session controller as
//! [`PeerEvent`]s over a single channel.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod bitfield;
mod error;
mod message;
mod peer_id;
mod session;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::PeerId;
pub use session::{BlockData, BlockRequest, EventSender, Peer, PeerEvent, PeerSnapshot};

#[cfg(test)]
mod tests;

//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format used throughout BitTorrent, both for
//! `.torrent` descriptor files and for HTTP tracker responses.
//!
//! Four data types exist:
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! Dictionaries are encoded with their keys in ascending byte order. This is
//! not cosmetic: the info-hash that identifies a torrent is the SHA-1 of the
//! encoded `info` dictionary, so the encoding must be canonical and
//! reproducible. Duplicate keys in the input overwrite earlier ones.
//!
//! ```
//! use swarmbit::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d3:fooi7e4:spam4:eggse").unwrap();
//! assert_eq!(value.get(b"foo").and_then(|v| v.as_integer()), Some(7));
//! assert_eq!(encode(&value), b"d3:fooi7e4:spam4:eggse");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;

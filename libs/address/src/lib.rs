//! # mqplane-address
//!
//! Address model and compact JSON codec for the mqplane platform.
//!
//! ## Design Principles
//!
//! - Addresses are immutable values compared by name plus attributes
//! - One JSON entry describes one address and names the group it belongs to
//! - Decoding is per-entry: one malformed entry never poisons its neighbors
//!
//! ## Entry Format
//!
//! ```json
//! { "store_and_forward": true, "multicast": false, "group_id": "broker-1", "flavor": "vanilla" }
//! ```
//!
//! The entry key (config map key or file name) is the address name; the
//! value carries the routing attributes and the grouping key.

mod codec;
mod error;
mod types;

pub use codec::{decode_entry, encode_entry, AddressEntry};
pub use error::DecodeError;
pub use types::Address;

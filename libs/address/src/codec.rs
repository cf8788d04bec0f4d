//! Compact JSON codec for address entries.
//!
//! An entry is a `(name, value)` pair: the name comes from the config map
//! key (or file name), the value is a small JSON object carrying the
//! routing attributes and the grouping key.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::types::Address;

/// Wire form of one address entry value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntryValue {
    store_and_forward: bool,
    multicast: bool,
    group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flavor: Option<String>,
}

/// A decoded address entry: the address plus the group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub address: Address,
    pub group_id: String,
}

/// Decode one entry from its name and raw JSON value.
///
/// Fails on this entry only; callers drop it and continue with the rest.
pub fn decode_entry(name: &str, value: &serde_json::Value) -> Result<AddressEntry, DecodeError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(DecodeError::InvalidName(name.to_string()));
    }

    let value: EntryValue =
        serde_json::from_value(value.clone()).map_err(|e| DecodeError::Malformed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    if value.group_id.is_empty() {
        return Err(DecodeError::EmptyGroup(name.to_string()));
    }

    Ok(AddressEntry {
        address: Address {
            name: name.to_string(),
            store_and_forward: value.store_and_forward,
            multicast: value.multicast,
            flavor: value.flavor,
        },
        group_id: value.group_id,
    })
}

/// Encode an address back to its compact entry value.
pub fn encode_entry(address: &Address, group_id: &str) -> serde_json::Value {
    let mut value = serde_json::json!({
        "store_and_forward": address.store_and_forward,
        "multicast": address.multicast,
        "group_id": group_id,
    });
    if let Some(flavor) = &address.flavor {
        value["flavor"] = serde_json::Value::String(flavor.clone());
    }
    value
}

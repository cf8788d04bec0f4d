//! Address value type.

use serde::{Deserialize, Serialize};

/// One address of a group.
///
/// Compared by name plus attributes so that sets of addresses diff cleanly:
/// an attribute change on an existing name reads as a changed desired set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Address name, unique within its group.
    pub name: String,

    /// Whether messages are stored on a broker before forwarding.
    pub store_and_forward: bool,

    /// Whether the address fans out to all consumers.
    pub multicast: bool,

    /// Optional flavor tag selecting a plan/template for the address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
}

impl Address {
    /// Create a store-and-forward queue address with no flavor.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store_and_forward: true,
            multicast: false,
            flavor: None,
        }
    }

    /// Create a store-and-forward topic address with no flavor.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store_and_forward: true,
            multicast: true,
            flavor: None,
        }
    }
}

//! Management frame types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Close condition sent when a second broker claims an already-live group.
pub const CONDITION_RESOURCE_LOCKED: &str = "amqp:resource-locked";

/// Close condition sent when the first frame is not a well-formed Open.
pub const CONDITION_NOT_ALLOWED: &str = "amqp:not-allowed";

/// Close condition sent on a protocol version mismatch.
pub const CONDITION_DECODE_ERROR: &str = "amqp:decode-error";

/// Numeric status codes carried in management replies.
pub mod status {
    pub const OK: u32 = 200;
    pub const CREATED: u32 = 201;
    pub const BAD_REQUEST: u32 = 400;
    pub const NOT_FOUND: u32 = 404;
    pub const ALREADY_EXISTS: u32 = 409;
    pub const INTERNAL_ERROR: u32 = 500;
    pub const NOT_IMPLEMENTED: u32 = 501;

    /// Returns true for any 2xx status.
    pub fn is_success(status: u32) -> bool {
        (200..300).contains(&status)
    }
}

/// Management verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Create,
    Delete,
    List,
    Count,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Method::Create => "CREATE",
            Method::Delete => "DELETE",
            Method::List => "LIST",
            Method::Count => "COUNT",
        };
        write!(f, "{}", s)
    }
}

/// Application properties of a management request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationProperties {
    pub method: Method,

    /// Target queue name; absent for LIST and COUNT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Optional body of a management reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// Queue-name list, replied to LIST.
    Queues(Vec<String>),

    /// Queue count, replied to COUNT.
    Count(i64),
}

/// A management reply, stripped of its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct MgmtResponse {
    pub status: u32,
    pub body: Option<ResponseBody>,
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Session open; the container id is the group the broker claims.
    Open {
        container_id: String,
        protocol: u32,
    },

    /// Session accepted.
    OpenOk,

    /// Session rejected or torn down.
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },

    /// Management request to the broker's management node.
    Request {
        correlation_id: Uuid,
        application_properties: ApplicationProperties,
    },

    /// Management reply, correlated to its request.
    Response {
        correlation_id: Uuid,
        status: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<ResponseBody>,
    },
}

impl Frame {
    /// Build a request frame for the given verb and optional target.
    pub fn request(correlation_id: Uuid, method: Method, address: Option<String>) -> Self {
        Frame::Request {
            correlation_id,
            application_properties: ApplicationProperties { method, address },
        }
    }

    /// Build a reply frame.
    pub fn response(correlation_id: Uuid, status: u32, body: Option<ResponseBody>) -> Self {
        Frame::Response {
            correlation_id,
            status,
            body,
        }
    }
}

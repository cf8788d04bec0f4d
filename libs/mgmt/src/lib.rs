//! # mqplane-mgmt
//!
//! The AMQP management protocol spoken between the queue scheduler and
//! broker processes.
//!
//! ## Protocol flow
//!
//! 1. Broker connects and sends `Open` with its container id (= group id)
//! 2. Scheduler replies `OpenOk` (or `Close` when the group is taken)
//! 3. Scheduler issues `Request` frames addressed to the broker's
//!    management node; application properties carry the verb and target
//!    queue name
//! 4. Broker replies `Response` frames correlated by correlation id with a
//!    numeric status and an optional body (queue-name list or count)
//!
//! Frames are length-prefixed JSON over any async byte stream. Request
//! correlation is a pending-request table keyed by correlation id with a
//! timeout sweep, so a reply arriving after its caller gave up is dropped
//! on the floor instead of waking the wrong call.

mod codec;
mod error;
mod frame;
mod pending;

pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use error::{FrameError, ManagementError};
pub use frame::{
    status, ApplicationProperties, Frame, Method, MgmtResponse, ResponseBody,
    CONDITION_DECODE_ERROR, CONDITION_NOT_ALLOWED, CONDITION_RESOURCE_LOCKED, PROTOCOL_VERSION,
};
pub use pending::PendingRequests;

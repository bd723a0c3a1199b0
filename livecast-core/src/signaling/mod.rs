//! Signaling channel to the media-routing server
//!
//! Named events with JSON payloads, plus request/acknowledgment round trips
//! correlated through a pending-request table.

mod channel;
mod message;
mod pending;
mod websocket;

pub use channel::{ChannelLink, ChannelState, SignalingChannel, DEFAULT_REQUEST_TIMEOUT};
pub use message::{events, is_empty_reply, reply_error, Envelope, RequestId};
pub use pending::{PendingGuard, PendingRequests};

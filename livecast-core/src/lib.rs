//! Client-side negotiation core for publishing a live media track through a
//! media-routing server.

pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod negotiation;
pub mod roster;
pub mod session;
pub mod signaling;
pub mod status;
pub mod types;

pub use config::Config;
pub use error::{CaptureError, Error, Result};
pub use negotiation::{Device, Producer};
pub use session::{RtpStats, Session};
pub use signaling::SignalingChannel;
pub use status::{SessionStatus, StatusCell};

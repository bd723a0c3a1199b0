//! Session negotiation pipeline
//!
//! Capability exchange, transport creation and connection, then production.
//! Each phase is gated on the acknowledgment of the previous one.

pub mod device;
pub mod producer;
pub mod rtp;
pub mod transport;

pub use device::{CapabilityNegotiator, Device};
pub use producer::{Producer, ProducerController};
pub use transport::{
    SendTransport, TransportEvent, TransportFailure, TransportManager, TransportState,
};

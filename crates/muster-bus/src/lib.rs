//! muster-bus -- typed publish/subscribe fabric for agent-to-agent
//! message envelopes: per-sender FIFO delivery, sequential handler
//! dispatch, correlation-id duplicate suppression.

pub mod bus;
pub mod envelope;

pub use bus::{BusClient, BusError, EnvelopeHandler};
pub use envelope::Envelope;

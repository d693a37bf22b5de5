//! Message passing between the supervisor and agents.

/// File-based notification streams
pub mod transport;

pub use transport::{AgentEvent, FileTransport, InboundEvent, StreamKind, Transport};

pub mod message;
pub mod queue;

pub use message::{AgentMessage, MessageKind, Recipient};
pub use queue::{BusError, MessageQueue};

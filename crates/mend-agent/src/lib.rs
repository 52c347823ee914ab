//! The agent control loop, message fan-out, port monitor, and completion
//! gating.

pub mod agent;
pub mod commits;
pub mod done;
pub mod fanout;
pub mod port_monitor;

pub use agent::{Agent, CodingAgent};
pub use commits::CommitDetector;
pub use fanout::{MessageIterator, MessageLog, StateIterator, StateLog};
pub use port_monitor::PortMonitor;

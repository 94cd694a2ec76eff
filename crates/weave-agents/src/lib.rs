pub mod agent;
pub mod spec;
pub mod status;
pub mod system;

pub use agent::{Agent, AgentError, StopHandle, SUPERVISOR_MAILBOX};
pub use spec::{AgentSpec, RulesDocument};
pub use status::AgentStatus;
pub use system::{build_agent, run_agent_system, AgentSystem, AgentSystemBuilder, SystemReport};

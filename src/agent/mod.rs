#[allow(clippy::module_inception)]
mod agent;

pub use agent::Agent;
pub use agent::AgentConfig;
pub use agent::AgentError;

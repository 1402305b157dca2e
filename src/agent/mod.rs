pub mod audit;
pub mod conversation;
pub mod memory;
pub mod orchestrator;
pub mod redaction;
pub mod router;
pub mod runtime;
pub mod token_guard;

pub use orchestrator::{Orchestrator, Reply};
pub use router::{RequestContext, ToolRouter};
pub use runtime::AgentRuntime;

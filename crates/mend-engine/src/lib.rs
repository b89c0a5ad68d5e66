//! Orchestration engine for Mend: the inference client, the tool registry,
//! the sandbox subsystem, and the agent loop that ties them together.

pub mod lab;
pub mod llm;

pub use lab::sandbox::SandboxManager;
pub use llm::agentic::{
    ChatBackend, ConversationSession, FailureReason, SessionConfig, SessionState,
};
pub use llm::client::HttpBackend;
pub use llm::tools::ToolRegistry;

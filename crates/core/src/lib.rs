//! Provider-neutral building blocks shared by the live session engine and the
//! chat path: the content model, history normalisation, local tool contracts
//! and the agentic tool-calling loop.

pub mod agent;
pub mod error;
pub mod generic_types;
pub mod history;
pub mod llm_client;
pub mod orchestrator;
pub mod tools;

pub use error::{LlmError, ToolError};
pub use generic_types::{Content, FunctionCall, FunctionResponse, Part, Role, ToolManifest};
pub use history::{HistoryEntry, build_history};
pub use orchestrator::ToolCallOrchestrator;
pub use tools::{ConfirmationGate, DangerPolicy, ToolCall, ToolCallStatus, ToolExecutor, ToolRuntime};

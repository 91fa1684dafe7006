use thiserror::Error;

/// Failure of a single local tool invocation.
///
/// These never abort a conversation: the orchestrator folds them into a
/// `{success: false, error}` result for the model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    Failed(String),
}

/// Failure talking to the content-generation REST endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("event stream failed: {0}")]
    Stream(String),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response contained no candidates")]
    EmptyResponse,
}

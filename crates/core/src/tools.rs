//! Contracts between the engine and local capabilities.
//!
//! The engine never knows how a tool is implemented. It sees an executor that
//! can list and run tools, a confirmation collaborator that asks a human, and an
//! observer that is told about every call for audit and UI purposes.

use crate::{
    error::ToolError,
    generic_types::{FunctionDeclaration, ToolManifest},
};
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use serde_json::{Map, Value};
use std::{collections::HashSet, sync::Arc};

/// Runs local tools on behalf of the model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Declarations advertised to the model in the tool manifest.
    async fn declarations(&self) -> Result<Vec<FunctionDeclaration>, ToolError>;

    /// Executes `name` with `args`, returning its success payload.
    async fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// Asks a human to approve a dangerous action.
///
/// Implementations may wait indefinitely; callers never impose a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, description: &str) -> bool;
}

/// Receives every tool call as it moves through its lifecycle.
pub trait ToolObserver: Send + Sync {
    fn on_tool_call(&self, call: &ToolCall);
}

impl<F> ToolObserver for F
where
    F: Fn(&ToolCall) + Send + Sync,
{
    fn on_tool_call(&self, call: &ToolCall) {
        self(call)
    }
}

/// Lifecycle of a [`ToolCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Pending,
    AwaitingConfirmation,
    Executing,
    Completed,
    Failed,
}

/// A single function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Session-scoped, assigned in order of arrival.
    pub id: u64,
    pub name: String,
    pub args: Map<String, Value>,
    pub status: ToolCallStatus,
    /// The structured result sent back to the model once resolved.
    pub result: Option<Value>,
}

/// Decides which tools need explicit human confirmation.
#[derive(Debug, Clone)]
pub struct DangerPolicy {
    dangerous: HashSet<String>,
}

impl DangerPolicy {
    /// Tool names that delete data, run arbitrary commands or send messages.
    pub const DEFAULT_DANGEROUS: &'static [&'static str] = &[
        "delete_file",
        "delete_directory",
        "move_to_trash",
        "execute_command",
        "run_shell_command",
        "send_email",
    ];

    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dangerous: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_dangerous(&self, name: &str) -> bool {
        self.dangerous.contains(name)
    }

    /// Human-readable prompt shown by the confirmation gate.
    pub fn describe(&self, name: &str, args: &Map<String, Value>) -> String {
        let rendered = serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
        format!("The assistant wants to run `{name}` with {rendered}. Allow?")
    }
}

impl Default for DangerPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DANGEROUS.iter().copied())
    }
}

/// Everything needed to resolve tool calls locally.
#[derive(Clone)]
pub struct ToolRuntime {
    pub executor: Arc<dyn ToolExecutor>,
    pub gate: Arc<dyn ConfirmationGate>,
    pub policy: DangerPolicy,
    pub observer: Option<Arc<dyn ToolObserver>>,
}

impl ToolRuntime {
    pub fn new(executor: Arc<dyn ToolExecutor>, gate: Arc<dyn ConfirmationGate>) -> Self {
        Self {
            executor,
            gate,
            policy: DangerPolicy::default(),
            observer: None,
        }
    }

    pub fn with_policy(mut self, policy: DangerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ToolObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Builds the manifest from the executor's declarations.
    pub async fn manifest(&self, google_search: bool) -> Result<ToolManifest, ToolError> {
        Ok(ToolManifest {
            functions: self.executor.declarations().await?,
            google_search,
        })
    }
}

/// A [`ToolExecutor`] backed by an MCP server.
pub struct McpToolExecutor {
    client: RunningService<RoleClient, ()>,
}

impl McpToolExecutor {
    pub fn new(client: RunningService<RoleClient, ()>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    async fn declarations(&self) -> Result<Vec<FunctionDeclaration>, ToolError> {
        let tools = self
            .client
            .list_all_tools()
            .await
            .map_err(|e| ToolError::Failed(format!("failed to list tools: {e}")))?;

        tools
            .into_iter()
            .map(|t| {
                let schema = serde_json::to_value(&*t.input_schema)
                    .map_err(|e| ToolError::Failed(e.to_string()))?;
                Ok(FunctionDeclaration {
                    name: t.name.to_string(),
                    description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                    parameters: Some(sanitize_schema(schema)),
                })
            })
            .collect()
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(args.clone()),
            })
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        let text = result
            .content
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| match c.raw {
                RawContent::Text(text_content) => Some(text_content.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            return Err(ToolError::Failed(text));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Strips JSON-schema keywords the function-declaration schema subset rejects.
pub fn sanitize_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !matches!(k.as_str(), "$schema" | "additionalProperties" | "title"))
                .map(|(k, v)| (k, sanitize_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_schema).collect()),
        other => other,
    }
}

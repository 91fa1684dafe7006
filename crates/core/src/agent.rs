//! The chat turn driver.
//!
//! Without a local tool runtime a turn is streamed straight to the caller.
//! With one, each round is a non-streaming request whose function calls are
//! resolved locally and fed back, until the model answers in text or the round
//! limit is hit.

use crate::{
    error::LlmError,
    generic_types::{Citation, Content, Role, ToolManifest},
    history::{DEFAULT_HISTORY_TURNS, HistoryEntry, build_history},
    llm_client::{ContentGenerator, GenerateContentRequest},
    orchestrator::ToolCallOrchestrator,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Upper bound on request/response cycles in one agentic turn.
pub const DEFAULT_MAX_ROUNDS: usize = 10;

/// Answer surfaced when the round limit is reached while the model still calls tools.
pub const ROUND_LIMIT_MESSAGE: &str =
    "I've completed the requested actions. Let me know if you need anything else.";

/// The outcome of one chat turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTurn {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Number of agentic rounds used; zero for streamed turns.
    pub rounds: usize,
}

/// Drives a single user message to a final model answer.
pub struct ChatAgent {
    generator: Arc<dyn ContentGenerator>,
    tools: Option<Arc<ToolCallOrchestrator>>,
    manifest: ToolManifest,
    system_instruction: Option<String>,
    max_rounds: usize,
    history_turns: usize,
}

impl ChatAgent {
    /// A streaming agent with no local tools.
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self {
            generator,
            tools: None,
            manifest: ToolManifest::default(),
            system_instruction: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            history_turns: DEFAULT_HISTORY_TURNS,
        }
    }

    /// Enables agentic mode. `manifest` lists the declarations offered to the model.
    pub fn with_tools(mut self, tools: Arc<ToolCallOrchestrator>, manifest: ToolManifest) -> Self {
        self.tools = Some(tools);
        self.manifest = manifest;
        self
    }

    /// Offers the built-in search tool on streamed (non-agentic) turns.
    pub fn with_search(mut self, enabled: bool) -> Self {
        self.manifest.google_search = enabled;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_history_turns(mut self, turns: usize) -> Self {
        self.history_turns = turns;
        self
    }

    /// Sends `message` after the normalised suffix of `history`.
    ///
    /// `on_chunk` receives text as it becomes available: progressively when
    /// streaming, once with the complete answer in agentic mode.
    #[instrument(skip_all, fields(agentic = self.tools.is_some()))]
    pub async fn send<F>(
        &self,
        history: &[HistoryEntry],
        message: &str,
        mut on_chunk: F,
    ) -> Result<ChatTurn, LlmError>
    where
        F: FnMut(&str) + Send,
    {
        let mut contents = build_history(history, self.history_turns);
        contents.push(Content::user_text(message));

        match &self.tools {
            Some(tools) => self.run_agentic(tools, contents, &mut on_chunk).await,
            None => self.run_streaming(contents, &mut on_chunk).await,
        }
    }

    fn request(&self, contents: Vec<Content>, manifest: &ToolManifest) -> GenerateContentRequest {
        GenerateContentRequest {
            contents,
            system_instruction: self.system_instruction.clone().map(Content::instruction),
            tools: manifest.to_specs(),
        }
    }

    async fn run_streaming<F>(
        &self,
        contents: Vec<Content>,
        on_chunk: &mut F,
    ) -> Result<ChatTurn, LlmError>
    where
        F: FnMut(&str) + Send,
    {
        let request = self.request(contents, &self.manifest);
        let mut stream = self.generator.stream(&request).await?;

        let mut turn = ChatTurn::default();
        while let Some(event) = stream.next().await {
            let response = event?;
            if let Some(content) = response.content() {
                let text = content.text();
                if !text.is_empty() {
                    on_chunk(&text);
                    turn.text.push_str(&text);
                }
            }
            // Grounding metadata is attached to the finalized chunk.
            if let Some(metadata) = response
                .candidates
                .first()
                .and_then(|c| c.grounding_metadata.as_ref())
            {
                turn.citations = metadata.citations();
            }
        }
        Ok(turn)
    }

    async fn run_agentic<F>(
        &self,
        tools: &ToolCallOrchestrator,
        mut contents: Vec<Content>,
        on_chunk: &mut F,
    ) -> Result<ChatTurn, LlmError>
    where
        F: FnMut(&str) + Send,
    {
        let manifest = self.manifest.without_search();

        for round in 1..=self.max_rounds {
            let request = self.request(contents.clone(), &manifest);
            let response = self.generator.generate(&request).await?;
            let content = response.content().ok_or(LlmError::EmptyResponse)?.clone();

            let calls = content.function_calls();
            if calls.is_empty() {
                let text = content.text();
                on_chunk(&text);
                return Ok(ChatTurn {
                    text,
                    citations: Vec::new(),
                    rounds: round,
                });
            }

            info!(round, calls = calls.len(), "Model requested tool calls");
            let responses = tools.resolve_round(calls).await;
            contents.push(Content {
                role: Some(Role::Model),
                parts: content.parts,
            });
            contents.push(Content::function_responses(responses));
        }

        warn!(max_rounds = self.max_rounds, "Agentic round limit reached");
        on_chunk(ROUND_LIMIT_MESSAGE);
        Ok(ChatTurn {
            text: ROUND_LIMIT_MESSAGE.to_string(),
            citations: Vec::new(),
            rounds: self.max_rounds,
        })
    }
}

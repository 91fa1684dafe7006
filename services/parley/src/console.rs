//! Terminal input and output for interactive sessions.
//!
//! One task owns stdin. While a confirmation is pending the next line answers
//! it; every other line is a user message.

use async_trait::async_trait;
use gemini_realtime::{LiveEvent, TranscriptSource};
use parley_core::{ConfirmationGate, ToolCall, ToolCallStatus};
use std::{
    io::Write,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::debug;

type PendingAnswer = Arc<Mutex<Option<oneshot::Sender<bool>>>>;

/// Asks for confirmation on the terminal.
#[derive(Clone, Default)]
pub struct ConsoleGate {
    pending: PendingAnswer,
}

#[async_trait]
impl ConfirmationGate for ConsoleGate {
    async fn confirm(&self, description: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            // A newer question supersedes an unanswered one, which counts as declined.
            *pending = Some(tx);
        }
        print!("{}", confirm_prompt(description));
        let _ = std::io::stdout().flush();
        rx.await.unwrap_or(false)
    }
}

/// `description` already ends with the question, so only the answer hint is added.
fn confirm_prompt(description: &str) -> String {
    format!("\n[confirm] {description} [y/N] ")
}

pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Routes lines from `reader` to the pending confirmation or to `messages`.
pub async fn route_lines<R>(reader: R, gate: ConsoleGate, messages: mpsc::Sender<String>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let waiting = gate
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match waiting {
            Some(answer) => {
                let _ = answer.send(is_affirmative(&line));
            }
            None => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if messages.send(line.to_string()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Console input closed.");
}

/// Starts reading stdin. Returns the gate and the stream of user messages.
pub fn spawn_stdin() -> (ConsoleGate, mpsc::Receiver<String>) {
    let gate = ConsoleGate::default();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(route_lines(BufReader::new(tokio::io::stdin()), gate.clone(), tx));
    (gate, rx)
}

/// Prints tool activity as it happens.
pub fn print_tool_call(call: &ToolCall) {
    match call.status {
        ToolCallStatus::Executing => println!("\n[tool] {} {}", call.name, serde_json::Value::Object(call.args.clone())),
        ToolCallStatus::Failed => println!("[tool] {} failed", call.name),
        ToolCallStatus::Completed => println!("[tool] {} done", call.name),
        ToolCallStatus::Pending | ToolCallStatus::AwaitingConfirmation => {}
    }
}

/// Prints one session event. Returns `false` once the session has ended.
pub fn print_event(event: &LiveEvent) -> bool {
    match event {
        LiveEvent::Ready { resumed: false } => println!("[ready] Speak or type a message."),
        LiveEvent::Ready { resumed: true } => debug!("Session renewed."),
        LiveEvent::Text(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        LiveEvent::Transcription { source: TranscriptSource::Input, text } => println!("\n[you] {text}"),
        LiveEvent::Transcription { source: TranscriptSource::Output, text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        LiveEvent::TurnComplete => println!(),
        LiveEvent::Interrupted => println!("\n[interrupted]"),
        LiveEvent::Citations(citations) => {
            for citation in citations {
                match &citation.title {
                    Some(title) => println!("  source: {title} <{}>", citation.uri),
                    None => println!("  source: {}", citation.uri),
                }
            }
        }
        LiveEvent::Error(message) => eprintln!("\n[error] {message}"),
        LiveEvent::Fatal(e) => {
            eprintln!("\n[fatal] {e}");
            return false;
        }
        LiveEvent::Closed => return false,
    }
    true
}

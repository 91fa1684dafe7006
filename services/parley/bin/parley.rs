//! Main entrypoint for the parley voice assistant.
//!
//! `parley live` runs a realtime voice session on the default microphone and
//! speakers, with typed messages and tool confirmations on the terminal.
//! `parley ask` answers one message through the chat API.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gemini_realtime::{AudioIngestPipeline, IngestSettings, LiveClient, PlaybackDevice};
use parley_core::{
    HistoryEntry, ToolCallOrchestrator, ToolRuntime,
    agent::ChatAgent,
    llm_client::GeminiRestClient,
    tools::ToolObserver,
};
use parley_service::{
    audio_device::{CpalCapture, CpalPlayback},
    config::Config,
    console::{self, ConsoleGate},
    toolbox::spawn_local_tools,
};
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about = "Talk to Gemini with your voice or your keyboard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a realtime session.
    Live {
        /// Ask for text replies instead of speech.
        #[arg(long)]
        text_only: bool,
        /// Don't open the microphone; type messages instead.
        #[arg(long)]
        no_mic: bool,
        /// Prebuilt voice name, overriding VOICE_NAME.
        #[arg(long)]
        voice: Option<String>,
        /// Directory the local file tools operate in.
        #[arg(long, default_value = ".")]
        tools_root: PathBuf,
        /// Don't offer local tools to the model.
        #[arg(long)]
        no_tools: bool,
    },
    /// Send one message and print the answer.
    Ask {
        message: String,
        /// JSON file with prior `{role, text}` turns. Updated with this exchange.
        #[arg(long)]
        history: Option<PathBuf>,
        /// Let the model call local tools.
        #[arg(long)]
        tools: bool,
        #[arg(long, default_value = ".")]
        tools_root: PathBuf,
    },
}

fn load_system_prompt(config: &Config) -> anyhow::Result<Option<String>> {
    config
        .system_prompt_path
        .as_deref()
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt '{}'", path.display()))
        })
        .transpose()
}

async fn tool_runtime(root: &Path, gate: ConsoleGate) -> anyhow::Result<ToolRuntime> {
    let executor = spawn_local_tools(root)
        .await
        .context("Failed to start local tool server")?;
    let observer: Arc<dyn ToolObserver> = Arc::new(console::print_tool_call);
    Ok(ToolRuntime::new(Arc::new(executor), Arc::new(gate)).with_observer(observer))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let system_prompt = load_system_prompt(&config)?;

    match cli.command {
        Command::Live {
            text_only,
            no_mic,
            voice,
            tools_root,
            no_tools,
        } => {
            if voice.is_some() {
                config.voice_name = voice;
            }
            run_live(&config, system_prompt, text_only, no_mic, (!no_tools).then_some(tools_root)).await
        }
        Command::Ask {
            message,
            history,
            tools,
            tools_root,
        } => run_ask(&config, system_prompt, &message, history.as_deref(), tools.then_some(tools_root)).await,
    }
}

async fn run_live(
    config: &Config,
    system_prompt: Option<String>,
    text_only: bool,
    no_mic: bool,
    tools_root: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (gate, mut typed) = console::spawn_stdin();

    let mut builder = LiveClient::builder(config.live_config(system_prompt, text_only));
    if let Some(root) = tools_root {
        builder = builder.tools(tool_runtime(&root, gate).await?);
    }
    if !text_only {
        match CpalPlayback::open() {
            Ok(device) => builder = builder.playback(Box::new(device) as Box<dyn PlaybackDevice>),
            Err(e) => warn!(error = %e, "No speaker available. Replies will be transcribed only."),
        }
    }

    info!(model = %config.live_model, "Connecting...");
    let (client, mut events) = builder.connect().await.context("Failed to start live session")?;

    let mut ingest = if no_mic {
        None
    } else {
        match AudioIngestPipeline::start(
            Box::new(CpalCapture::new()),
            Arc::new(client.clone()),
            IngestSettings::default(),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Microphone unavailable. Type messages instead.");
                None
            }
        }
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            }
            Some(line) = typed.recv() => client.send_text(line).await,
            event = events.recv() => match event {
                Some(event) if console::print_event(&event) => {}
                _ => break,
            },
        }
    }

    if let Some(ingest) = ingest.as_mut() {
        ingest.stop().await;
    }
    client.disconnect().await;
    Ok(())
}

async fn run_ask(
    config: &Config,
    system_prompt: Option<String>,
    message: &str,
    history_path: Option<&Path>,
    tools_root: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut history: Vec<HistoryEntry> = match history_path {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read history '{}'", path.display()))?;
            serde_json::from_str(&raw).context("History file is not a JSON list of turns")?
        }
        _ => Vec::new(),
    };

    let generator = Arc::new(GeminiRestClient::new(
        config.gemini_api_key.clone(),
        config.chat_model.clone(),
    ));
    let mut agent = ChatAgent::new(generator);
    // Kept alive so confirmation prompts can be answered.
    let mut _typed = None;
    if let Some(root) = tools_root {
        let (gate, typed) = console::spawn_stdin();
        _typed = Some(typed);
        let runtime = tool_runtime(&root, gate).await?;
        let manifest = runtime.manifest(config.enable_search).await?;
        agent = agent.with_tools(Arc::new(ToolCallOrchestrator::new(runtime)), manifest);
    }
    agent = agent.with_search(config.enable_search);
    if let Some(prompt) = system_prompt {
        agent = agent.with_system_instruction(prompt);
    }

    let turn = agent
        .send(&history, message, |chunk| {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        })
        .await
        .context("Chat request failed")?;
    println!();
    for citation in &turn.citations {
        match &citation.title {
            Some(title) => println!("  source: {title} <{}>", citation.uri),
            None => println!("  source: {}", citation.uri),
        }
    }

    if let Some(path) = history_path {
        history.push(HistoryEntry::user(message));
        history.push(HistoryEntry::model(turn.text));
        std::fs::write(path, serde_json::to_string_pretty(&history)?)
            .with_context(|| format!("Failed to write history '{}'", path.display()))?;
    }
    Ok(())
}

use crate::{
    audio::encode_pcm16_base64,
    config::LiveConfig,
    egress::{AudioEgressScheduler, EgressHandle, PlaybackDevice},
    engine::Engine,
    error::LiveError,
    ingest::AudioSink,
    lifecycle::{SessionLifecycleManager, SessionState},
    negotiate::CapabilityNegotiator,
    transport::{Transport, WebSocketTransport},
};
use async_trait::async_trait;
use parley_core::{
    ToolCallOrchestrator, ToolRuntime,
    generic_types::{Citation, ToolManifest},
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{info, warn};

/// Which side of the conversation a transcription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptSource {
    Input,
    Output,
}

/// Everything the session reports to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The session is usable. `resumed` is set after a renewal.
    Ready { resumed: bool },
    Text(String),
    Transcription { source: TranscriptSource, text: String },
    TurnComplete,
    /// The model was interrupted; queued audio has been discarded.
    Interrupted,
    Citations(Vec<Citation>),
    /// A non-fatal error reported by the server.
    Error(String),
    /// The session has stopped and will not reconnect.
    Fatal(LiveError),
    Closed,
}

pub(crate) enum Command {
    Text(String),
    /// Base64 PCM16 at the ingest rate.
    Audio(String),
    Disconnect(oneshot::Sender<()>),
}

/// Configures and opens a live session.
pub struct LiveClientBuilder {
    config: LiveConfig,
    transport: Option<Arc<dyn Transport>>,
    playback: Option<Box<dyn PlaybackDevice>>,
    tools: Option<ToolRuntime>,
}

impl LiveClientBuilder {
    /// Replaces the default TLS WebSocket transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Device for model audio. Without one, audio is discarded.
    pub fn playback(mut self, device: Box<dyn PlaybackDevice>) -> Self {
        self.playback = Some(device);
        self
    }

    /// Local tools the model may call.
    pub fn tools(mut self, runtime: ToolRuntime) -> Self {
        self.tools = Some(runtime);
        self
    }

    /// Connects and waits until the first session is ready.
    pub async fn connect(self) -> Result<(LiveClient, mpsc::UnboundedReceiver<LiveEvent>), LiveError> {
        let manifest = match &self.tools {
            Some(runtime) => match runtime.manifest(self.config.google_search).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(error = %e, "Could not list local tools, continuing without them");
                    ToolManifest {
                        functions: Vec::new(),
                        google_search: self.config.google_search,
                    }
                }
            },
            None => ToolManifest {
                functions: Vec::new(),
                google_search: self.config.google_search,
            },
        };

        let egress = self.playback.map(|device| {
            let (handle, _task) =
                EgressHandle::spawn(AudioEgressScheduler::new(device, self.config.egress.clone()));
            handle
        });

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (ready_tx, ready_rx) = oneshot::channel();
        let disposed = Arc::new(AtomicBool::new(false));

        let engine = Engine {
            lifecycle: SessionLifecycleManager::new(self.config.timings.renew_after()),
            config: self.config,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(WebSocketTransport) as Arc<dyn Transport>),
            manifest,
            orchestrator: self.tools.map(|runtime| Arc::new(ToolCallOrchestrator::new(runtime))),
            egress,
            negotiator: CapabilityNegotiator,
            disposed: disposed.clone(),
            state_tx,
            events: event_tx,
            commands: command_rx,
            ready_tx: Some(ready_tx),
            pending_text: VecDeque::new(),
            disconnect_acks: Vec::new(),
            round_lock: Arc::new(Mutex::new(())),
            sessions_ready: 0,
        };
        tokio::spawn(engine.run());

        let client = LiveClient {
            commands: command_tx,
            state: state_rx,
            disposed,
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok((client, event_rx)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LiveError::Closed),
        }
    }
}

/// Handle to a running live session. Cheap to clone.
///
/// Sends are fire-and-forget. After [`disconnect`](Self::disconnect) every
/// send is a no-op and no reconnection is attempted.
#[derive(Clone)]
pub struct LiveClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    disposed: Arc<AtomicBool>,
}

impl LiveClient {
    pub fn builder(config: LiveConfig) -> LiveClientBuilder {
        LiveClientBuilder {
            config,
            transport: None,
            playback: None,
            tools: None,
        }
    }

    /// Sends a complete user text turn. Queued while a renewal is in flight.
    pub async fn send_text(&self, text: impl Into<String>) {
        if self.is_disposed() {
            return;
        }
        let _ = self.commands.send(Command::Text(text.into())).await;
    }

    /// Sends PCM16 samples at the ingest rate. Dropped unless the session is ready.
    pub async fn send_audio_chunk(&self, samples: &[i16]) {
        if !self.is_ready() {
            return;
        }
        let _ = self
            .commands
            .send(Command::Audio(encode_pcm16_base64(samples)))
            .await;
    }

    /// Closes the session permanently. Idempotent.
    pub async fn disconnect(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting live session.");
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        !self.is_disposed() && self.state() == SessionState::Ready
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for LiveClient {
    fn is_ready(&self) -> bool {
        LiveClient::is_ready(self)
    }

    async fn send_audio(&self, samples: &[i16]) {
        self.send_audio_chunk(samples).await;
    }

    /// The engine has stopped for good, after a disconnect or a fatal error.
    async fn closed(&self) {
        self.commands.closed().await;
    }
}

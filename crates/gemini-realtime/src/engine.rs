//! The live session event loop.
//!
//! One task owns the session. It consumes a single merged stream of caller
//! commands, socket events, tool-round results and timer ticks, so session
//! state is only ever touched by one handler at a time. Reconnection is an
//! explicit outer loop, never recursion.

use crate::{
    client::{Command, LiveEvent, TranscriptSource},
    config::LiveConfig,
    egress::{AudioPayload, EgressHandle},
    error::LiveError,
    handshake::{HandshakeController, Readiness},
    lifecycle::{SessionLifecycleManager, SessionState},
    negotiate::{CapabilityNegotiator, RejectionOutcome},
    protocol::{ClientMessage, ServerContent, ServerFrame},
    transport::{CLOSE_ABNORMAL, Connection, OutboundFrame, Transport, TransportEvent, open_with_timeout},
};
use parley_core::{
    ToolCallOrchestrator,
    generic_types::{FunctionCall, FunctionResponse, ToolManifest},
};
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    sync::{Mutex, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Connection attempts in a row that may fail to reach Ready.
const MAX_ATTEMPTS_WITHOUT_READY: u32 = 3;

/// Returned to the model when a call arrives but no local tools are configured.
const NO_TOOLS_MESSAGE: &str = "No local tools are available in this session.";

/// How one connection ended.
#[derive(Debug)]
enum ConnectionOutcome {
    /// Soft disconnect before the session ceiling; reconnect transparently.
    Renew,
    /// Setup was rejected; reconnect once with this reduced manifest.
    RetryReduced(ToolManifest),
    /// The caller closed the session.
    Disposed,
    Failed(LiveError),
}

pub(crate) struct Engine {
    pub(crate) config: LiveConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) manifest: ToolManifest,
    pub(crate) orchestrator: Option<Arc<ToolCallOrchestrator>>,
    pub(crate) egress: Option<EgressHandle>,
    pub(crate) lifecycle: SessionLifecycleManager,
    pub(crate) negotiator: CapabilityNegotiator,
    pub(crate) disposed: Arc<AtomicBool>,
    pub(crate) state_tx: watch::Sender<SessionState>,
    pub(crate) events: mpsc::UnboundedSender<LiveEvent>,
    pub(crate) commands: mpsc::Receiver<Command>,
    pub(crate) ready_tx: Option<oneshot::Sender<Result<(), LiveError>>>,
    pub(crate) pending_text: VecDeque<String>,
    pub(crate) disconnect_acks: Vec<oneshot::Sender<()>>,
    pub(crate) round_lock: Arc<Mutex<()>>,
    pub(crate) sessions_ready: u64,
}

impl Engine {
    pub(crate) async fn run(mut self) {
        let mut attempt: u64 = 0;
        let mut attempts_without_ready: u32 = 0;

        loop {
            if self.disposed.load(Ordering::SeqCst) {
                break;
            }
            if attempts_without_ready >= MAX_ATTEMPTS_WITHOUT_READY {
                self.fail(LiveError::HandshakeRejected {
                    code: CLOSE_ABNORMAL,
                    reason: format!("no ready session after {attempts_without_ready} attempts"),
                });
                break;
            }
            attempt += 1;
            attempts_without_ready += 1;
            let ready_before = self.sessions_ready;

            self.set_state(SessionState::Connecting);
            let outcome = self
                .run_connection()
                .instrument(info_span!("live_connection", attempt))
                .await;
            if self.sessions_ready > ready_before {
                attempts_without_ready = 0;
            }
            self.set_state(SessionState::Closed);

            match outcome {
                ConnectionOutcome::Renew => {
                    info!("Renewing live session.");
                    if let Some(egress) = &self.egress {
                        egress.reset();
                    }
                    tokio::time::sleep(self.config.timings.renewal_pause).await;
                }
                ConnectionOutcome::RetryReduced(manifest) => {
                    warn!("Setup rejected, retrying once without built-in search.");
                    self.manifest = manifest;
                }
                ConnectionOutcome::Disposed => break,
                ConnectionOutcome::Failed(e) => {
                    self.fail(e);
                    break;
                }
            }
        }

        self.set_state(SessionState::Closed);
        let _ = self.events.send(LiveEvent::Closed);
        for ack in self.disconnect_acks.drain(..) {
            let _ = ack.send(());
        }
        debug!("Live engine finished.");
    }

    fn fail(&mut self, e: LiveError) {
        error!(error = %e, "Live session failed");
        match self.ready_tx.take() {
            Some(ready) => {
                let _ = ready.send(Err(e));
            }
            None => {
                let _ = self.events.send(LiveEvent::Fatal(e));
            }
        }
    }

    fn set_state(&mut self, to: SessionState) {
        if self.lifecycle.state() == to {
            return;
        }
        let disposed = self.disposed.load(Ordering::SeqCst);
        match self.lifecycle.transition(to, disposed, Instant::now()) {
            Ok(()) => {
                self.state_tx.send_replace(to);
            }
            Err(e) => debug!(error = %e, "Ignoring session transition"),
        }
    }

    async fn run_connection(&mut self) -> ConnectionOutcome {
        let timings = self.config.timings.clone();
        let mut conn = match open_with_timeout(
            self.transport.as_ref(),
            &self.config.url(),
            timings.connect_timeout,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => return ConnectionOutcome::Failed(e),
        };
        if self.disposed.load(Ordering::SeqCst) {
            let _ = conn.outbound.send(OutboundFrame::Close).await;
            return ConnectionOutcome::Disposed;
        }

        self.set_state(SessionState::Handshaking);
        let mut handshake = HandshakeController::start(Instant::now(), timings.soft_ready_grace);
        let setup = HandshakeController::setup_frame(&self.config, &self.manifest);
        if let Err(outcome) = self.send(&conn, &setup).await {
            return outcome;
        }
        info!(model = %self.config.model_path(), tools = self.manifest.functions.len(), search = self.manifest.google_search, "Sent session setup.");

        let soft_ready = tokio::time::sleep_until(handshake.deadline());
        tokio::pin!(soft_ready);
        let mut renewal = tokio::time::interval_at(
            Instant::now() + timings.renewal_check_interval,
            timings.renewal_check_interval,
        );
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Per-connection, so results of rounds from a closed connection are discarded.
        let (tool_tx, mut tool_rx) = mpsc::channel::<Vec<FunctionResponse>>(8);

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => self.on_command(&conn, command).await,
                event = conn.inbound.recv() => {
                    if self.disposed.load(Ordering::SeqCst) {
                        return self.close(&conn).await;
                    }
                    self.on_transport_event(&conn, &mut handshake, &tool_tx, event).await
                }
                Some(responses) = tool_rx.recv() => {
                    if self.disposed.load(Ordering::SeqCst) {
                        return self.close(&conn).await;
                    }
                    debug!(responses = responses.len(), "Sending tool response.");
                    self.send(&conn, &ClientMessage::tool_response(responses)).await.err()
                }
                _ = &mut soft_ready, if handshake.readiness().is_none() => {
                    if handshake.on_deadline(Instant::now()) {
                        warn!("No setup acknowledgment within the grace window, continuing soft-ready.");
                        self.on_ready(&conn, Readiness::SoftReady).await.err()
                    } else {
                        None
                    }
                }
                _ = renewal.tick() => {
                    if self.lifecycle.should_renew(Instant::now()) {
                        info!("Session approaching its lifetime ceiling.");
                        Some(self.soft_disconnect(&conn).await)
                    } else {
                        None
                    }
                }
            };
            if let Some(outcome) = step {
                return outcome;
            }
        }
    }

    async fn on_command(
        &mut self,
        conn: &Connection,
        command: Option<Command>,
    ) -> Option<ConnectionOutcome> {
        match command {
            None => {
                // Every client handle is gone; nobody can observe the session.
                self.disposed.store(true, Ordering::SeqCst);
                Some(self.close(conn).await)
            }
            Some(Command::Disconnect(ack)) => {
                self.disconnect_acks.push(ack);
                Some(self.close(conn).await)
            }
            Some(Command::Text(text)) => {
                if self.lifecycle.state() == SessionState::Ready {
                    self.send(conn, &ClientMessage::user_text(text)).await.err()
                } else {
                    debug!("Session not ready, queueing text turn.");
                    self.pending_text.push_back(text);
                    None
                }
            }
            Some(Command::Audio(data)) => {
                if self.lifecycle.state() == SessionState::Ready {
                    self.send(conn, &ClientMessage::audio(data)).await.err()
                } else {
                    trace!("Session not ready, dropping audio chunk.");
                    None
                }
            }
        }
    }

    async fn on_transport_event(
        &mut self,
        conn: &Connection,
        handshake: &mut HandshakeController,
        tool_tx: &mpsc::Sender<Vec<FunctionResponse>>,
        event: Option<TransportEvent>,
    ) -> Option<ConnectionOutcome> {
        let frame = match event {
            Some(TransportEvent::Text(text)) => match ServerFrame::from_text(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable control frame");
                    return None;
                }
            },
            Some(TransportEvent::Binary(bytes)) => ServerFrame::from_binary(bytes),
            Some(TransportEvent::Closed { code, reason }) => {
                return Some(self.on_close(handshake, code, &reason));
            }
            Some(TransportEvent::Error(message)) => {
                return Some(self.on_close(handshake, CLOSE_ABNORMAL, &message));
            }
            None => return Some(self.on_close(handshake, CLOSE_ABNORMAL, "")),
        };

        match frame {
            ServerFrame::SetupAck => {
                if handshake.on_ack() {
                    info!("Session setup acknowledged.");
                    return self.on_ready(conn, Readiness::Acknowledged).await.err();
                }
                debug!("Late setup acknowledgment.");
                None
            }
            ServerFrame::Content(content) => {
                self.on_content(content, tool_tx);
                None
            }
            ServerFrame::ToolCall(calls) => {
                self.spawn_tool_round(calls, tool_tx);
                None
            }
            ServerFrame::GoAway { time_left } => {
                info!(time_left = time_left.as_deref().unwrap_or("unknown"), "Server announced disconnect.");
                Some(self.soft_disconnect(conn).await)
            }
            ServerFrame::Error { message } => {
                warn!(%message, "Server reported an error");
                let _ = self.events.send(LiveEvent::Error(message));
                None
            }
            ServerFrame::Audio(bytes) => {
                self.play(AudioPayload::Raw(bytes));
                None
            }
            ServerFrame::Other => None,
        }
    }

    fn on_content(
        &mut self,
        content: ServerContent,
        tool_tx: &mpsc::Sender<Vec<FunctionResponse>>,
    ) {
        if content.interrupted {
            if let Some(egress) = &self.egress {
                egress.clear();
            }
            let _ = self.events.send(LiveEvent::Interrupted);
        }
        for data in content.audio_payloads() {
            self.play(AudioPayload::Encoded(data.to_string()));
        }
        let text = content.text();
        if !text.is_empty() {
            let _ = self.events.send(LiveEvent::Text(text));
        }
        if let Some(text) = content.input_transcription.clone() {
            let _ = self
                .events
                .send(LiveEvent::Transcription { source: TranscriptSource::Input, text });
        }
        if let Some(text) = content.output_transcription.clone() {
            let _ = self
                .events
                .send(LiveEvent::Transcription { source: TranscriptSource::Output, text });
        }
        if !content.citations.is_empty() {
            let _ = self.events.send(LiveEvent::Citations(content.citations.clone()));
        }
        let calls = content.function_calls();
        if !calls.is_empty() {
            self.spawn_tool_round(calls, tool_tx);
        }
        if content.turn_complete {
            let _ = self.events.send(LiveEvent::TurnComplete);
        }
    }

    fn play(&mut self, payload: AudioPayload) {
        self.lifecycle.record_audio_activity(Instant::now());
        match &self.egress {
            Some(egress) => egress.play(payload),
            None => trace!("No playback device, dropping model audio."),
        }
    }

    /// Resolves a round off the event loop; confirmations may wait indefinitely.
    fn spawn_tool_round(&self, calls: Vec<FunctionCall>, tool_tx: &mpsc::Sender<Vec<FunctionResponse>>) {
        info!(calls = calls.len(), "Model requested tool calls.");
        let tx = tool_tx.clone();
        let Some(orchestrator) = self.orchestrator.clone() else {
            let responses = calls
                .into_iter()
                .map(|call| FunctionResponse {
                    id: call.id,
                    name: call.name,
                    response: json!({"success": false, "error": NO_TOOLS_MESSAGE}),
                })
                .collect();
            tokio::spawn(async move {
                let _ = tx.send(responses).await;
            });
            return;
        };
        let round_lock = self.round_lock.clone();
        tokio::spawn(
            async move {
                let _round = round_lock.lock().await;
                let responses = orchestrator.resolve_round(calls).await;
                let _ = tx.send(responses).await;
            }
            .in_current_span(),
        );
    }

    async fn on_ready(&mut self, conn: &Connection, readiness: Readiness) -> Result<(), ConnectionOutcome> {
        self.set_state(SessionState::Ready);
        let resumed = self.sessions_ready > 0;
        self.sessions_ready += 1;
        info!(?readiness, resumed, "Live session ready.");

        while let Some(text) = self.pending_text.pop_front() {
            self.send(conn, &ClientMessage::user_text(text)).await?;
        }
        if let Some(ready) = self.ready_tx.take() {
            let _ = ready.send(Ok(()));
        }
        let _ = self.events.send(LiveEvent::Ready { resumed });
        Ok(())
    }

    fn on_close(&mut self, handshake: &HandshakeController, code: u16, reason: &str) -> ConnectionOutcome {
        if self.disposed.load(Ordering::SeqCst) {
            return ConnectionOutcome::Disposed;
        }
        info!(code, %reason, "Live connection closed.");
        // Past setup once ready, whether acked or soft-ready.
        if handshake.readiness().is_some() {
            return ConnectionOutcome::Failed(LiveError::FatalTransport(
                crate::negotiate::describe_close(code, reason),
            ));
        }
        match self.negotiator.on_rejected_setup(
            code,
            reason,
            &self.manifest,
            self.lifecycle.capability_retry_available(),
        ) {
            RejectionOutcome::RetryWith(manifest) => {
                self.lifecycle.claim_capability_retry();
                ConnectionOutcome::RetryReduced(manifest)
            }
            RejectionOutcome::Fatal(e) => ConnectionOutcome::Failed(e),
        }
    }

    /// Tears the connection down without disposing the engine.
    async fn soft_disconnect(&mut self, conn: &Connection) -> ConnectionOutcome {
        self.set_state(SessionState::Closing);
        let _ = conn.outbound.send(OutboundFrame::Close).await;
        ConnectionOutcome::Renew
    }

    async fn close(&mut self, conn: &Connection) -> ConnectionOutcome {
        self.set_state(SessionState::Closing);
        let _ = conn.outbound.send(OutboundFrame::Close).await;
        info!("Live session closed by caller.");
        ConnectionOutcome::Disposed
    }

    async fn send(&self, conn: &Connection, message: &ClientMessage) -> Result<(), ConnectionOutcome> {
        let json = message.to_json().map_err(ConnectionOutcome::Failed)?;
        conn.outbound
            .send(OutboundFrame::Text(json))
            .await
            .map_err(|_| ConnectionOutcome::Failed(LiveError::FatalTransport("socket writer closed".into())))
    }
}

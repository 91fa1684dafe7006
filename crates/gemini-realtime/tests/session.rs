//! End-to-end behavior of a live session against an in-memory server.

use async_trait::async_trait;
use gemini_realtime::{
    AudioError, AudioIngestPipeline, CaptureDevice, Connection, IngestSettings, LiveClient,
    LiveConfig, LiveError, LiveEvent, OutboundFrame, PlaybackDevice, ScheduledBuffer,
    SessionState, SessionTimings, Transport, TransportEvent,
};
use parley_core::{
    ConfirmationGate, ToolError, ToolExecutor, ToolRuntime, generic_types::FunctionDeclaration,
};
use secrecy::SecretString;
use serde_json::{Map, Value, json};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

/// The server's side of one accepted connection.
struct ServerEnd {
    to_client: mpsc::Sender<TransportEvent>,
    from_client: mpsc::Receiver<OutboundFrame>,
}

impl ServerEnd {
    async fn next_frame(&mut self) -> Option<OutboundFrame> {
        timeout(WAIT, self.from_client.recv()).await.expect("client went quiet")
    }

    async fn next_json(&mut self) -> Value {
        match self.next_frame().await {
            Some(OutboundFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a JSON frame, got {other:?}"),
        }
    }

    async fn send(&self, frame: Value) {
        self.to_client
            .send(TransportEvent::Text(frame.to_string()))
            .await
            .unwrap();
    }

    async fn ack(&self) {
        self.send(json!({"setupComplete": {}})).await;
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

struct FakeTransport {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, url: &str) -> Result<Connection, LiveError> {
        self.urls.lock().unwrap().push(url.to_string());
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        self.accepted
            .send(ServerEnd {
                to_client: inbound_tx,
                from_client: outbound_rx,
            })
            .map_err(|_| LiveError::Connection("server gone".into()))?;
        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

struct Server {
    transport: Arc<FakeTransport>,
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Server {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport: Arc::new(FakeTransport {
                accepted: tx,
                urls: Mutex::new(Vec::new()),
            }),
            accepted: rx,
        }
    }

    async fn accept(&mut self) -> ServerEnd {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("no connection attempt")
            .expect("transport dropped")
    }

    fn opens(&self) -> usize {
        self.transport.urls.lock().unwrap().len()
    }
}

fn config() -> LiveConfig {
    LiveConfig::new(SecretString::from("test-key".to_string()))
}

type Connecting = JoinHandle<Result<(LiveClient, mpsc::UnboundedReceiver<LiveEvent>), LiveError>>;

fn start(server: &Server, config: LiveConfig, tools: Option<ToolRuntime>) -> Connecting {
    let mut builder = LiveClient::builder(config).transport(server.transport.clone());
    if let Some(tools) = tools {
        builder = builder.tools(tools);
    }
    tokio::spawn(builder.connect())
}

/// Connects and completes the handshake, returning the setup frame seen by the server.
async fn ready_session(
    server: &mut Server,
    config: LiveConfig,
    tools: Option<ToolRuntime>,
) -> (LiveClient, mpsc::UnboundedReceiver<LiveEvent>, ServerEnd, Value) {
    let connecting = start(server, config, tools);
    let mut end = server.accept().await;
    let setup = end.next_json().await;
    end.ack().await;
    let (client, events) = connecting.await.unwrap().unwrap();
    (client, events, end, setup)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<LiveEvent>) -> LiveEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no event")
        .expect("event stream ended")
}

#[tokio::test]
async fn handshake_then_text_round_trip() {
    let mut server = Server::new();
    let (client, mut events, mut end, setup) = ready_session(&mut server, config(), None).await;

    assert_eq!(setup["setup"]["model"], json!("models/gemini-2.0-flash-live-001"));
    assert_eq!(setup["setup"]["tools"], json!([{"googleSearch": {}}]));
    assert!(server.transport.urls.lock().unwrap()[0].ends_with("?key=test-key"));
    assert_eq!(next_event(&mut events).await, LiveEvent::Ready { resumed: false });
    assert!(client.is_ready());

    client.send_text("hello").await;
    assert_eq!(
        end.next_json().await,
        json!({"clientContent": {"turns": [{"role": "user", "parts": [{"text": "hello"}]}], "turnComplete": true}})
    );

    end.send(json!({"serverContent": {"modelTurn": {"parts": [{"text": "Hi there"}]}, "turnComplete": true}}))
        .await;
    assert_eq!(next_event(&mut events).await, LiveEvent::Text("Hi there".into()));
    assert_eq!(next_event(&mut events).await, LiveEvent::TurnComplete);
}

#[tokio::test]
async fn unparseable_control_frames_are_skipped() {
    let mut server = Server::new();
    let (_client, mut events, end, _) = ready_session(&mut server, config(), None).await;
    next_event(&mut events).await;

    end.to_client
        .send(TransportEvent::Text("{not json".into()))
        .await
        .unwrap();
    end.send(json!({"error": {"message": "quota"}})).await;
    assert_eq!(next_event(&mut events).await, LiveEvent::Error("quota".into()));
}

#[tokio::test(start_paused = true)]
async fn missing_ack_falls_back_to_soft_ready() {
    let mut server = Server::new();
    let started = tokio::time::Instant::now();
    let connecting = start(&server, config(), None);
    let mut end = server.accept().await;
    end.next_json().await;

    let (client, mut events) = connecting.await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(client.is_ready());
    assert_eq!(next_event(&mut events).await, LiveEvent::Ready { resumed: false });

    client.send_text("anyone there?").await;
    assert!(end.next_json().await.get("clientContent").is_some());
}

#[tokio::test]
async fn invalid_argument_retries_once_without_search_then_fails() {
    let mut server = Server::new();
    let connecting = start(&server, config(), None);

    let mut first = server.accept().await;
    assert_eq!(first.next_json().await["setup"]["tools"], json!([{"googleSearch": {}}]));
    first.close(1007, "Request contains an invalid argument.").await;

    let mut second = server.accept().await;
    assert!(second.next_json().await["setup"].get("tools").is_none());
    second.close(1007, "Request contains an invalid argument.").await;

    let err = connecting.await.unwrap().err().unwrap();
    assert_eq!(
        err,
        LiveError::HandshakeRejected {
            code: 1007,
            reason: "Request contains an invalid argument.".into()
        }
    );
    assert_eq!(server.opens(), 2);
}

#[tokio::test]
async fn reduced_retry_can_succeed() {
    let mut server = Server::new();
    let connecting = start(&server, config(), None);

    let mut first = server.accept().await;
    first.next_json().await;
    first.close(1007, "invalid argument").await;

    let mut second = server.accept().await;
    second.next_json().await;
    second.ack().await;
    let (client, _events) = connecting.await.unwrap().unwrap();
    assert!(client.is_ready());
}

#[tokio::test]
async fn unrelated_rejection_is_not_retried() {
    let mut server = Server::new();
    let connecting = start(&server, config(), None);
    let mut end = server.accept().await;
    end.next_json().await;
    end.close(1008, "").await;

    let err = connecting.await.unwrap().err().unwrap();
    assert!(matches!(err, LiveError::HandshakeRejected { code: 1008, reason } if reason.contains("lacks access")));
    assert_eq!(server.opens(), 1);
}

#[tokio::test]
async fn connection_failure_is_reported_by_connect() {
    let server = Server::new();
    let transport = server.transport.clone();
    drop(server);
    let result = LiveClient::builder(config()).transport(transport).connect().await;
    assert!(matches!(result.err(), Some(LiveError::Connection(_))));
}

#[tokio::test(start_paused = true)]
async fn session_renews_before_ceiling_and_flushes_queued_text() {
    let mut server = Server::new();
    let mut config = config();
    config.timings = SessionTimings {
        session_ceiling: Duration::from_secs(120),
        renewal_margin: Duration::from_secs(60),
        ..SessionTimings::default()
    };
    let (client, mut events, mut first, _) = ready_session(&mut server, config, None).await;
    assert_eq!(next_event(&mut events).await, LiveEvent::Ready { resumed: false });

    let renewing_at = tokio::time::Instant::now();
    let frame = timeout(Duration::from_secs(600), first.from_client.recv()).await.unwrap();
    assert_eq!(frame, Some(OutboundFrame::Close));
    assert!(renewing_at.elapsed() >= Duration::from_secs(60));
    assert!(!client.is_disposed());

    client.send_text("still there?").await;
    let mut second = server.accept().await;
    assert!(second.next_json().await.get("setup").is_some());
    second.ack().await;
    assert_eq!(
        second.next_json().await["clientContent"]["turns"][0]["parts"][0]["text"],
        json!("still there?")
    );
    assert_eq!(next_event(&mut events).await, LiveEvent::Ready { resumed: true });
    assert!(!client.is_disposed());
    assert!(client.is_ready());

    client.send_text("after renewal").await;
    assert!(second.next_json().await.get("clientContent").is_some());
}

#[tokio::test]
async fn go_away_triggers_transparent_renewal() {
    let mut server = Server::new();
    let (client, mut events, mut first, _) = ready_session(&mut server, config(), None).await;
    next_event(&mut events).await;

    first.send(json!({"goAway": {"timeLeft": "5s"}})).await;
    assert_eq!(first.next_frame().await, Some(OutboundFrame::Close));

    let mut second = server.accept().await;
    second.next_json().await;
    second.ack().await;
    assert_eq!(next_event(&mut events).await, LiveEvent::Ready { resumed: true });
    assert!(!client.is_disposed());
}

#[tokio::test]
async fn disconnect_is_idempotent_and_silences_the_session() {
    let mut server = Server::new();
    let (client, mut events, mut end, _) = ready_session(&mut server, config(), None).await;
    next_event(&mut events).await;

    client.disconnect().await;
    client.disconnect().await;
    assert!(client.is_disposed());
    assert!(!client.is_ready());
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(end.next_frame().await, Some(OutboundFrame::Close));

    client.send_text("ignored").await;
    client.send_audio_chunk(&[0; 2048]).await;
    let _ = end
        .to_client
        .send(TransportEvent::Text(
            json!({"serverContent": {"modelTurn": {"parts": [{"text": "late"}]}}}).to_string(),
        ))
        .await;

    assert_eq!(end.next_frame().await, None);
    assert_eq!(next_event(&mut events).await, LiveEvent::Closed);
    assert!(events.recv().await.is_none());
    assert_eq!(server.opens(), 1);
}

#[tokio::test]
async fn disconnect_completes_while_events_are_not_being_read() {
    let mut server = Server::new();
    let (client, mut events, end, _) = ready_session(&mut server, config(), None).await;

    for i in 0..400 {
        end.send(json!({"serverContent": {"modelTurn": {"parts": [{"text": format!("chunk {i}")}]}}}))
            .await;
    }
    timeout(Duration::from_secs(3), client.disconnect())
        .await
        .expect("disconnect blocked on undrained events");
    assert_eq!(client.state(), SessionState::Closed);

    let mut texts = 0;
    while let Some(event) = events.recv().await {
        match event {
            LiveEvent::Text(_) => texts += 1,
            LiveEvent::Ready { .. } => {}
            LiveEvent::Closed => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(texts <= 400);
}

#[tokio::test]
async fn close_after_setup_is_fatal_and_not_retried() {
    let mut server = Server::new();
    let (client, mut events, end, _) = ready_session(&mut server, config(), None).await;
    next_event(&mut events).await;

    end.close(1006, "").await;
    assert_eq!(
        next_event(&mut events).await,
        LiveEvent::Fatal(LiveError::FatalTransport("unexpected disconnect".into()))
    );
    assert_eq!(next_event(&mut events).await, LiveEvent::Closed);
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(server.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_after_soft_ready_is_fatal_and_not_negotiated() {
    let mut server = Server::new();
    let connecting = start(&server, config(), None);
    let mut end = server.accept().await;
    end.next_json().await;
    let (client, mut events) = connecting.await.unwrap().unwrap();
    assert_eq!(next_event(&mut events).await, LiveEvent::Ready { resumed: false });

    end.close(1006, "").await;
    assert_eq!(
        next_event(&mut events).await,
        LiveEvent::Fatal(LiveError::FatalTransport("unexpected disconnect".into()))
    );
    assert_eq!(next_event(&mut events).await, LiveEvent::Closed);
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(server.opens(), 1);
}

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn declarations(&self) -> Result<Vec<FunctionDeclaration>, ToolError> {
        Ok(vec![FunctionDeclaration {
            name: "lookup".into(),
            description: "Looks something up.".into(),
            parameters: Some(json!({"type": "object", "properties": {"key": {"type": "string"}}})),
        }])
    }

    async fn execute(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push(name.to_string());
        match name {
            "lookup" => Ok(json!(format!("value of {}", args["key"].as_str().unwrap_or("?")))),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

struct FixedGate(bool);

#[async_trait]
impl ConfirmationGate for FixedGate {
    async fn confirm(&self, _description: &str) -> bool {
        self.0
    }
}

/// A microphone that only counts how often it is released.
#[derive(Clone, Default)]
struct CountingMic {
    stops: Arc<AtomicUsize>,
    sender: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
}

impl CaptureDevice for CountingMic {
    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<u32, AudioError> {
        *self.sender.lock().unwrap() = Some(sink);
        Ok(16_000)
    }
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
    }
}

#[tokio::test]
async fn fatal_close_releases_the_microphone() {
    let mut server = Server::new();
    let (client, mut events, end, _) = ready_session(&mut server, config(), None).await;
    next_event(&mut events).await;

    let mic = CountingMic::default();
    let _ingest = AudioIngestPipeline::start(
        Box::new(mic.clone()),
        Arc::new(client.clone()),
        IngestSettings::default(),
    )
    .unwrap();

    end.close(1011, "internal error").await;
    assert!(matches!(next_event(&mut events).await, LiveEvent::Fatal(_)));
    assert_eq!(next_event(&mut events).await, LiveEvent::Closed);

    timeout(WAIT, async {
        while mic.stops.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("microphone left open");
    assert_eq!(mic.stops.load(Ordering::SeqCst), 1);
    assert!(!client.is_disposed());
}

#[tokio::test]
async fn tool_round_is_answered_with_one_batched_response_in_order() {
    let mut server = Server::new();
    let executor = Arc::new(RecordingExecutor::default());
    let runtime = ToolRuntime::new(executor.clone(), Arc::new(FixedGate(true)));
    let (_client, mut events, mut end, setup) = ready_session(&mut server, config(), Some(runtime)).await;
    next_event(&mut events).await;

    assert_eq!(setup["setup"]["tools"][0]["functionDeclarations"][0]["name"], json!("lookup"));
    assert_eq!(setup["setup"]["tools"][1], json!({"googleSearch": {}}));

    end.send(json!({"toolCall": {"functionCalls": [
        {"id": "c1", "name": "lookup", "args": {"key": "a"}},
        {"id": "c2", "name": "missing", "args": {}},
        {"id": "c3", "name": "lookup", "args": {"key": "b"}}
    ]}}))
    .await;

    let reply = end.next_json().await;
    let responses = reply["toolResponse"]["functionResponses"].as_array().unwrap();
    assert_eq!(responses.len(), 3);
    assert_eq!(
        responses.iter().map(|r| r["id"].as_str().unwrap()).collect::<Vec<_>>(),
        ["c1", "c2", "c3"]
    );
    assert_eq!(responses[0]["response"], json!({"result": "value of a"}));
    assert_eq!(responses[1]["response"]["success"], json!(false));
    assert_eq!(responses[2]["response"], json!({"result": "value of b"}));
    assert_eq!(*executor.calls.lock().unwrap(), ["lookup", "missing", "lookup"]);
}

#[tokio::test]
async fn declined_dangerous_call_is_answered_without_executing() {
    let mut server = Server::new();
    let executor = Arc::new(RecordingExecutor::default());
    let runtime = ToolRuntime::new(executor.clone(), Arc::new(FixedGate(false)));
    let (_client, mut events, mut end, _) = ready_session(&mut server, config(), Some(runtime)).await;
    next_event(&mut events).await;

    end.send(json!({"serverContent": {"modelTurn": {"parts": [
        {"functionCall": {"name": "delete_file", "args": {"path": "/tmp/x"}}}
    ]}}}))
    .await;

    let reply = end.next_json().await;
    let response = &reply["toolResponse"]["functionResponses"][0];
    assert_eq!(response["name"], json!("delete_file"));
    assert_eq!(response["response"]["success"], json!(false));
    assert!(executor.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn calls_without_local_tools_get_an_error_result() {
    let mut server = Server::new();
    let (_client, mut events, mut end, _) = ready_session(&mut server, config(), None).await;
    next_event(&mut events).await;

    end.send(json!({"toolCall": {"functionCalls": [{"id": "x", "name": "lookup"}]}}))
        .await;
    let reply = end.next_json().await;
    assert_eq!(reply["toolResponse"]["functionResponses"][0]["response"]["success"], json!(false));
}

#[derive(Debug, PartialEq)]
enum DeviceOp {
    Scheduled(usize),
    Cleared,
    Reset,
}

struct RecordingPlayback {
    ops: mpsc::UnboundedSender<DeviceOp>,
    resets: Arc<AtomicUsize>,
}

impl PlaybackDevice for RecordingPlayback {
    fn current_time(&self) -> f64 {
        0.0
    }
    fn schedule(&mut self, buffer: ScheduledBuffer) -> Result<(), AudioError> {
        let _ = self.ops.send(DeviceOp::Scheduled(buffer.samples.len()));
        Ok(())
    }
    fn clear(&mut self) {
        let _ = self.ops.send(DeviceOp::Cleared);
    }
    fn reset(&mut self) -> Result<(), AudioError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        let _ = self.ops.send(DeviceOp::Reset);
        Ok(())
    }
}

#[tokio::test]
async fn model_audio_is_scheduled_and_interruption_clears_it() {
    let mut server = Server::new();
    let (ops_tx, mut ops) = mpsc::unbounded_channel();
    let playback = RecordingPlayback {
        ops: ops_tx,
        resets: Arc::new(AtomicUsize::new(0)),
    };
    let connecting = tokio::spawn(
        LiveClient::builder(config())
            .transport(server.transport.clone())
            .playback(Box::new(playback))
            .connect(),
    );
    let mut end = server.accept().await;
    end.next_json().await;
    end.ack().await;
    let (_client, mut events) = connecting.await.unwrap().unwrap();
    next_event(&mut events).await;

    let encoded = gemini_realtime::audio::encode_pcm16_base64(&[1000; 480]);
    end.send(json!({"serverContent": {"modelTurn": {"parts": [
        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": encoded}}
    ]}}}))
    .await;
    end.to_client
        .send(TransportEvent::Binary(vec![0x10; 241]))
        .await
        .unwrap();
    end.to_client
        .send(TransportEvent::Binary(vec![0x10; 8]))
        .await
        .unwrap();
    end.send(json!({"serverContent": {"interrupted": true}})).await;

    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(timeout(WAIT, ops.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, [DeviceOp::Scheduled(480), DeviceOp::Scheduled(121), DeviceOp::Cleared]);
    assert_eq!(next_event(&mut events).await, LiveEvent::Interrupted);
}

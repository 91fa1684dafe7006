//! Wire frames of the live protocol.
//!
//! Outbound frames are typed serde structs. Inbound JSON is parsed into
//! permissive raw structs and immediately converted into a [`ServerFrame`]
//! variant; the rest of the engine only ever matches on that variant.

use crate::{config::ResponseModality, error::LiveError};
use parley_core::{
    generic_types::{Blob, Citation, Content, FunctionCall, FunctionResponse, Part, ToolSpec},
    llm_client::GroundingMetadata,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// --- Client -> server ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// A complete user turn carrying `text`.
    pub fn user_text(text: impl Into<String>) -> Self {
        ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::user_text(text)],
            turn_complete: true,
        })
    }

    /// One chunk of microphone audio, already PCM16 base64 at the ingest rate.
    pub fn audio(data: String) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: crate::audio::INGEST_MIME_TYPE.to_string(),
                data,
            },
        })
    }

    pub fn tool_response(function_responses: Vec<FunctionResponse>) -> Self {
        ClientMessage::ToolResponse(ToolResponse { function_responses })
    }

    pub fn to_json(&self) -> Result<String, LiveError> {
        serde_json::to_string(self).map_err(|e| LiveError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<WireModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WireModality {
    Text,
    Audio,
}

impl From<ResponseModality> for WireModality {
    fn from(m: ResponseModality) -> Self {
        match m {
            ResponseModality::Text => WireModality::Text,
            ResponseModality::Audio => WireModality::Audio,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

// --- Server -> client ---

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    SetupAck,
    Content(ServerContent),
    ToolCall(Vec<FunctionCall>),
    /// The server will terminate the connection soon.
    GoAway { time_left: Option<String> },
    Error { message: String },
    /// Raw PCM16 bytes delivered as a non-JSON binary frame.
    Audio(Vec<u8>),
    /// Well-formed but carrying nothing the engine acts on (usage metadata, ...).
    Other,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    pub parts: Vec<Part>,
    pub turn_complete: bool,
    pub interrupted: bool,
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
    pub citations: Vec<Citation>,
}

impl ServerContent {
    pub fn text(&self) -> String {
        Content {
            role: None,
            parts: self.parts.clone(),
        }
        .text()
    }

    /// Base64 audio payloads in arrival order.
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::InlineData { inline_data } => Some(inline_data.data.as_str()),
            _ => None,
        })
    }

    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { function_call } => Some(function_call.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Parse failure of an inbound control frame.
#[derive(Debug, thiserror::Error)]
#[error("unparseable server frame: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawServerMessage = serde_json::from_str(text)?;
        Ok(raw.into_frame())
    }

    /// Binary frames carry either JSON or raw PCM; anything that does not
    /// parse as a JSON message is treated as audio.
    pub fn from_binary(bytes: Vec<u8>) -> Self {
        match serde_json::from_slice::<RawServerMessage>(&bytes) {
            Ok(raw) => raw.into_frame(),
            Err(_) => ServerFrame::Audio(bytes),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<RawServerContent>,
    tool_call: Option<RawToolCall>,
    go_away: Option<RawGoAway>,
    error: Option<RawError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    model_turn: Option<RawModelTurn>,
    turn_complete: Option<bool>,
    interrupted: Option<bool>,
    input_transcription: Option<RawTranscription>,
    output_transcription: Option<RawTranscription>,
    grounding_metadata: Option<GroundingMetadata>,
}

/// Grounding metadata may ride on the model turn or on the content itself.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawTranscription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolCall {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGoAway {
    time_left: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    message: Option<String>,
}

impl RawServerMessage {
    fn into_frame(self) -> ServerFrame {
        if let Some(error) = self.error {
            return ServerFrame::Error {
                message: error.message.unwrap_or_else(|| "unknown server error".to_string()),
            };
        }
        if self.setup_complete.is_some() {
            return ServerFrame::SetupAck;
        }
        if let Some(tool_call) = self.tool_call {
            return ServerFrame::ToolCall(tool_call.function_calls);
        }
        if let Some(content) = self.server_content {
            let (parts, turn_grounding) = match content.model_turn {
                Some(turn) => (turn.parts, turn.grounding_metadata),
                None => (Vec::new(), None),
            };
            return ServerFrame::Content(ServerContent {
                parts,
                turn_complete: content.turn_complete.unwrap_or(false),
                interrupted: content.interrupted.unwrap_or(false),
                input_transcription: content.input_transcription.and_then(|t| t.text),
                output_transcription: content.output_transcription.and_then(|t| t.text),
                citations: turn_grounding
                    .or(content.grounding_metadata)
                    .map(|g| g.citations())
                    .unwrap_or_default(),
            });
        }
        if let Some(go_away) = self.go_away {
            return ServerFrame::GoAway {
                time_left: go_away.time_left,
            };
        }
        ServerFrame::Other
    }
}

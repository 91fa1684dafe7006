//! Session setup: the first frame on every connection and the wait for its
//! acknowledgment.

use crate::{
    config::{LiveConfig, ResponseModality},
    protocol::{
        ClientMessage, GenerationConfig, PrebuiltVoiceConfig, Setup, SpeechConfig, VoiceConfig,
    },
};
use parley_core::generic_types::{Content, ToolManifest};
use serde_json::Map;
use std::time::Duration;
use tokio::time::Instant;

/// How a handshake reached readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The server sent `setupComplete`.
    Acknowledged,
    /// The grace window elapsed without an acknowledgment.
    SoftReady,
}

/// Tracks one connection's handshake.
///
/// The soft-ready fallback is a compatibility shim for configurations whose
/// acknowledgment is slow or never arrives; it is not a protocol guarantee.
#[derive(Debug)]
pub struct HandshakeController {
    deadline: Instant,
    acknowledged: bool,
    ready: Option<Readiness>,
}

impl HandshakeController {
    /// Starts the grace window at socket open.
    pub fn start(opened_at: Instant, grace: Duration) -> Self {
        Self {
            deadline: opened_at + grace,
            acknowledged: false,
            ready: None,
        }
    }

    /// The setup frame for `config` offering `manifest`.
    pub fn setup_frame(config: &LiveConfig, manifest: &ToolManifest) -> ClientMessage {
        let speech_config = match (config.response_modality, &config.voice) {
            (ResponseModality::Audio, Some(voice)) => Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.clone(),
                    },
                },
            }),
            _ => None,
        };

        ClientMessage::Setup(Setup {
            model: config.model_path(),
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality.into()],
                speech_config,
            },
            system_instruction: config.system_instruction.clone().map(Content::instruction),
            tools: manifest.to_specs(),
            input_audio_transcription: config.input_transcription.then(Map::new),
            output_audio_transcription: config.output_transcription.then(Map::new),
        })
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether `setupComplete` has been received on this connection.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn readiness(&self) -> Option<Readiness> {
        self.ready
    }

    /// Records the acknowledgment. Returns `true` if this made the session ready.
    pub fn on_ack(&mut self) -> bool {
        self.acknowledged = true;
        if self.ready.is_none() {
            self.ready = Some(Readiness::Acknowledged);
            true
        } else {
            false
        }
    }

    /// Applies the soft-ready fallback. Returns `true` if this made the session ready.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        if self.ready.is_none() && now >= self.deadline {
            self.ready = Some(Readiness::SoftReady);
            true
        } else {
            false
        }
    }
}

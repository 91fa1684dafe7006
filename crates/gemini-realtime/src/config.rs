use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Output modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

/// Everything a live session needs, passed explicitly at construction.
///
/// Nothing is cached between clients: when the key changes, build a new
/// config and a new client.
#[derive(Clone, Debug)]
pub struct LiveConfig {
    pub api_key: SecretString,
    pub endpoint: String,
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub response_modality: ResponseModality,
    /// Offer the built-in search tool (dropped again by capability negotiation).
    pub google_search: bool,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub timings: SessionTimings,
    pub egress: EgressSettings,
}

impl LiveConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: None,
            system_instruction: None,
            response_modality: ResponseModality::Audio,
            google_search: true,
            input_transcription: false,
            output_transcription: false,
            timings: SessionTimings::default(),
            egress: EgressSettings::default(),
        }
    }

    /// Model id in the `models/...` form the setup frame expects.
    pub fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    /// Connection URL including the API key query parameter.
    pub(crate) fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key.expose_secret())
    }
}

/// Connection and session-age timing.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionTimings {
    /// Upper bound on establishing the socket.
    pub connect_timeout: Duration,
    /// After this long without a setup acknowledgment the session is used anyway.
    pub soft_ready_grace: Duration,
    /// Provider-imposed hard limit on one connection's lifetime.
    pub session_ceiling: Duration,
    /// How long before the ceiling the session is renewed.
    pub renewal_margin: Duration,
    /// How often session age is checked.
    pub renewal_check_interval: Duration,
    /// Pause between the soft disconnect and the reconnect.
    pub renewal_pause: Duration,
}

impl SessionTimings {
    /// Age at which a ready session is renewed.
    pub fn renew_after(&self) -> Duration {
        self.session_ceiling.saturating_sub(self.renewal_margin)
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            soft_ready_grace: Duration::from_secs(3),
            session_ceiling: Duration::from_secs(10 * 60),
            renewal_margin: Duration::from_secs(60),
            renewal_check_interval: Duration::from_secs(30),
            renewal_pause: Duration::from_millis(500),
        }
    }
}

/// Playback scheduling and device health parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct EgressSettings {
    /// Sample rate of model audio.
    pub sample_rate: u32,
    /// Minimum distance between "now" on the playback clock and a new start time.
    pub lookahead: Duration,
    /// Idle time after which the playback device is recreated.
    pub silence_reset_after: Duration,
    pub health_check_interval: Duration,
    /// Payloads shorter than this are not audio and are dropped.
    pub min_payload_bytes: usize,
}

impl Default for EgressSettings {
    fn default() -> Self {
        Self {
            sample_rate: crate::audio::EGRESS_SAMPLE_RATE,
            lookahead: Duration::from_millis(50),
            silence_reset_after: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            min_payload_bytes: 64,
        }
    }
}

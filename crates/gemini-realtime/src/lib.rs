//! A duplex streaming client for the Gemini Live API.
//!
//! [`LiveClient`] keeps one long-lived session open: it performs the setup
//! handshake, streams microphone audio in and schedules model audio out,
//! resolves model tool calls through a [`parley_core::ToolRuntime`], and
//! silently renews the connection before the provider's session ceiling.

pub mod audio;
pub mod client;
pub mod config;
mod engine;
pub mod egress;
pub mod error;
pub mod handshake;
pub mod ingest;
pub mod lifecycle;
pub mod negotiate;
pub mod protocol;
pub mod transport;

pub use client::{LiveClient, LiveClientBuilder, LiveEvent, TranscriptSource};
pub use config::{EgressSettings, LiveConfig, ResponseModality, SessionTimings};
pub use egress::{AudioEgressScheduler, PlaybackDevice, ScheduledBuffer};
pub use error::{AudioError, LiveError};
pub use ingest::{AudioIngestPipeline, AudioSink, CaptureDevice, IngestHandle, IngestSettings};
pub use lifecycle::SessionState;
pub use transport::{Connection, OutboundFrame, Transport, TransportEvent, WebSocketTransport};

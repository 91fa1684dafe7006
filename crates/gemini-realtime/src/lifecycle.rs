//! The session state machine and its age-based renewal check.

use std::{fmt, time::Duration};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal session transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub state: SessionState,
    /// Set on entering Ready; cleared when the connection ends.
    pub started_at: Option<Instant>,
    pub last_audio_activity_at: Option<Instant>,
    pub capability_retry_used: bool,
}

/// Owns the one [`Session`] of an engine instance.
///
/// [`transition`](Self::transition) is the only way to change the state.
#[derive(Debug)]
pub struct SessionLifecycleManager {
    session: Session,
    renew_after: Duration,
}

impl SessionLifecycleManager {
    pub fn new(renew_after: Duration) -> Self {
        Self {
            session: Session {
                state: SessionState::Idle,
                started_at: None,
                last_audio_activity_at: None,
                capability_retry_used: false,
            },
            renew_after,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    fn is_legal(from: SessionState, to: SessionState, disposed: bool) -> bool {
        use SessionState::*;
        match (from, to) {
            (Idle, Connecting) => !disposed,
            (Connecting, Handshaking | Closing | Closed) => true,
            (Handshaking, Ready | Closing | Closed) => true,
            (Ready, Closing | Closed) => true,
            (Closing, Closed) => true,
            (Closed, Connecting) => !disposed,
            _ => false,
        }
    }

    /// Moves to `to`; `disposed` forbids starting a new connection.
    pub fn transition(
        &mut self,
        to: SessionState,
        disposed: bool,
        now: Instant,
    ) -> Result<(), IllegalTransition> {
        let from = self.session.state;
        if !Self::is_legal(from, to, disposed) {
            return Err(IllegalTransition { from, to });
        }
        debug!(%from, %to, "Session transition");
        self.session.state = to;
        match to {
            SessionState::Ready => self.session.started_at = Some(now),
            SessionState::Closed => self.session.started_at = None,
            _ => {}
        }
        Ok(())
    }

    /// Consumes the one capability retry. Returns `false` if already used.
    pub fn claim_capability_retry(&mut self) -> bool {
        if self.session.capability_retry_used {
            false
        } else {
            self.session.capability_retry_used = true;
            true
        }
    }

    pub fn capability_retry_available(&self) -> bool {
        !self.session.capability_retry_used
    }

    pub fn record_audio_activity(&mut self, now: Instant) {
        self.session.last_audio_activity_at = Some(now);
    }

    /// Whether a ready session is old enough that it must be renewed.
    pub fn should_renew(&self, now: Instant) -> bool {
        match (self.session.state, self.session.started_at) {
            (SessionState::Ready, Some(started)) => now.duration_since(started) >= self.renew_after,
            _ => false,
        }
    }
}

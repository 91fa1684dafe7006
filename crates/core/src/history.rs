//! Conversation history normalisation.
//!
//! The caller owns the stored conversation; before every request the engine
//! derives a well-formed alternating suffix from it with [`build_history`].

use crate::generic_types::{Content, Role};
use serde::{Deserialize, Serialize};

/// Number of most recent entries sent with each request.
pub const DEFAULT_HISTORY_TURNS: usize = 20;

/// One stored message of the caller's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Builds the request history from stored entries.
///
/// Consecutive entries with the same role are merged with a newline, leading
/// model entries are dropped, a trailing user entry is dropped (the in-flight
/// message is appended separately), and only the last `max_turns` entries are
/// kept. The result always starts with a user entry and alternates roles.
pub fn build_history(entries: &[HistoryEntry], max_turns: usize) -> Vec<Content> {
    let mut merged: Vec<HistoryEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match merged.last_mut() {
            Some(last) if last.role == entry.role => {
                last.text.push('\n');
                last.text.push_str(&entry.text);
            }
            _ => merged.push(entry.clone()),
        }
    }

    let start = merged
        .iter()
        .position(|e| e.role == Role::User)
        .unwrap_or(merged.len());
    let mut window = &merged[start..];

    if window.last().is_some_and(|e| e.role == Role::User) {
        window = &window[..window.len() - 1];
    }

    if window.len() > max_turns {
        window = &window[window.len() - max_turns..];
        if window.first().is_some_and(|e| e.role == Role::Model) {
            window = &window[1..];
        }
    }

    window
        .iter()
        .map(|e| match e.role {
            Role::User => Content::user_text(e.text.clone()),
            Role::Model => Content::model_text(e.text.clone()),
        })
        .collect()
}

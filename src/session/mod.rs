// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Generation sessions
//!
//! A [`GenerationSession`] is one streamed generation: it owns the append-only
//! buffer, the token and character counts, and the guard watching them. Its
//! state only moves forward:
//!
//! ```text
//! Idle -> Streaming -> Completed | Truncated(reason) | Cancelled | Failed(error)
//! ```
//!
//! The [`SessionController`] drives sessions and the agent loop around them.

pub mod controller;
pub mod observer;

pub use controller::{SessionController, SessionHandle, TurnOutcome};
pub use observer::{NoopObserver, SessionObserver};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::GuardConfig;
use crate::error::SessionError;
use crate::guard::{truncate_with_marker, GuardState, GuardStop, GuardVerdict, RepetitionGuard};

/// Reason carried by a truncated session
pub type TruncationReason = GuardStop;

/// Lifecycle state of a generation session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Truncated(TruncationReason),
    Cancelled,
    Failed(String),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Truncated(_) => "truncated",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Streaming)
    }

    fn allows(&self, next: &SessionState) -> bool {
        match (self, next) {
            (SessionState::Idle, SessionState::Streaming) => true,
            (SessionState::Streaming, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Truncated(reason) => write!(f, "truncated ({})", reason),
            SessionState::Failed(error) => write!(f, "failed: {}", error),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One streamed generation
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub id: Uuid,
    state: SessionState,
    buffer: String,
    token_count: usize,
    char_count: usize,
    guard: RepetitionGuard,
    pub started_at: DateTime<Utc>,
}

impl GenerationSession {
    pub fn new(guard: GuardConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            buffer: String::new(),
            token_count: 0,
            char_count: 0,
            guard: RepetitionGuard::new(guard),
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn into_buffer(self) -> String {
        self.buffer
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn char_count(&self) -> usize {
        self.char_count
    }

    pub fn guard_state(&self) -> &GuardState {
        self.guard.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.allows(&next) {
            return Err(SessionError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        tracing::debug!(
            target: "codeloop.session",
            session_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "session transition"
        );
        self.state = next;
        Ok(())
    }

    /// Idle -> Streaming
    pub fn begin(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Streaming {
            return Err(SessionError::AlreadyStreaming);
        }
        self.transition(SessionState::Streaming)
    }

    /// Append a token and consult the guard.
    ///
    /// A `Stop` verdict truncates the buffer to the retained fraction, appends
    /// the truncation marker and moves the session to `Truncated`.
    pub fn push_token(&mut self, token: &str) -> Result<GuardVerdict, SessionError> {
        if !self.is_streaming() {
            return Err(SessionError::NotStreaming);
        }

        self.buffer.push_str(token);
        self.token_count += 1;
        self.char_count += token.chars().count();

        let verdict = self.guard.observe(&self.buffer, self.token_count);
        if let GuardVerdict::Stop(reason) = verdict {
            let retain = self.guard.config().retain_fraction;
            self.buffer = truncate_with_marker(&self.buffer, retain, reason);
            self.char_count = self.buffer.chars().count();
            self.transition(SessionState::Truncated(reason))?;
        }
        Ok(verdict)
    }

    /// Engine signalled end of stream.
    pub fn complete(&mut self) -> Result<(), SessionError> {
        self.require_streaming()?;
        self.transition(SessionState::Completed)
    }

    pub fn cancel(&mut self) -> Result<(), SessionError> {
        self.require_streaming()?;
        self.transition(SessionState::Cancelled)
    }

    /// Engine failure. The partial buffer is kept.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), SessionError> {
        self.require_streaming()?;
        self.transition(SessionState::Failed(error.into()))
    }

    fn require_streaming(&self) -> Result<(), SessionError> {
        if self.is_streaming() {
            Ok(())
        } else {
            Err(SessionError::NotStreaming)
        }
    }
}

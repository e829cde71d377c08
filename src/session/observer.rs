// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Presentation hooks
//!
//! The controller reports what happens during a turn through this trait.
//! Observers only read; nothing they do feeds back into session or memory
//! state.

use uuid::Uuid;

use super::SessionState;
use crate::context::{ContextWindow, ConversationTurn};
use crate::tools::ToolExecutionResult;

/// Receives session events. Every hook defaults to doing nothing.
pub trait SessionObserver: Send + Sync {
    /// A generation moved to a new state
    fn on_state(&self, _session_id: Uuid, _state: &SessionState) {}

    /// A token was accepted into the buffer
    fn on_token(&self, _session_id: Uuid, _token: &str) {}

    /// The assembled context did not fit the budget
    fn on_over_budget(&self, _window: &ContextWindow) {}

    /// A tool call finished
    fn on_tool_result(&self, _result: &ToolExecutionResult) {}

    /// A turn was appended to the conversation
    fn on_turn(&self, _turn: &ConversationTurn) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

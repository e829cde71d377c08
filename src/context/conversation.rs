// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Conversation log types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::{ToolCall, ToolExecutionResult};

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolResult => "tool_result",
        }
    }
}

/// One entry of the append-only conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    /// Calls parsed out of an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Result carried by a tool-result turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolExecutionResult>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut turn = Self::new(Role::Assistant, content.into());
        turn.tool_calls = tool_calls;
        turn
    }

    /// A tool-result turn whose content is the rendered result.
    pub fn tool_result(result: ToolExecutionResult) -> Self {
        let mut turn = Self::new(Role::ToolResult, result.render());
        turn.tool_results.push(result);
        turn
    }

    /// Text of this turn as it appears in an assembled context.
    pub fn render(&self) -> String {
        match self.role {
            Role::User => format!("User: {}\n", self.content),
            Role::Assistant => format!("Assistant: {}\n", self.content),
            Role::ToolResult => format!("{}\n", self.content),
        }
    }
}

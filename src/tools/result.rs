// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::validation::ValidationError;

/// Outcome class of one tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    ValidationError,
    ExecutionError,
    Timeout,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::ValidationError => "validation_error",
            ToolStatus::ExecutionError => "execution_error",
            ToolStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one tool call, appended to history as-is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: String,
    /// Adapter-supplied details; never consulted for control flow
    #[serde(default)]
    pub structured_metadata: BTreeMap<String, Value>,
    pub duration_ms: u64,
    /// Stopped by session cancellation rather than by the adapter
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl ToolExecutionResult {
    fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        status: ToolStatus,
        output: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status,
            output: output.into(),
            structured_metadata: BTreeMap::new(),
            duration_ms: 0,
            cancelled: false,
        }
    }

    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::new(call_id, tool_name, ToolStatus::Success, output)
    }

    pub fn validation_error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: &ValidationError,
    ) -> Self {
        let kind = match error {
            ValidationError::UnknownTool(_) => "unknown_tool",
            ValidationError::Malformed(_) => "malformed",
            ValidationError::MissingParameter(_) => "missing_parameter",
            ValidationError::InvalidType { .. } => "invalid_type",
        };
        Self::new(call_id, tool_name, ToolStatus::ValidationError, error.to_string())
            .with_metadata("error_kind", Value::from(kind))
    }

    pub fn execution_error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(call_id, tool_name, ToolStatus::ExecutionError, message)
    }

    pub fn timeout(call_id: impl Into<String>, tool_name: impl Into<String>, timeout_ms: u64) -> Self {
        Self::new(
            call_id,
            tool_name,
            ToolStatus::Timeout,
            format!("timed out after {} ms", timeout_ms),
        )
        .with_metadata("timeout_ms", Value::from(timeout_ms))
    }

    /// Execution stopped because the session was cancelled.
    pub fn cancelled(call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        let mut result = Self::new(call_id, tool_name, ToolStatus::ExecutionError, "cancelled");
        result.cancelled = true;
        result
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.structured_metadata.insert(key.into(), value);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Text folded into the conversation as a tool-result turn.
    pub fn render(&self) -> String {
        format!(
            "<tool_result name=\"{}\" id=\"{}\" status=\"{}\">\n{}\n</tool_result>",
            self.tool_name, self.call_id, self.status, self.output
        )
    }
}

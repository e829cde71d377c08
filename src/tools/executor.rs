// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Tool execution for one assistant turn
//!
//! Every call parsed from a turn yields exactly one result. Calls run
//! concurrently (exclusive kinds serialize inside the registry) and the
//! results come back in the order the calls appeared in the text.

use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::call::{extract_tool_calls, ParsedCall, ToolCall};
use super::result::ToolExecutionResult;
use super::validation::ValidationError;
use super::{ToolContext, ToolRegistry};

/// Calls and results of one turn, index-aligned
#[derive(Debug, Clone, Default)]
pub struct ToolBatch {
    pub calls: Vec<ParsedCall>,
    pub results: Vec<ToolExecutionResult>,
}

impl ToolBatch {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Well-formed calls, for attaching to the assistant turn
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .filter_map(|parsed| match parsed {
                ParsedCall::Call(call) => Some(call.clone()),
                ParsedCall::Malformed(_) => None,
            })
            .collect()
    }

    pub fn was_cancelled(&self) -> bool {
        self.results.iter().any(ToolExecutionResult::is_cancelled)
    }
}

/// Runs the calls of one turn against a shared registry
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, context: ToolContext, timeout: Duration) -> Self {
        Self {
            registry,
            context,
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extract calls from completed text and execute them.
    pub async fn execute_text(&self, text: &str, cancel: &CancellationToken) -> ToolBatch {
        self.execute_parsed(extract_tool_calls(text), cancel).await
    }

    /// Execute already-parsed calls; results are in call order.
    pub async fn execute_parsed(&self, calls: Vec<ParsedCall>, cancel: &CancellationToken) -> ToolBatch {
        if calls.is_empty() {
            return ToolBatch::default();
        }

        tracing::info!(
            target: "codeloop.tools",
            calls = calls.len(),
            "executing tool calls"
        );

        let pending: Vec<BoxFuture<'_, ToolExecutionResult>> = calls
            .iter()
            .map(|parsed| self.execute_one(parsed, cancel))
            .collect();
        let results = future::join_all(pending).await;

        ToolBatch { calls, results }
    }

    fn execute_one<'a>(
        &'a self,
        parsed: &ParsedCall,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ToolExecutionResult> {
        let call = match parsed {
            ParsedCall::Malformed(bad) => {
                tracing::debug!(
                    target: "codeloop.tools",
                    call_id = %bad.id,
                    reason = %bad.reason,
                    "malformed tool call"
                );
                let err = ValidationError::Malformed(bad.reason.clone());
                let result = ToolExecutionResult::validation_error(
                    &bad.id,
                    parsed.tool_name(),
                    &err,
                )
                .with_metadata("raw", serde_json::Value::from(bad.raw.clone()));
                return future::ready(result).boxed();
            }
            ParsedCall::Call(call) => call,
        };

        match self.registry.validate(call) {
            Ok(validated) => self
                .registry
                .dispatch(validated, self.timeout, &self.context, cancel)
                .boxed(),
            Err(err) => {
                tracing::debug!(
                    target: "codeloop.tools",
                    tool = %call.tool_name,
                    call_id = %call.id,
                    error = %err,
                    "tool call rejected"
                );
                future::ready(ToolExecutionResult::validation_error(&call.id, &call.tool_name, &err))
                    .boxed()
            }
        }
    }
}

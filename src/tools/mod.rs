// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Tool system for codeloop
//!
//! Tools are adapters behind the [`Tool`] trait. The [`ToolRegistry`] owns
//! their definitions, validates parsed calls against them, and dispatches
//! validated calls with a timeout and cooperative cancellation. Tools that
//! declare the same exclusive kind never run at the same time.

pub mod builtin;
pub mod call;
pub mod definition;
pub mod executor;
pub mod result;
pub mod validation;

pub use call::*;
pub use definition::*;
pub use executor::*;
pub use result::*;
pub use validation::*;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, Result};

/// Context provided to tools during execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Directory relative paths resolve against
    pub working_directory: PathBuf,
    /// Conversation the call belongs to
    pub session_id: uuid::Uuid,
}

impl ToolContext {
    pub fn new(working_directory: PathBuf, session_id: uuid::Uuid) -> Self {
        Self {
            working_directory,
            session_id,
        }
    }

    /// Resolve a path argument against the working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            candidate
        } else {
            self.working_directory.join(candidate)
        }
    }
}

/// What an adapter hands back on success
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub metadata: BTreeMap<String, Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Trait for implementing tools
///
/// Adapters must watch `cancel` and return promptly once it fires; the
/// dispatcher aborts them after the grace period otherwise.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition offered to the model
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with validated arguments
    async fn execute(
        &self,
        args: &ValidatedArgs,
        context: &ToolContext,
        cancel: CancellationToken,
    ) -> Result<ToolOutput>;
}

struct RegisteredTool {
    definition: ToolDefinition,
    adapter: Arc<dyn Tool>,
}

/// How a cancelled or timed-out adapter ended
enum Termination {
    Acknowledged,
    Aborted,
}

/// Registry of available tools
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    /// Registration order, used for listings and the prompt catalogue
    order: Vec<String>,
    /// One lock per exclusive kind
    kind_locks: HashMap<String, Arc<Mutex<()>>>,
    cancel_grace: Duration,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            kind_locks: HashMap::new(),
            cancel_grace: Duration::from_millis(2_000),
        }
    }

    /// Create a registry with all built-in tools
    pub fn with_builtins() -> std::result::Result<Self, RegistryError> {
        let mut registry = Self::new();
        builtin::register_all(&mut registry)?;
        Ok(registry)
    }

    /// Time an adapter gets to acknowledge cancellation before it is aborted
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    /// Register a tool. Definitions are captured once and never change.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> std::result::Result<(), RegistryError> {
        let definition = tool.definition();
        definition.check()?;

        if self.tools.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateName(definition.name));
        }

        if let Some(kind) = definition.exclusive_kind() {
            self.kind_locks
                .entry(kind.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
        }

        tracing::debug!(
            target: "codeloop.tools",
            tool = %definition.name,
            exclusive = ?definition.exclusive_kind(),
            "registered tool"
        );

        self.order.push(definition.name.clone());
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                adapter: tool,
            },
        );
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|t| &t.definition)
    }

    /// All definitions, in registration order
    pub fn definitions(&self) -> Vec<&ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.definition(name))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up the call's tool and validate its arguments.
    pub fn validate(&self, call: &ToolCall) -> std::result::Result<ValidatedCall, ValidationError> {
        let definition = self
            .definition(&call.tool_name)
            .ok_or_else(|| ValidationError::UnknownTool(call.tool_name.clone()))?;
        validate(call, definition)
    }

    /// Invoke the adapter for a validated call.
    ///
    /// Never fails: adapter errors, panics, timeouts and cancellation all
    /// come back as a result with the matching status.
    pub async fn dispatch(
        &self,
        call: ValidatedCall,
        timeout: Duration,
        context: &ToolContext,
        cancel: &CancellationToken,
    ) -> ToolExecutionResult {
        let started = Instant::now();
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        let Some(entry) = self.tools.get(&call.tool_name) else {
            let err = ValidationError::UnknownTool(call.tool_name.clone());
            return ToolExecutionResult::validation_error(&call.call_id, &call.tool_name, &err);
        };

        // Exclusive tools of one kind queue here; the timeout starts once
        // the lock is held.
        let _permit = match entry
            .definition
            .exclusive_kind()
            .and_then(|kind| self.kind_locks.get(kind))
        {
            Some(lock) => {
                tokio::select! {
                    guard = lock.clone().lock_owned() => Some(guard),
                    _ = cancel.cancelled() => {
                        return ToolExecutionResult::cancelled(&call.call_id, &call.tool_name)
                            .with_duration_ms(elapsed(started));
                    }
                }
            }
            None => None,
        };

        tracing::debug!(
            target: "codeloop.tools",
            tool = %call.tool_name,
            call_id = %call.call_id,
            timeout_ms = timeout.as_millis() as u64,
            "dispatching tool"
        );

        let call_cancel = cancel.child_token();
        let adapter = entry.adapter.clone();
        let args = call.arguments.clone();
        let task_context = context.clone();
        let task_cancel = call_cancel.clone();
        let mut handle: JoinHandle<Result<ToolOutput>> = tokio::spawn(async move {
            adapter.execute(&args, &task_context, task_cancel).await
        });

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                call_cancel.cancel();
                let termination = self.reap(handle).await;
                with_termination(
                    ToolExecutionResult::cancelled(&call.call_id, &call.tool_name),
                    termination,
                )
            }
            joined = &mut handle => match joined {
                Ok(Ok(output)) => {
                    let mut result =
                        ToolExecutionResult::success(&call.call_id, &call.tool_name, output.text);
                    result.structured_metadata = output.metadata;
                    result
                }
                Ok(Err(err)) => {
                    ToolExecutionResult::execution_error(&call.call_id, &call.tool_name, err.to_string())
                }
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        "tool panicked during execution"
                    } else {
                        "tool task was aborted"
                    };
                    ToolExecutionResult::execution_error(&call.call_id, &call.tool_name, message)
                }
            },
            _ = tokio::time::sleep(timeout) => {
                call_cancel.cancel();
                let termination = self.reap(handle).await;
                tracing::warn!(
                    target: "codeloop.tools",
                    tool = %call.tool_name,
                    call_id = %call.call_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "tool timed out"
                );
                with_termination(
                    ToolExecutionResult::timeout(&call.call_id, &call.tool_name, timeout.as_millis() as u64),
                    termination,
                )
            }
        };

        let mut result = result.with_duration_ms(elapsed(started));
        if !call.warnings.is_empty() {
            result = result.with_metadata("warnings", Value::from(call.warnings.clone()));
        }

        tracing::debug!(
            target: "codeloop.tools",
            tool = %result.tool_name,
            call_id = %result.call_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            "tool finished"
        );

        result
    }

    /// Wait for a cancelled adapter, aborting it after the grace period.
    async fn reap(&self, mut handle: JoinHandle<Result<ToolOutput>>) -> Termination {
        match tokio::time::timeout(self.cancel_grace, &mut handle).await {
            Ok(_) => Termination::Acknowledged,
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                Termination::Aborted
            }
        }
    }

    /// Catalogue of tools rendered for the model prompt.
    pub fn catalogue(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::from(
            "You can call tools. To call one, write exactly:\n\
             <tool_call>\nname(key=value, key2=\"quoted value\")\n</tool_call>\n\
             Available tools:\n",
        );
        for definition in self.definitions() {
            out.push_str(&format!(
                "- {}: {}\n",
                definition.signature(),
                definition.description
            ));
        }
        out
    }
}

fn with_termination(result: ToolExecutionResult, termination: Termination) -> ToolExecutionResult {
    match termination {
        Termination::Acknowledged => result,
        Termination::Aborted => result.with_metadata("aborted", Value::Bool(true)),
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

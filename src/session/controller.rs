// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! The agent loop
//!
//! [`SessionController::start`] runs one user turn: it assembles the context,
//! streams a generation through the guard, executes the tool calls found in
//! the completed text, folds the results into memory, and re-enters
//! generation while auto-continuation allows. Only one turn may be active per
//! controller; a second `start` is rejected rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::observer::{NoopObserver, SessionObserver};
use super::{GenerationSession, SessionState};
use crate::config::{EngineConfig, GuardConfig, SessionConfig, Settings};
use crate::context::{
    CodeIndex, ContextWindow, ConversationTurn, MemoryManager, RetrievedSnippet,
};
use crate::engine::{
    EngineEvent, EngineStream, GenerationRequest, InferenceEngine, StreamTermination,
};
use crate::error::{EngineError, Result, SessionError};
use crate::guard::GuardVerdict;
use crate::tools::{ToolExecutionResult, ToolExecutor};

/// What one call to [`SessionController::start`] produced
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Terminal state of the turn
    pub state: SessionState,
    /// Buffer of the last generation, partial if it failed or was cancelled
    pub text: String,
    /// Number of generations run, including continuations
    pub generations: usize,
    /// Every tool result of the turn, in call order
    pub tool_results: Vec<ToolExecutionResult>,
    /// Some context assembled during the turn exceeded the budget
    pub over_budget: bool,
}

impl TurnOutcome {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            text: String::new(),
            generations: 0,
            tool_results: Vec::new(),
            over_budget: false,
        }
    }
}

/// Shared flag and cancel token of the active turn
#[derive(Debug, Default)]
struct ActiveSlot {
    streaming: AtomicBool,
    cancel: StdMutex<Option<CancellationToken>>,
}

impl ActiveSlot {
    fn claim(self: &Arc<Self>) -> std::result::Result<ActiveTurn, SessionError> {
        if self
            .streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyStreaming);
        }
        let cancel = CancellationToken::new();
        *self.token_slot() = Some(cancel.clone());
        Ok(ActiveTurn {
            slot: self.clone(),
            cancel,
        })
    }

    fn token_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        match self.cancel.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Held for the duration of a turn; releases the slot on drop
struct ActiveTurn {
    slot: Arc<ActiveSlot>,
    cancel: CancellationToken,
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        *self.slot.token_slot() = None;
        self.slot.streaming.store(false, Ordering::Release);
    }
}

/// Cancels or inspects the active turn from another task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    slot: Arc<ActiveSlot>,
}

impl SessionHandle {
    /// Whether a turn is running
    pub fn is_streaming(&self) -> bool {
        self.slot.streaming.load(Ordering::Acquire)
    }

    /// Cancel the active turn: the engine stream and any running tools.
    pub fn cancel(&self) -> std::result::Result<(), SessionError> {
        match self.slot.token_slot().as_ref() {
            Some(token) => {
                tracing::info!(target: "codeloop.session", "cancellation requested");
                token.cancel();
                Ok(())
            }
            None => Err(SessionError::NotStreaming),
        }
    }
}

enum Step {
    Cancelled,
    Event(Option<EngineEvent>),
}

/// Drives generation sessions for one conversation
pub struct SessionController {
    engine: Arc<dyn InferenceEngine>,
    executor: ToolExecutor,
    memory: Mutex<MemoryManager>,
    observer: Arc<dyn SessionObserver>,
    guard: GuardConfig,
    session: SessionConfig,
    engine_config: EngineConfig,
    budget_tokens: usize,
    cancel_grace: Duration,
    retrieval: Option<Arc<CodeIndex>>,
    active: Arc<ActiveSlot>,
}

impl SessionController {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        executor: ToolExecutor,
        memory: MemoryManager,
        settings: &Settings,
    ) -> Self {
        Self {
            engine,
            executor,
            memory: Mutex::new(memory),
            observer: Arc::new(NoopObserver),
            guard: settings.guard.clone(),
            session: settings.session.clone(),
            engine_config: settings.engine.clone(),
            budget_tokens: settings.context.budget_tokens,
            cancel_grace: Duration::from_millis(settings.tools.cancel_grace_ms),
            retrieval: None,
            active: Arc::new(ActiveSlot::default()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_budget(mut self, budget_tokens: usize) -> Self {
        self.budget_tokens = budget_tokens;
        self
    }

    /// Add code matching each prompt to its context.
    pub fn with_retrieval(mut self, index: Arc<CodeIndex>) -> Self {
        self.retrieval = Some(index);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            slot: self.active.clone(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.handle().is_streaming()
    }

    /// Cancel the active turn.
    pub fn cancel(&self) -> std::result::Result<(), SessionError> {
        self.handle().cancel()
    }

    /// Lock the memory manager. Held locks block the next turn.
    pub async fn memory(&self) -> MutexGuard<'_, MemoryManager> {
        self.memory.lock().await
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.memory.lock().await.history().to_vec()
    }

    /// Drop the conversation log and ShortTerm memory.
    pub async fn reset_conversation(&self) -> std::result::Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::AlreadyStreaming);
        }
        self.memory.lock().await.reset_conversation();
        Ok(())
    }

    /// Run one user turn to completion.
    ///
    /// Engine and tool failures are reported in the outcome. `Err` means the
    /// turn could not run at all, e.g. another turn is already streaming.
    pub async fn start(&self, prompt: &str) -> Result<TurnOutcome> {
        let turn = self.active.claim()?;
        let cancel = turn.cancel.clone();

        tracing::info!(
            target: "codeloop.session",
            engine = self.engine.name(),
            prompt_chars = prompt.chars().count(),
            "turn started"
        );

        self.append_turn(ConversationTurn::user(prompt)).await;

        let snippets = self.retrieve(prompt);
        let mut outcome = TurnOutcome::new();
        let mut depth = 0usize;

        loop {
            let window = self
                .memory
                .lock()
                .await
                .current_context_with(&snippets, self.budget_tokens);
            if window.over_budget {
                tracing::warn!(
                    target: "codeloop.session",
                    estimated_tokens = window.estimated_tokens,
                    budget_tokens = window.budget_tokens,
                    "context exceeds budget"
                );
                self.observer.on_over_budget(&window);
                outcome.over_budget = true;
            }
            if window.missing_latest_turn {
                tracing::warn!(
                    target: "codeloop.session",
                    budget_tokens = window.budget_tokens,
                    "latest turn does not fit; not generating"
                );
                if !window.over_budget {
                    self.observer.on_over_budget(&window);
                }
                outcome.over_budget = true;
                outcome.state = SessionState::Failed(format!(
                    "context budget of {} tokens cannot hold the latest turn",
                    window.budget_tokens
                ));
                break;
            }

            let request =
                GenerationRequest::from_config(self.compose_prompt(&window), &self.session, &self.engine_config);
            let session = self.generate(request, &cancel).await;
            outcome.generations += 1;
            let state = session.state().clone();
            outcome.state = state.clone();

            match state {
                SessionState::Completed => {
                    let batch = self.executor.execute_text(session.buffer(), &cancel).await;
                    let calls = batch.tool_calls();
                    let ran_tools = !batch.is_empty();
                    let tools_cancelled = batch.was_cancelled();

                    self.append_turn(ConversationTurn::assistant(session.buffer(), calls))
                        .await;
                    for result in &batch.results {
                        self.observer.on_tool_result(result);
                        self.append_turn(ConversationTurn::tool_result(result.clone()))
                            .await;
                    }
                    outcome.tool_results.extend(batch.results);
                    outcome.text = session.into_buffer();

                    if cancel.is_cancelled() || tools_cancelled {
                        outcome.state = SessionState::Cancelled;
                        break;
                    }
                    if !ran_tools || !self.session.auto_continue || depth >= self.session.max_continuation_depth
                    {
                        break;
                    }
                    depth += 1;
                    tracing::debug!(target: "codeloop.session", depth, "continuing after tool results");
                }
                SessionState::Truncated(_) => {
                    self.append_turn(ConversationTurn::assistant(session.buffer(), Vec::new()))
                        .await;
                    outcome.text = session.into_buffer();
                    break;
                }
                _ => {
                    outcome.text = session.into_buffer();
                    break;
                }
            }
        }

        tracing::info!(
            target: "codeloop.session",
            state = %outcome.state,
            generations = outcome.generations,
            tool_results = outcome.tool_results.len(),
            "turn finished"
        );
        Ok(outcome)
    }

    fn retrieve(&self, prompt: &str) -> Vec<RetrievedSnippet> {
        let Some(index) = &self.retrieval else {
            return Vec::new();
        };
        let snippets = index.context_for_query(prompt);
        tracing::debug!(
            target: "codeloop.session",
            snippets = snippets.len(),
            indexed_chunks = index.len(),
            "retrieved code for prompt"
        );
        snippets
    }

    async fn append_turn(&self, turn: ConversationTurn) {
        self.observer.on_turn(&turn);
        self.memory.lock().await.push_turn(turn);
    }

    /// Tool catalogue followed by the assembled context and the reply cue.
    fn compose_prompt(&self, window: &ContextWindow) -> String {
        let catalogue = self.executor.registry().catalogue();
        let mut prompt = String::with_capacity(catalogue.len() + window.text.len() + 16);
        if !catalogue.is_empty() {
            prompt.push_str(&catalogue);
            prompt.push('\n');
        }
        prompt.push_str(&window.text);
        prompt.push_str("Assistant: ");
        prompt
    }

    /// Stream one generation until it reaches a terminal state.
    async fn generate(&self, request: GenerationRequest, cancel: &CancellationToken) -> GenerationSession {
        let mut session = GenerationSession::new(self.guard.clone());
        if let Err(err) = session.begin() {
            tracing::error!(target: "codeloop.session", error = %err, "fresh session refused to start");
            return session;
        }
        self.observer.on_state(session.id, session.state());

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            started = self.engine.start(request) => Some(started),
        };
        let mut stream = match started {
            None => {
                self.finish(&mut session, SessionState::Cancelled);
                return session;
            }
            Some(Ok(stream)) => stream,
            Some(Err(err)) => {
                tracing::warn!(target: "codeloop.session", error = %err, "engine failed to start");
                self.finish(&mut session, SessionState::Failed(err.to_string()));
                return session;
            }
        };

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                event = stream.next() => Step::Event(event),
            };

            match step {
                Step::Cancelled => {
                    self.stop_stream(stream).await;
                    self.finish(&mut session, SessionState::Cancelled);
                    break;
                }
                Step::Event(Some(EngineEvent::Token(token))) => match session.push_token(&token) {
                    Ok(GuardVerdict::Continue) => self.observer.on_token(session.id, &token),
                    Ok(GuardVerdict::Stop(reason)) => {
                        tracing::info!(
                            target: "codeloop.session",
                            session_id = %session.id,
                            reason = %reason,
                            tokens = session.token_count(),
                            "generation truncated"
                        );
                        self.stop_stream(stream).await;
                        self.observer.on_state(session.id, session.state());
                        break;
                    }
                    Err(err) => {
                        tracing::error!(target: "codeloop.session", error = %err, "token after terminal state");
                        self.stop_stream(stream).await;
                        break;
                    }
                },
                Step::Event(Some(EngineEvent::Done)) => {
                    self.finish(&mut session, SessionState::Completed);
                    break;
                }
                Step::Event(Some(EngineEvent::Failure(err))) => {
                    tracing::warn!(target: "codeloop.session", error = %err, "engine failure");
                    self.finish(&mut session, SessionState::Failed(err.to_string()));
                    break;
                }
                Step::Event(None) => {
                    let err = EngineError::ProcessExited;
                    tracing::warn!(target: "codeloop.session", error = %err, "engine stream ended without done");
                    self.finish(&mut session, SessionState::Failed(err.to_string()));
                    break;
                }
            }
        }

        session
    }

    /// Move a streaming session to a terminal state and notify the observer.
    fn finish(&self, session: &mut GenerationSession, state: SessionState) {
        let moved = match state {
            SessionState::Completed => session.complete(),
            SessionState::Cancelled => session.cancel(),
            SessionState::Failed(error) => session.fail(error),
            other => Err(SessionError::InvalidTransition {
                from: session.state().as_str().to_string(),
                to: other.as_str().to_string(),
            }),
        };
        if let Err(err) = moved {
            tracing::error!(target: "codeloop.session", error = %err, "session transition rejected");
        }
        self.observer.on_state(session.id, session.state());
    }

    async fn stop_stream(&self, stream: EngineStream) {
        if stream.cancel(self.cancel_grace).await == StreamTermination::Aborted {
            tracing::warn!(
                target: "codeloop.session",
                grace_ms = self.cancel_grace.as_millis() as u64,
                "engine did not acknowledge cancellation; aborted"
            );
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Scripted inference engine for testing
//!
//! Each `start` pops the next scripted generation. When the script runs dry
//! the engine streams nothing and reports `Done`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{EngineEvent, EngineStream, GenerationRequest, InferenceEngine};
use crate::error::{EngineError, Result};

/// How a scripted generation ends after its tokens
#[derive(Debug, Clone, PartialEq)]
pub enum MockEnding {
    /// Send `Done`
    Done,
    /// Send `Failure`
    Failure(EngineError),
    /// Wait for cancellation, then acknowledge it
    Hang,
    /// Ignore cancellation entirely; only an abort stops it
    Unresponsive,
}

/// One scripted generation
#[derive(Debug, Clone, PartialEq)]
pub struct MockGeneration {
    pub tokens: Vec<String>,
    pub ending: MockEnding,
    /// Fail `start` itself instead of streaming
    pub start_error: Option<EngineError>,
}

impl MockGeneration {
    /// Stream `tokens` then finish with `Done`.
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ending: MockEnding::Done,
            start_error: None,
        }
    }

    /// Stream `text` in chunks of `chunk_chars` characters.
    pub fn chunked(text: &str, chunk_chars: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let tokens = chars
            .chunks(chunk_chars.max(1))
            .map(|chunk| chunk.iter().collect::<String>());
        Self::tokens(tokens)
    }

    /// A generation that cannot start.
    pub fn start_failure(error: EngineError) -> Self {
        Self {
            tokens: Vec::new(),
            ending: MockEnding::Done,
            start_error: Some(error),
        }
    }

    pub fn ending(mut self, ending: MockEnding) -> Self {
        self.ending = ending;
        self
    }
}

/// Mock engine for testing
#[derive(Clone)]
pub struct MockEngine {
    name: String,
    script: Arc<Mutex<VecDeque<MockGeneration>>>,
    token_delay: Duration,
    recorded_requests: Arc<Mutex<Vec<GenerationRequest>>>,
    cancel_acks: Arc<AtomicUsize>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            token_delay: Duration::ZERO,
            recorded_requests: Arc::new(Mutex::new(Vec::new())),
            cancel_acks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queue a generation
    pub fn with_generation(self, generation: MockGeneration) -> Self {
        self.push(generation);
        self
    }

    /// Queue a generation that streams `text` word by word
    pub fn with_response(self, text: &str) -> Self {
        self.with_generation(MockGeneration::tokens(split_words(text)))
    }

    /// Sleep between tokens
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Queue a generation on a shared engine
    pub fn push(&self, generation: MockGeneration) {
        lock_recover(&self.script).push_back(generation);
    }

    pub fn call_count(&self) -> usize {
        lock_recover(&self.recorded_requests).len()
    }

    pub fn recorded_requests(&self) -> Vec<GenerationRequest> {
        lock_recover(&self.recorded_requests).clone()
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        lock_recover(&self.recorded_requests).last().cloned()
    }

    /// Number of generations that observed a cancellation
    pub fn cancel_acks(&self) -> usize {
        self.cancel_acks.load(Ordering::SeqCst)
    }

    /// Generations still queued
    pub fn remaining(&self) -> usize {
        lock_recover(&self.script).len()
    }
}

/// Split text into word tokens, keeping the separating whitespace attached
fn split_words(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if c.is_whitespace() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[async_trait]
impl InferenceEngine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, request: GenerationRequest) -> Result<EngineStream> {
        lock_recover(&self.recorded_requests).push(request);

        let generation = lock_recover(&self.script)
            .pop_front()
            .unwrap_or_else(|| MockGeneration::tokens(Vec::<String>::new()));

        if let Some(err) = generation.start_error {
            return Err(err.into());
        }

        let delay = self.token_delay;
        let acks = self.cancel_acks.clone();

        Ok(EngineStream::spawn(move |tx, cancel| async move {
            for token in generation.tokens {
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            acks.fetch_add(1, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    acks.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                if tx.send(EngineEvent::Token(token)).await.is_err() {
                    return;
                }
            }

            match generation.ending {
                MockEnding::Done => {
                    let _ = tx.send(EngineEvent::Done).await;
                }
                MockEnding::Failure(err) => {
                    let _ = tx.send(EngineEvent::Failure(err)).await;
                }
                MockEnding::Hang => {
                    cancel.cancelled().await;
                    acks.fetch_add(1, Ordering::SeqCst);
                }
                MockEnding::Unresponsive => {
                    std::future::pending::<()>().await;
                }
            }
        }))
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Inference engine boundary
//!
//! An engine turns a [`GenerationRequest`] into an [`EngineStream`] of
//! [`EngineEvent`]s. The stream ends with exactly one `Done` or `Failure`
//! unless it is cancelled first. Engines run their producer on a spawned
//! task; cancelling the stream signals that task and waits for it to stop.

pub mod bridge;
pub mod mock;

pub use bridge::BridgeEngine;
pub use mock::{MockEnding, MockEngine, MockGeneration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, SessionConfig};
use crate::error::{EngineError, Result};

/// Events buffered between the producer task and the consumer
const EVENT_BUFFER: usize = 64;

/// What the core sends to an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        let session = SessionConfig::default();
        let engine = EngineConfig::default();
        Self::from_config(prompt, &session, &engine)
    }

    /// Request with limits and sampling taken from settings
    pub fn from_config(prompt: impl Into<String>, session: &SessionConfig, engine: &EngineConfig) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: session.max_generation_tokens,
            stop_sequences: session.stop_sequences.clone(),
            temperature: engine.temperature,
            top_p: engine.top_p,
            repetition_penalty: engine.repetition_penalty,
        }
    }
}

/// One item of a generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A chunk of generated text
    Token(String),
    /// End of stream
    Done,
    /// Out-of-band failure; ends the stream
    Failure(EngineError),
}

/// How a cancelled producer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTermination {
    /// The producer observed the cancellation and returned
    Acknowledged,
    /// The producer ignored the grace period and was aborted
    Aborted,
}

/// Receiving side of a generation
pub struct EngineStream {
    events: mpsc::Receiver<EngineEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EngineStream {
    /// Spawn `producer` and return the stream it feeds.
    ///
    /// The producer gets the sending half of the channel and a token that is
    /// cancelled when the consumer gives up on the stream.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<EngineEvent>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(producer(tx, cancel.clone()));
        Self {
            events: rx,
            cancel,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Signal the producer and wait up to `grace` for it to stop.
    pub async fn cancel(mut self, grace: Duration) -> StreamTermination {
        self.cancel.cancel();
        self.events.close();

        let Some(mut task) = self.task.take() else {
            return StreamTermination::Acknowledged;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => StreamTermination::Acknowledged,
            Err(_) => {
                task.abort();
                let _ = task.await;
                tracing::warn!(
                    target: "codeloop.engine",
                    grace_ms = grace.as_millis() as u64,
                    "engine producer ignored cancellation; aborted"
                );
                StreamTermination::Aborted
            }
        }
    }
}

impl Drop for EngineStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// An opaque text generator
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Engine name for logs and display
    fn name(&self) -> &str;

    /// Begin a generation. Errors here mean the engine could not start at all.
    async fn start(&self, request: GenerationRequest) -> Result<EngineStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_delivers_events_in_order() {
        let mut stream = EngineStream::spawn(|tx, _cancel| async move {
            let _ = tx.send(EngineEvent::Token("a".to_string())).await;
            let _ = tx.send(EngineEvent::Token("b".to_string())).await;
            let _ = tx.send(EngineEvent::Done).await;
        });

        assert_eq!(stream.next().await, Some(EngineEvent::Token("a".to_string())));
        assert_eq!(stream.next().await, Some(EngineEvent::Token("b".to_string())));
        assert_eq!(stream.next().await, Some(EngineEvent::Done));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_cancel_is_acknowledged_by_cooperative_producer() {
        let stream = EngineStream::spawn(|_tx, cancel| async move {
            cancel.cancelled().await;
        });
        let termination = stream.cancel(Duration::from_secs(1)).await;
        assert_eq!(termination, StreamTermination::Acknowledged);
    }

    #[tokio::test]
    async fn test_cancel_aborts_stubborn_producer() {
        let stream = EngineStream::spawn(|_tx, _cancel| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let termination = stream.cancel(Duration::from_millis(20)).await;
        assert_eq!(termination, StreamTermination::Aborted);
    }

    #[test]
    fn test_request_from_config() {
        let mut session = SessionConfig::default();
        session.stop_sequences = vec!["</answer>".to_string()];
        session.max_generation_tokens = 64;
        let engine = EngineConfig {
            repetition_penalty: 1.3,
            ..EngineConfig::default()
        };
        let request = GenerationRequest::from_config("hi", &session, &engine);
        assert_eq!(request.max_tokens, 64);
        assert!((request.repetition_penalty - 1.3).abs() < f32::EPSILON);
        assert_eq!(request.stop_sequences, vec!["</answer>".to_string()]);
        assert_eq!(request.prompt, "hi");
    }
}

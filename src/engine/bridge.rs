// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Subprocess inference bridge
//!
//! Drives a long-lived child process that speaks newline-delimited JSON on
//! stdin/stdout. The child announces itself with `{"type":"ready"}`, then
//! answers `load_model`, `generate`, `unload_model` and `exit` commands.
//! A generation streams `{"type":"token"}` lines and ends with
//! `{"type":"done"}` or an error line.
//!
//! The protocol has no in-band cancel, so cancelling a generation kills the
//! child. The next `start` spawns a fresh one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::{EngineEvent, EngineStream, GenerationRequest, InferenceEngine};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Commands written to the bridge, one JSON object per line
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    LoadModel {
        model_path: &'a str,
    },
    Generate {
        prompt: &'a str,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
        repetition_penalty: f32,
        stream: bool,
    },
    UnloadModel,
    Exit,
}

/// Any line the bridge prints. Fields depend on the message type.
#[derive(Debug, Default, Deserialize)]
struct BridgeMessage {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    cached: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

impl BridgeMessage {
    fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("")
    }

    fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("bridge reported {}", self.kind()))
    }

    fn is_error(&self) -> bool {
        self.error.is_some() || self.kind() == "error" || self.kind().ends_with("_error")
    }
}

/// A running bridge child with its pipes
struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    loaded_model: Option<PathBuf>,
}

impl BridgeProcess {
    async fn spawn(config: &EngineConfig) -> std::result::Result<Self, EngineError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Spawn("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("bridge stdout unavailable".to_string()))?;

        let mut process = Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            loaded_model: None,
        };

        let startup = Duration::from_millis(config.startup_timeout_ms);
        match tokio::time::timeout(startup, process.wait_for_ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                process.kill().await;
                return Err(err);
            }
            Err(_) => {
                process.kill().await;
                return Err(EngineError::StartupTimeout(config.startup_timeout_ms));
            }
        }

        tracing::info!(
            target: "codeloop.engine",
            command = %config.command,
            "inference bridge ready"
        );
        Ok(process)
    }

    /// Skip anything printed before the ready line.
    async fn wait_for_ready(&mut self) -> std::result::Result<(), EngineError> {
        loop {
            let line = self.read_line().await?;
            match serde_json::from_str::<BridgeMessage>(&line) {
                Ok(message) if message.kind() == "ready" => return Ok(()),
                Ok(message) if message.is_error() => {
                    return Err(EngineError::Spawn(message.error_message()));
                }
                _ => {
                    tracing::debug!(target: "codeloop.engine", line = %line, "ignoring pre-ready output");
                }
            }
        }
    }

    async fn send(&mut self, command: &BridgeCommand<'_>) -> std::result::Result<(), EngineError> {
        let mut line = serde_json::to_string(command).map_err(|e| EngineError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| EngineError::ProcessExited)?;
        self.stdin.flush().await.map_err(|_| EngineError::ProcessExited)
    }

    async fn read_line(&mut self) -> std::result::Result<String, EngineError> {
        match self.lines.next_line().await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(EngineError::ProcessExited),
            Err(e) => Err(EngineError::Protocol(format!("failed to read bridge output: {}", e))),
        }
    }

    /// Next protocol message. Blank lines are skipped; anything else that is
    /// not JSON breaks the protocol.
    async fn read_message(&mut self) -> std::result::Result<BridgeMessage, EngineError> {
        loop {
            let line = self.read_line().await?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|_| EngineError::Protocol(format!("non-JSON line from bridge: {}", trimmed)));
        }
    }

    async fn load_model(&mut self, path: &Path) -> std::result::Result<(), EngineError> {
        if self.loaded_model.as_deref() == Some(path) {
            return Ok(());
        }
        let model_path = path.to_string_lossy();
        self.send(&BridgeCommand::LoadModel {
            model_path: &model_path,
        })
        .await?;

        let reply = self.read_message().await?;
        if reply.success == Some(true) {
            tracing::info!(
                target: "codeloop.engine",
                model = %path.display(),
                cached = reply.cached.unwrap_or(false),
                "model loaded"
            );
            self.loaded_model = Some(path.to_path_buf());
            Ok(())
        } else {
            Err(EngineError::ModelLoad(reply.error_message()))
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(target: "codeloop.engine", error = %e, "bridge already gone");
        }
    }
}

/// Holds back text that could be the start of a stop sequence
#[derive(Debug, Clone, Default)]
pub struct StopScanner {
    stops: Vec<String>,
    pending: String,
}

/// Result of feeding one chunk to a [`StopScanner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStep {
    /// Text safe to emit
    pub emit: String,
    /// A stop sequence was found; nothing after it may be emitted
    pub stopped: bool,
}

impl StopScanner {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> ScanStep {
        self.pending.push_str(chunk);

        let earliest = self
            .stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()))
            .min();
        if let Some(index) = earliest {
            let emit = self.pending[..index].to_string();
            self.pending.clear();
            return ScanStep { emit, stopped: true };
        }

        let hold = self.held_suffix_start();
        let emit = self.pending[..hold].to_string();
        self.pending.drain(..hold);
        ScanStep { emit, stopped: false }
    }

    /// Release whatever is still held back.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Start of the longest suffix of `pending` that is a proper prefix of
    /// some stop sequence.
    fn held_suffix_start(&self) -> usize {
        self.pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let suffix = &self.pending[i..];
                self.stops
                    .iter()
                    .any(|stop| stop.len() > suffix.len() && stop.starts_with(suffix))
            })
            .unwrap_or(self.pending.len())
    }
}

/// Inference engine backed by the JSON-lines bridge process
pub struct BridgeEngine {
    config: EngineConfig,
    process: Arc<Mutex<Option<BridgeProcess>>>,
    shutdown_grace: Duration,
}

impl BridgeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            process: Arc::new(Mutex::new(None)),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a bridge child is alive (idle or generating)
    pub async fn is_running(&self) -> bool {
        match self.process.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    /// Ask the bridge to drop its model.
    pub async fn unload_model(&self) -> Result<()> {
        let mut slot = self.process.lock().await;
        let Some(process) = slot.as_mut() else {
            return Ok(());
        };
        process.send(&BridgeCommand::UnloadModel).await?;
        let reply = process.read_message().await?;
        process.loaded_model = None;
        if reply.success == Some(false) {
            return Err(EngineError::ModelLoad(reply.error_message()).into());
        }
        Ok(())
    }

    /// Send `exit` and wait for the child; kill it after the grace period.
    pub async fn shutdown(&self) {
        let mut slot = self.process.lock().await;
        let Some(mut process) = slot.take() else {
            return;
        };

        if process.send(&BridgeCommand::Exit).await.is_ok() {
            if let Ok(Ok(status)) = tokio::time::timeout(self.shutdown_grace, process.child.wait()).await {
                tracing::info!(target: "codeloop.engine", status = %status, "inference bridge exited");
                return;
            }
        }
        tracing::warn!(target: "codeloop.engine", "inference bridge did not exit; killing");
        process.kill().await;
    }

    /// Spawn if needed and make sure the configured model is loaded.
    async fn prepare(&self, slot: &mut Option<BridgeProcess>) -> std::result::Result<(), EngineError> {
        if slot.is_none() {
            *slot = Some(BridgeProcess::spawn(&self.config).await?);
        }
        let (Some(process), Some(model)) = (slot.as_mut(), self.config.model_path.as_deref()) else {
            return Ok(());
        };
        if let Err(err) = process.load_model(model).await {
            if err == EngineError::ProcessExited {
                *slot = None;
            }
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceEngine for BridgeEngine {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn start(&self, request: GenerationRequest) -> Result<EngineStream> {
        let mut slot = self
            .process
            .clone()
            .try_lock_owned()
            .map_err(|_| EngineError::Busy)?;

        self.prepare(&mut slot).await?;

        if let Some(process) = slot.as_mut() {
            let sent = process
                .send(&BridgeCommand::Generate {
                    prompt: &request.prompt,
                    max_tokens: request.max_tokens,
                    temperature: request.temperature,
                    top_p: request.top_p,
                    repetition_penalty: request.repetition_penalty,
                    stream: true,
                })
                .await;
            if let Err(err) = sent {
                *slot = None;
                return Err(err.into());
            }
        }

        tracing::debug!(
            target: "codeloop.engine",
            prompt_chars = request.prompt.chars().count(),
            max_tokens = request.max_tokens,
            "generation started"
        );

        let stops = request.stop_sequences;
        Ok(EngineStream::spawn(move |tx, cancel| pump(slot, stops, tx, cancel)))
    }
}

enum Pumped {
    /// Stream finished and the child is ready for the next command
    Idle,
    /// A stop sequence ended the stream early; the rest must be drained
    Stopped,
    /// The child must not be reused
    Broken,
}

/// Forward bridge output to the stream until the generation ends.
async fn pump(
    mut slot: OwnedMutexGuard<Option<BridgeProcess>>,
    stops: Vec<String>,
    tx: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
) {
    let Some(process) = slot.as_mut() else {
        let _ = tx.send(EngineEvent::Failure(EngineError::ProcessExited)).await;
        return;
    };

    let mut scanner = StopScanner::new(&stops);
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(target: "codeloop.engine", "generation cancelled; killing bridge");
            Pumped::Broken
        }
        outcome = forward(process, &mut scanner, &tx) => outcome,
    };

    let outcome = match outcome {
        Pumped::Stopped => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Pumped::Broken,
                drained = drain(process) => drained,
            }
        }
        other => other,
    };

    if let Pumped::Broken = outcome {
        process.kill().await;
        *slot = None;
    }
}

async fn forward(
    process: &mut BridgeProcess,
    scanner: &mut StopScanner,
    tx: &mpsc::Sender<EngineEvent>,
) -> Pumped {
    loop {
        let message = match process.read_message().await {
            Ok(message) => message,
            Err(err) => {
                let _ = tx.send(EngineEvent::Failure(err)).await;
                return Pumped::Broken;
            }
        };

        let kind = message.kind().to_string();
        let chunk = match kind.as_str() {
            "token" => message.token.unwrap_or_default(),
            "complete" => message.text.unwrap_or_default(),
            "done" => {
                let rest = scanner.finish();
                if !rest.is_empty() {
                    let _ = tx.send(EngineEvent::Token(rest)).await;
                }
                let _ = tx.send(EngineEvent::Done).await;
                return Pumped::Idle;
            }
            _ if message.is_error() => {
                let _ = tx
                    .send(EngineEvent::Failure(EngineError::Generation(message.error_message())))
                    .await;
                return Pumped::Idle;
            }
            other => {
                tracing::debug!(target: "codeloop.engine", kind = %other, "ignoring bridge message");
                continue;
            }
        };

        let step = scanner.push(&chunk);
        if !step.emit.is_empty() && tx.send(EngineEvent::Token(step.emit)).await.is_err() {
            return Pumped::Broken;
        }
        if step.stopped {
            let _ = tx.send(EngineEvent::Done).await;
            return Pumped::Stopped;
        }
    }
}

/// Read and discard the remainder of a generation.
async fn drain(process: &mut BridgeProcess) -> Pumped {
    loop {
        match process.read_message().await {
            Ok(message) if message.kind() == "done" || message.is_error() => return Pumped::Idle,
            Ok(_) => continue,
            Err(_) => return Pumped::Broken,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scanner_without_stops_passes_through() {
        let mut scanner = StopScanner::new(&[]);
        assert_eq!(scanner.push("hello").emit, "hello");
        assert_eq!(scanner.finish(), "");
    }

    #[test]
    fn test_scanner_stops_inside_chunk() {
        let mut scanner = StopScanner::new(&stops(&["END"]));
        let step = scanner.push("abcENDxyz");
        assert_eq!(step.emit, "abc");
        assert!(step.stopped);
    }

    #[test]
    fn test_scanner_holds_partial_match_across_chunks() {
        let mut scanner = StopScanner::new(&stops(&["</stop>"]));
        let first = scanner.push("text </st");
        assert_eq!(first.emit, "text ");
        assert!(!first.stopped);

        let second = scanner.push("op> more");
        assert_eq!(second.emit, "");
        assert!(second.stopped);
    }

    #[test]
    fn test_scanner_releases_false_partial() {
        let mut scanner = StopScanner::new(&stops(&["</stop>"]));
        assert_eq!(scanner.push("a </s").emit, "a ");
        let step = scanner.push("pan>");
        assert_eq!(step.emit, "</span>");
        assert!(!step.stopped);
    }

    #[test]
    fn test_scanner_finish_flushes_held_text() {
        let mut scanner = StopScanner::new(&stops(&["###"]));
        assert_eq!(scanner.push("end #").emit, "end ");
        assert_eq!(scanner.finish(), "#");
    }

    #[test]
    fn test_scanner_multibyte_boundaries() {
        let mut scanner = StopScanner::new(&stops(&["éé"]));
        assert_eq!(scanner.push("caféé!").emit, "caf");
    }

    #[test]
    fn test_commands_serialize_as_protocol_lines() {
        let load = serde_json::to_string(&BridgeCommand::LoadModel { model_path: "/m" }).unwrap();
        assert_eq!(load, r#"{"type":"load_model","model_path":"/m"}"#);
        let exit = serde_json::to_string(&BridgeCommand::Exit).unwrap();
        assert_eq!(exit, r#"{"type":"exit"}"#);
        let generate = serde_json::to_value(BridgeCommand::Generate {
            prompt: "p",
            max_tokens: 8,
            temperature: 0.5,
            top_p: 0.9,
            repetition_penalty: 1.25,
            stream: true,
        })
        .unwrap();
        assert_eq!(generate["type"], "generate");
        assert_eq!(generate["repetition_penalty"], 1.25);
        assert_eq!(generate["max_tokens"], 8);
        assert_eq!(generate["stream"], true);
    }

    #[test]
    fn test_error_messages_are_recognized() {
        let message: BridgeMessage =
            serde_json::from_str(r#"{"error":"boom","type":"generation_error"}"#).unwrap();
        assert!(message.is_error());
        assert_eq!(message.error_message(), "boom");

        let token: BridgeMessage = serde_json::from_str(r#"{"token":"x","type":"token"}"#).unwrap();
        assert!(!token.is_error());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::io::Write;
        use tempfile::TempDir;

        /// Write a shell script that plays the bridge side of the protocol.
        fn fake_bridge(dir: &TempDir, body: &str) -> EngineConfig {
            let path = dir.path().join("bridge.sh");
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "{}", body).unwrap();
            EngineConfig {
                command: "sh".to_string(),
                args: vec![path.to_string_lossy().to_string()],
                model_path: None,
                startup_timeout_ms: 5_000,
                ..EngineConfig::default()
            }
        }

        async fn collect(mut stream: EngineStream) -> Vec<EngineEvent> {
            let mut events = Vec::new();
            while let Some(event) = stream.next().await {
                events.push(event);
            }
            events
        }

        #[tokio::test]
        async fn test_bridge_streams_tokens() {
            let dir = TempDir::new().unwrap();
            let config = fake_bridge(
                &dir,
                r#"echo '{"type":"ready"}'
read line
echo '{"type":"token","token":"Hel"}'
echo '{"type":"token","token":"lo"}'
echo '{"type":"done","success":true}'
read line"#,
            );
            let engine = BridgeEngine::new(config);
            let events = collect(engine.start(GenerationRequest::new("hi")).await.unwrap()).await;
            assert_eq!(
                events,
                vec![
                    EngineEvent::Token("Hel".to_string()),
                    EngineEvent::Token("lo".to_string()),
                    EngineEvent::Done,
                ]
            );
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_bridge_non_json_line_is_protocol_failure() {
            let dir = TempDir::new().unwrap();
            let config = fake_bridge(
                &dir,
                r#"echo '{"type":"ready"}'
read line
echo 'Traceback (most recent call last):'"#,
            );
            let engine = BridgeEngine::new(config);
            let events = collect(engine.start(GenerationRequest::new("hi")).await.unwrap()).await;
            assert!(matches!(
                events.last(),
                Some(EngineEvent::Failure(EngineError::Protocol(_)))
            ));
            assert!(!engine.is_running().await);
        }

        #[tokio::test]
        async fn test_bridge_generation_error() {
            let dir = TempDir::new().unwrap();
            let config = fake_bridge(
                &dir,
                r#"echo '{"type":"ready"}'
read line
echo '{"error":"No model loaded. Call load_model first.","type":"model_error"}'
read line"#,
            );
            let engine = BridgeEngine::new(config);
            let events = collect(engine.start(GenerationRequest::new("hi")).await.unwrap()).await;
            assert_eq!(
                events,
                vec![EngineEvent::Failure(EngineError::Generation(
                    "No model loaded. Call load_model first.".to_string()
                ))]
            );
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_bridge_startup_timeout() {
            let dir = TempDir::new().unwrap();
            let mut config = fake_bridge(&dir, "sleep 30");
            config.startup_timeout_ms = 100;
            let engine = BridgeEngine::new(config);
            let err = engine.start(GenerationRequest::new("hi")).await.err().unwrap();
            assert!(err.to_string().contains("did not become ready"));
        }

        #[tokio::test]
        async fn test_bridge_missing_command() {
            let config = EngineConfig {
                command: "/nonexistent/codeloop-bridge".to_string(),
                args: Vec::new(),
                ..EngineConfig::default()
            };
            let engine = BridgeEngine::new(config);
            let err = engine.start(GenerationRequest::new("hi")).await.err().unwrap();
            assert!(err.to_string().contains("Failed to start engine"));
        }

        #[tokio::test]
        async fn test_bridge_cancel_kills_child() {
            let dir = TempDir::new().unwrap();
            let config = fake_bridge(
                &dir,
                r#"echo '{"type":"ready"}'
read line
echo '{"type":"token","token":"a"}'
sleep 30"#,
            );
            let engine = BridgeEngine::new(config);
            let mut stream = engine.start(GenerationRequest::new("hi")).await.unwrap();
            assert_eq!(stream.next().await, Some(EngineEvent::Token("a".to_string())));
            stream.cancel(Duration::from_secs(2)).await;
            assert!(!engine.is_running().await);
        }
    }
}

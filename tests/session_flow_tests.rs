// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use codeloop::config::Settings;
use codeloop::context::{ConversationTurn, MemoryManager, MemoryScope, Role};
use codeloop::engine::{MockEnding, MockEngine, MockGeneration};
use codeloop::error::EngineError;
use codeloop::session::{SessionController, SessionObserver, SessionState};
use codeloop::tools::{
    format_tool_call, SchemaBuilder, Tool, ToolContext, ToolDefinition, ToolExecutionResult,
    ToolExecutor, ToolOutput, ToolRegistry, ToolStatus, ValidatedArgs,
};

/// Search stand-in that sleeps `delay_ms` and tracks overlap
struct SlowSearch {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    finished: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for SlowSearch {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("search", "Slow search").with_parameters(
            SchemaBuilder::new()
                .string("pattern", "Pattern", true)
                .integer("delay_ms", "Delay", true)
                .build(),
        )
    }

    async fn execute(
        &self,
        args: &ValidatedArgs,
        _context: &ToolContext,
        cancel: CancellationToken,
    ) -> codeloop::Result<ToolOutput> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = Duration::from_millis(args.int("delay_ms").unwrap_or(0) as u64);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        let pattern = args.str("pattern").unwrap_or_default().to_string();
        self.finished.lock().unwrap().push(pattern.clone());
        Ok(ToolOutput::text(format!("matches for {}", pattern)))
    }
}

#[derive(Default)]
struct RecordingObserver {
    states: Mutex<Vec<String>>,
    tokens: Mutex<String>,
    results: Mutex<Vec<String>>,
}

impl SessionObserver for RecordingObserver {
    fn on_state(&self, _session_id: uuid::Uuid, state: &SessionState) {
        self.states.lock().unwrap().push(state.as_str().to_string());
    }

    fn on_token(&self, _session_id: uuid::Uuid, token: &str) {
        self.tokens.lock().unwrap().push_str(token);
    }

    fn on_tool_result(&self, result: &ToolExecutionResult) {
        self.results.lock().unwrap().push(result.tool_name.clone());
    }
}

fn build_controller(
    engine: MockEngine,
    registry: ToolRegistry,
    working_directory: &std::path::Path,
    settings: &Settings,
) -> SessionController {
    let context = ToolContext::new(working_directory.to_path_buf(), uuid::Uuid::new_v4());
    let executor = ToolExecutor::new(Arc::new(registry), context, Duration::from_secs(5));
    let memory = MemoryManager::new(&settings.context);
    SessionController::new(Arc::new(engine), executor, memory, settings)
}

#[tokio::test]
async fn test_concurrent_searches_report_in_call_order() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(SlowSearch {
            running: running.clone(),
            peak: peak.clone(),
            finished: finished.clone(),
        }))
        .unwrap();

    let answer = format!(
        "Searching both.\n{}\n{}",
        format_tool_call("search", &[("pattern", "slow"), ("delay_ms", "200")]),
        format_tool_call("search", &[("pattern", "fast"), ("delay_ms", "10")]),
    );
    let engine = MockEngine::new()
        .with_generation(MockGeneration::chunked(&answer, 7))
        .with_response("Both searches done.");

    let temp_dir = TempDir::new().unwrap();
    let controller = build_controller(engine, registry, temp_dir.path(), &Settings::default());
    let outcome = controller.start("find slow and fast").await.unwrap();

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(*finished.lock().unwrap(), vec!["fast", "slow"]);

    let outputs: Vec<&str> = outcome.tool_results.iter().map(|r| r.output.as_str()).collect();
    assert_eq!(outputs, vec!["matches for slow", "matches for fast"]);

    let history = controller.history().await;
    let tool_turns: Vec<&ConversationTurn> =
        history.iter().filter(|t| t.role == Role::ToolResult).collect();
    assert_eq!(tool_turns.len(), 2);
    assert!(tool_turns[0].content.contains("matches for slow"));
    assert!(tool_turns[1].content.contains("matches for fast"));

    let assistant = history.iter().find(|t| t.role == Role::Assistant).unwrap();
    assert_eq!(assistant.tool_calls.len(), 2);
    assert_eq!(assistant.tool_calls[0].argument("pattern"), Some("slow"));
}

#[tokio::test]
async fn test_builtin_tools_write_then_read() {
    let temp_dir = TempDir::new().unwrap();
    let write = format_tool_call(
        "file_write",
        &[("path", "notes.txt"), ("content", "remember the milk")],
    );
    let read = format_tool_call("file_read", &[("path", "notes.txt")]);
    let engine = MockEngine::new()
        .with_response(&write)
        .with_response(&read)
        .with_response("The note says to remember the milk.");

    let mut settings = Settings::default();
    settings.session.max_continuation_depth = 2;
    let controller = build_controller(
        engine,
        ToolRegistry::with_builtins().unwrap(),
        temp_dir.path(),
        &settings,
    );

    let outcome = controller.start("save and read a note").await.unwrap();
    assert_eq!(outcome.generations, 3);
    assert_eq!(outcome.tool_results.len(), 2);
    assert!(outcome.tool_results.iter().all(|r| r.status == ToolStatus::Success));
    assert!(outcome.tool_results[1].output.contains("remember the milk"));
    assert_eq!(outcome.text, "The note says to remember the milk.");
    assert!(temp_dir.path().join("notes.txt").exists());
}

#[tokio::test]
async fn test_unknown_tool_continues_generation() {
    let engine = MockEngine::new()
        .with_response("<tool_call>\nmake_coffee(type=espresso)\n</tool_call>")
        .with_response("I cannot make coffee.");
    let temp_dir = TempDir::new().unwrap();
    let controller = build_controller(
        engine,
        ToolRegistry::with_builtins().unwrap(),
        temp_dir.path(),
        &Settings::default(),
    );

    let outcome = controller.start("coffee please").await.unwrap();
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.text, "I cannot make coffee.");
    assert_eq!(outcome.tool_results[0].status, ToolStatus::ValidationError);
    assert_eq!(
        outcome.tool_results[0].structured_metadata["error_kind"],
        serde_json::json!("unknown_tool")
    );
}

#[tokio::test]
async fn test_malformed_call_still_yields_one_result() {
    let engine = MockEngine::new().with_response("<tool_call>\nsearch(pattern=a, pattern=b)\n</tool_call>");
    let temp_dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.session.auto_continue = false;
    let controller = build_controller(
        engine,
        ToolRegistry::with_builtins().unwrap(),
        temp_dir.path(),
        &settings,
    );

    let outcome = controller.start("search twice").await.unwrap();
    assert_eq!(outcome.tool_results.len(), 1);
    assert!(outcome.tool_results[0].output.contains("duplicate argument"));

    let history = controller.history().await;
    let assistant = history.iter().find(|t| t.role == Role::Assistant).unwrap();
    assert!(assistant.tool_calls.is_empty());
}

#[tokio::test]
async fn test_cancel_during_tool_execution() {
    let running = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(SlowSearch {
            running: running.clone(),
            peak: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(Mutex::new(Vec::new())),
        }))
        .unwrap();

    let engine = MockEngine::new()
        .with_response(&format_tool_call("search", &[("pattern", "x"), ("delay_ms", "60000")]));
    let temp_dir = TempDir::new().unwrap();
    let controller = Arc::new(build_controller(
        engine,
        registry,
        temp_dir.path(),
        &Settings::default(),
    ));

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start("slow").await })
    };
    while running.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    controller.cancel().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, SessionState::Cancelled);
    assert_eq!(outcome.tool_results.len(), 1);
    assert!(outcome.tool_results[0].is_cancelled());
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_stops_streaming_engine() {
    let engine = MockEngine::new()
        .with_generation(MockGeneration::tokens(["Let me think"]).ending(MockEnding::Hang));
    let temp_dir = TempDir::new().unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let controller = Arc::new(
        build_controller(
            engine.clone(),
            ToolRegistry::new(),
            temp_dir.path(),
            &Settings::default(),
        )
        .with_observer(observer.clone()),
    );

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start("think").await })
    };
    while observer.tokens.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    controller.cancel().unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.state, SessionState::Cancelled);
    assert_eq!(outcome.text, "Let me think");
    assert_eq!(engine.cancel_acks(), 1);
    assert_eq!(
        *observer.states.lock().unwrap(),
        vec!["streaming".to_string(), "cancelled".to_string()]
    );

    let roles: Vec<Role> = controller.history().await.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User]);
}

#[tokio::test]
async fn test_unresponsive_engine_is_aborted_after_grace() {
    let engine = MockEngine::new()
        .with_generation(MockGeneration::tokens(["stuck"]).ending(MockEnding::Unresponsive));
    let mut settings = Settings::default();
    settings.tools.cancel_grace_ms = 50;
    let temp_dir = TempDir::new().unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let controller = Arc::new(
        build_controller(engine, ToolRegistry::new(), temp_dir.path(), &settings)
            .with_observer(observer.clone()),
    );

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start("hang").await })
    };
    while observer.tokens.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    controller.handle().cancel().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, SessionState::Cancelled);
}

#[tokio::test]
async fn test_engine_failure_preserves_history_and_allows_retry() {
    let engine = MockEngine::new()
        .with_generation(
            MockGeneration::tokens(["half an ", "answer"])
                .ending(MockEnding::Failure(EngineError::Generation("out of memory".into()))),
        )
        .with_response("A full answer.");
    let temp_dir = TempDir::new().unwrap();
    let controller = build_controller(
        engine,
        ToolRegistry::new(),
        temp_dir.path(),
        &Settings::default(),
    );

    let failed = controller.start("question").await.unwrap();
    assert!(matches!(failed.state, SessionState::Failed(ref e) if e.contains("out of memory")));
    assert_eq!(failed.text, "half an answer");

    let retried = controller.start("question").await.unwrap();
    assert_eq!(retried.state, SessionState::Completed);

    let roles: Vec<Role> = controller.history().await.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
}

#[tokio::test]
async fn test_stream_without_done_is_a_failure() {
    let engine = MockEngine::new()
        .with_generation(MockGeneration::tokens(["cut"]).ending(MockEnding::Failure(EngineError::ProcessExited)));
    let temp_dir = TempDir::new().unwrap();
    let controller = build_controller(engine, ToolRegistry::new(), temp_dir.path(), &Settings::default());

    let outcome = controller.start("x").await.unwrap();
    assert!(matches!(outcome.state, SessionState::Failed(_)));
}

#[tokio::test]
async fn test_important_memory_reaches_the_prompt() {
    let engine = MockEngine::new().with_response("ok");
    let temp_dir = TempDir::new().unwrap();
    let controller = build_controller(
        engine.clone(),
        ToolRegistry::new(),
        temp_dir.path(),
        &Settings::default(),
    );
    controller
        .memory()
        .await
        .record("style", "answer in one sentence", MemoryScope::Important)
        .unwrap();

    controller.start("hello").await.unwrap();
    let prompt = engine.last_request().unwrap().prompt;
    assert!(prompt.contains("[memory:style] answer in one sentence"));
    assert!(!prompt.contains("<tool_call>"));
}

#[tokio::test]
async fn test_prompt_beyond_budget_fails_before_generation() {
    let engine = MockEngine::new().with_response("ok");
    let temp_dir = TempDir::new().unwrap();
    let controller = build_controller(
        engine.clone(),
        ToolRegistry::new(),
        temp_dir.path(),
        &Settings::default(),
    )
    .with_budget(2);

    let outcome = controller.start("a prompt that is far longer than two tokens").await.unwrap();
    assert!(outcome.over_budget);
    assert!(matches!(outcome.state, SessionState::Failed(ref e) if e.contains("latest turn")));
    assert_eq!(outcome.generations, 0);
    assert_eq!(engine.call_count(), 0);

    // The turn is kept, so a larger budget can answer it later.
    let history = controller.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
}

#[tokio::test]
async fn test_oversized_important_memory_crowds_out_the_turn() {
    let engine = MockEngine::new().with_response("ok");
    let temp_dir = TempDir::new().unwrap();
    let controller = build_controller(
        engine.clone(),
        ToolRegistry::new(),
        temp_dir.path(),
        &Settings::default(),
    )
    .with_budget(10);
    controller
        .memory()
        .await
        .record("rules", "r".repeat(400), MemoryScope::Important)
        .unwrap();

    let outcome = controller.start("hi").await.unwrap();
    assert!(outcome.over_budget);
    assert_eq!(
        outcome.state,
        SessionState::Failed("context budget of 10 tokens cannot hold the latest turn".to_string())
    );
    assert_eq!(engine.call_count(), 0);
}

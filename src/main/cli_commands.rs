// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codeloop::cli::{
    AskArgs, MemoryArgs, MemoryCommands, RetrieveArgs, SettingsArgs, SettingsCommands,
};
use codeloop::config::{RetrievalConfig, Settings};
use codeloop::context::{CodeIndex, MemoryDb, MemoryManager, MemoryScope, RetrievedSnippet};
use codeloop::engine::BridgeEngine;
use codeloop::error::{CodeloopError, Result};
use codeloop::session::{SessionController, SessionObserver, SessionState};
use codeloop::tools::{ToolContext, ToolExecutionResult, ToolExecutor, ToolRegistry, ToolStatus};

/// Streams tokens to stdout and status lines to stderr
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_token(&self, _session_id: uuid::Uuid, token: &str) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(token.as_bytes());
        let _ = stdout.flush();
    }

    fn on_state(&self, _session_id: uuid::Uuid, state: &SessionState) {
        match state {
            SessionState::Truncated(reason) => eprintln!("\n[{}]", reason.notice()),
            SessionState::Failed(error) => eprintln!("\n[generation failed: {}]", error),
            SessionState::Cancelled => eprintln!("\n[cancelled]"),
            SessionState::Completed => println!(),
            _ => {}
        }
    }

    fn on_tool_result(&self, result: &ToolExecutionResult) {
        eprintln!("{}", format_tool_result(result));
    }

    fn on_over_budget(&self, window: &codeloop::context::ContextWindow) {
        if window.missing_latest_turn {
            eprintln!(
                "[context budget of {} tokens cannot hold the prompt; raise --budget]",
                window.budget_tokens
            );
            return;
        }
        eprintln!(
            "[warning: context uses ~{} tokens, budget is {}]",
            window.estimated_tokens, window.budget_tokens
        );
    }
}

fn format_tool_result(result: &ToolExecutionResult) -> String {
    let marker = match result.status {
        ToolStatus::Success => "ok",
        ToolStatus::ValidationError => "invalid",
        ToolStatus::ExecutionError => "failed",
        ToolStatus::Timeout => "timeout",
    };
    let first_line = result.output.lines().next().unwrap_or("");
    format!(
        "[tool {} {} in {} ms] {}",
        result.tool_name, marker, result.duration_ms, first_line
    )
}

fn working_directory(directory: Option<PathBuf>, settings: &Settings) -> Result<PathBuf> {
    match directory.or_else(|| settings.tools.working_directory.clone()) {
        Some(dir) => Ok(dir),
        None => Ok(std::env::current_dir()?),
    }
}

/// Index `root` on the blocking pool.
async fn build_index(root: PathBuf, config: RetrievalConfig) -> Result<CodeIndex> {
    tokio::task::spawn_blocking(move || -> Result<CodeIndex> {
        let mut index = CodeIndex::new(root, config);
        let stats = index.index_directory()?;
        tracing::debug!(
            target: "codeloop.context",
            files = stats.files_indexed,
            chunks = stats.chunks,
            "code index ready"
        );
        Ok(index)
    })
    .await
    .map_err(|e| CodeloopError::Context(format!("Indexing task failed: {}", e)))?
}

pub(super) async fn run_ask(
    args: AskArgs,
    mut settings: Settings,
    directory: Option<PathBuf>,
) -> Result<()> {
    if let Some(model) = args.model {
        settings.engine.model_path = Some(model);
    }
    if args.no_continue {
        settings.session.auto_continue = false;
    }
    if let Some(budget) = args.budget {
        settings.context.budget_tokens = budget;
    }
    settings.validate()?;

    let working_directory = working_directory(directory, &settings)?;
    let index = if args.retrieve || settings.retrieval.enabled {
        Some(build_index(working_directory.clone(), settings.retrieval.clone()).await?)
    } else {
        None
    };

    let registry = ToolRegistry::with_builtins()?
        .with_cancel_grace(Duration::from_millis(settings.tools.cancel_grace_ms));
    let tool_context = ToolContext::new(working_directory, uuid::Uuid::new_v4());
    let executor = ToolExecutor::new(
        Arc::new(registry),
        tool_context,
        Duration::from_millis(settings.tools.default_timeout_ms),
    );

    let db = MemoryDb::open(settings.memory_db_path())?;
    let memory = MemoryManager::with_db(&settings.context, db)?;

    let engine = Arc::new(BridgeEngine::new(settings.engine.clone()));
    let mut controller = SessionController::new(engine.clone(), executor, memory, &settings)
        .with_observer(Arc::new(ConsoleObserver));
    if let Some(index) = index {
        controller = controller.with_retrieval(Arc::new(index));
    }

    let handle = controller.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = handle.cancel();
        }
    });

    let outcome = controller.start(&args.prompt).await;
    interrupt.abort();
    engine.shutdown().await;

    let outcome = outcome?;
    match outcome.state {
        // Nothing was generated: the context could not be assembled.
        SessionState::Failed(error) if outcome.generations == 0 => {
            Err(CodeloopError::Context(error))
        }
        SessionState::Failed(error) => Err(CodeloopError::Engine(
            codeloop::error::EngineError::Generation(error),
        )),
        _ => Ok(()),
    }
}

pub(super) async fn run_retrieve(
    args: RetrieveArgs,
    settings: Settings,
    directory: Option<PathBuf>,
) -> Result<()> {
    let root = working_directory(directory, &settings)?;
    let limit = args.limit.unwrap_or(settings.retrieval.max_results);
    let index = build_index(root, settings.retrieval).await?;
    let hits = index.search(&args.query, limit);
    if hits.is_empty() {
        eprintln!(
            "No matches in {} chunks from {} files",
            index.len(),
            index.unique_files()
        );
        return Ok(());
    }
    print!("{}", format_hits(&hits));
    Ok(())
}

fn format_hits(hits: &[RetrievedSnippet]) -> String {
    let mut out = String::new();
    for hit in hits {
        out.push_str(&format!("score {:.3} ", hit.score));
        out.push_str(&hit.render());
        out.push('\n');
    }
    out
}

pub(super) fn run_memory_command(args: MemoryArgs, settings: &Settings) -> Result<()> {
    let db = MemoryDb::open(settings.memory_db_path())?;
    let mut memory = MemoryManager::with_db(&settings.context, db)?;
    print!("{}", apply_memory_command(args.command, &mut memory)?);
    Ok(())
}

fn apply_memory_command(
    command: Option<MemoryCommands>,
    memory: &mut MemoryManager,
) -> Result<String> {
    match command {
        None | Some(MemoryCommands::List) => {
            let mut entries: Vec<_> = memory.entries().collect();
            entries.sort_by_key(|e| e.sequence);
            Ok(entries
                .iter()
                .map(|e| format!("{:<9} {}", e.scope.as_str(), e.render()))
                .collect())
        }
        Some(MemoryCommands::Set {
            key,
            value,
            important,
        }) => {
            let scope = if important {
                MemoryScope::Important
            } else {
                MemoryScope::LongTerm
            };
            memory.record(&key, value, scope)?;
            Ok(format!("Stored {} ({})\n", key, scope.as_str()))
        }
        Some(MemoryCommands::Forget { key }) => {
            if memory.forget(&key)? {
                Ok(format!("Forgot {}\n", key))
            } else {
                Err(CodeloopError::InvalidInput(format!("No memory entry named {}", key)))
            }
        }
    }
}

pub(super) fn run_tools() -> Result<()> {
    let registry = ToolRegistry::with_builtins()?;
    println!("{}", registry.catalogue());
    for definition in registry.definitions() {
        if let Some(kind) = definition.exclusive_kind() {
            println!("{} runs exclusively ({})", definition.name, kind);
        }
    }
    Ok(())
}

pub(super) fn run_settings_command(args: SettingsArgs, path: &Path) -> Result<()> {
    match args.command {
        None | Some(SettingsCommands::Show) => {
            let settings = Settings::load_from(path)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Some(SettingsCommands::Path) => {
            println!("{}", path.display());
        }
        Some(SettingsCommands::Init { force }) => {
            if path.exists() && !force {
                return Err(CodeloopError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            Settings::default().save_to(path)?;
            println!("Wrote default settings to {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeloop::config::ContextConfig;
    use tempfile::TempDir;

    #[test]
    fn test_format_tool_result_uses_first_line() {
        let result = ToolExecutionResult::success("call_1", "search", "Found 2 matches\nsrc/a.rs:1: x")
            .with_duration_ms(12);
        assert_eq!(
            format_tool_result(&result),
            "[tool search ok in 12 ms] Found 2 matches"
        );
    }

    fn open_memory(path: &Path) -> MemoryManager {
        let config = ContextConfig {
            memory_db: Some(path.to_path_buf()),
            ..ContextConfig::default()
        };
        MemoryManager::with_db(&config, MemoryDb::open(path).unwrap()).unwrap()
    }

    #[test]
    fn test_memory_commands_persist_between_runs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("memory.db");

        let mut memory = open_memory(&path);
        let set = |key: &str, value: &str, important| {
            Some(MemoryCommands::Set {
                key: key.to_string(),
                value: value.to_string(),
                important,
            })
        };
        assert_eq!(
            apply_memory_command(set("style", "tabs", false), &mut memory).unwrap(),
            "Stored style (long_term)\n"
        );
        apply_memory_command(set("goal", "ship it", true), &mut memory).unwrap();
        drop(memory);

        let mut memory = open_memory(&path);
        let listing = apply_memory_command(None, &mut memory).unwrap();
        assert!(listing.contains("[memory:style] tabs"));
        assert!(listing.contains("important"));
        assert!(listing.contains("[memory:goal] ship it"));

        let forget = |key: &str| Some(MemoryCommands::Forget { key: key.to_string() });
        apply_memory_command(forget("style"), &mut memory).unwrap();
        assert!(apply_memory_command(forget("style"), &mut memory).is_err());
        drop(memory);

        let mut memory = open_memory(&path);
        let listing = apply_memory_command(Some(MemoryCommands::List), &mut memory).unwrap();
        assert!(!listing.contains("style"));
        assert!(listing.contains("goal"));
    }

    #[tokio::test]
    async fn test_build_index_and_format_hits() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("lib.rs"), "pub fn tokenize_input() {}\n").unwrap();

        let index = build_index(temp_dir.path().to_path_buf(), RetrievalConfig::default())
            .await
            .unwrap();
        let hits = index.search("tokenize", 3);
        assert_eq!(hits.len(), 1);
        let text = format_hits(&hits);
        assert!(text.starts_with("score "));
        assert!(text.contains("[code:lib.rs 1/1]"));
        assert!(text.contains("pub fn tokenize_input() {}"));

        assert!(build_index(temp_dir.path().join("missing"), RetrievalConfig::default())
            .await
            .is_err());
    }

    #[test]
    fn test_settings_init_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        let init = |force| SettingsArgs {
            command: Some(SettingsCommands::Init { force }),
        };

        run_settings_command(init(false), &path).unwrap();
        assert!(path.exists());
        assert!(run_settings_command(init(false), &path).is_err());
        run_settings_command(init(true), &path).unwrap();
    }
}

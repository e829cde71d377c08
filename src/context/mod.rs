// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Context and memory management
//!
//! The [`MemoryManager`] owns scoped memory entries and the conversation
//! log, and assembles a token-budgeted context for the next prompt.
//!
//! Assembly takes units in priority order:
//!
//! 1. Important memory entries
//! 2. The most recent tool-result turns, up to a cap
//! 3. Remaining conversation turns, newest first
//! 4. Retrieved code snippets, best match first
//! 5. Other memory entries, most recently touched first
//!
//! and stops at the first unit that does not fit. Only an Important entry
//! may be kept when it alone exceeds the budget. Selected units are then
//! laid out chronologically: memory first, then code, then turns in log
//! order.

pub mod conversation;
pub mod index;
pub mod memory;
pub mod store;
pub mod token;

pub use conversation::{ConversationTurn, Role};
pub use index::{split_into_chunks, CodeIndex, IndexStats, RetrievedSnippet};
pub use memory::{MemoryEntry, MemoryScope, MemoryTable};
pub use store::MemoryDb;
pub use token::estimate_tokens;

use serde::Serialize;

use crate::config::ContextConfig;
use crate::error::Result;

/// Result of one context assembly
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextWindow {
    pub text: String,
    pub estimated_tokens: usize,
    pub budget_tokens: usize,
    /// Set when an Important entry alone exceeded the budget
    pub over_budget: bool,
    /// Set when the newest conversation turn could not be included
    pub missing_latest_turn: bool,
    pub included_entries: usize,
    pub included_snippets: usize,
    pub included_turns: usize,
    /// Units left out because the budget ran out
    pub omitted_units: usize,
}

#[derive(Debug, Clone, Copy)]
enum Unit<'a> {
    Entry(&'a MemoryEntry),
    Snippet(usize),
    Turn(usize),
}

/// Owner of memory entries and the conversation log
pub struct MemoryManager {
    table: MemoryTable,
    history: Vec<ConversationTurn>,
    tool_result_cap: usize,
    db: Option<MemoryDb>,
}

impl MemoryManager {
    /// In-memory manager without persistence
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            table: MemoryTable::new(config.max_memory_entries),
            history: Vec::new(),
            tool_result_cap: config.tool_result_cap,
            db: None,
        }
    }

    /// Manager backed by a database; persisted entries are loaded now.
    pub fn with_db(config: &ContextConfig, db: MemoryDb) -> Result<Self> {
        let mut manager = Self::new(config);
        let loaded = db.load_all()?;
        tracing::debug!(
            target: "codeloop.context",
            entries = loaded.len(),
            "loaded persistent memory"
        );
        for entry in loaded {
            manager.table.restore(entry);
        }
        manager.db = Some(db);
        Ok(manager)
    }

    /// Insert or update a memory entry.
    pub fn record(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        scope: MemoryScope,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let previous_scope = self.table.get(&key).map(|e| e.scope);
        let evicted = self.table.record(&key, &value, scope);

        for victim in &evicted {
            tracing::debug!(
                target: "codeloop.context",
                key = %victim.key,
                scope = victim.scope.as_str(),
                "evicted memory entry"
            );
        }

        if let Some(db) = &self.db {
            for victim in &evicted {
                db.delete(&victim.key)?;
            }
            if let Some(entry) = self.table.get(&key) {
                if entry.scope.is_persistent() {
                    db.save(entry)?;
                } else if previous_scope.is_some_and(|s| s.is_persistent()) {
                    db.delete(&key)?;
                }
            }
        }
        Ok(())
    }

    /// Remove an entry by key. Returns whether it existed.
    pub fn forget(&mut self, key: &str) -> Result<bool> {
        let removed = self.table.remove(key).is_some();
        if let Some(db) = &self.db {
            db.delete(key)?;
        }
        Ok(removed)
    }

    pub fn entry(&self, key: &str) -> Option<&MemoryEntry> {
        self.table.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.table.iter()
    }

    /// Append a turn to the conversation log
    pub fn push_turn(&mut self, turn: ConversationTurn) {
        tracing::trace!(
            target: "codeloop.context",
            role = turn.role.as_str(),
            chars = turn.content.len(),
            "appended turn"
        );
        self.history.push(turn);
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Start a new conversation: ShortTerm entries and the log are dropped.
    pub fn reset_conversation(&mut self) {
        let dropped = self.table.clear_scope(MemoryScope::ShortTerm);
        tracing::debug!(
            target: "codeloop.context",
            dropped_entries = dropped,
            dropped_turns = self.history.len(),
            "conversation reset"
        );
        self.history.clear();
    }

    /// Context for the current log
    pub fn current_context(&self, budget_tokens: usize) -> ContextWindow {
        self.build_context(&self.history, budget_tokens)
    }

    /// Context for the current log plus retrieved code
    pub fn current_context_with(
        &self,
        snippets: &[RetrievedSnippet],
        budget_tokens: usize,
    ) -> ContextWindow {
        self.build_context_with(&self.history, snippets, budget_tokens)
    }

    /// Assemble a context from `history` within `budget_tokens`.
    ///
    /// Pure: reads memory entries but changes nothing.
    pub fn build_context(
        &self,
        history: &[ConversationTurn],
        budget_tokens: usize,
    ) -> ContextWindow {
        self.build_context_with(history, &[], budget_tokens)
    }

    /// [`build_context`](Self::build_context) with a tier of retrieved code.
    pub fn build_context_with(
        &self,
        history: &[ConversationTurn],
        snippets: &[RetrievedSnippet],
        budget_tokens: usize,
    ) -> ContextWindow {
        let mut window = ContextWindow {
            budget_tokens,
            ..ContextWindow::default()
        };

        let candidates = self.prioritized_units(history, snippets.len());
        let mut selected: Vec<Unit<'_>> = Vec::new();
        let mut running = 0usize;

        for (position, unit) in candidates.iter().enumerate() {
            let cost = estimate_tokens(&render_unit(*unit, history, snippets));
            if running + cost > budget_tokens {
                let important =
                    matches!(unit, Unit::Entry(e) if e.scope == MemoryScope::Important);
                if position == 0 && important {
                    // An oversized Important entry is still kept.
                    selected.push(*unit);
                    running += cost;
                    window.over_budget = true;
                    window.omitted_units = candidates.len() - 1;
                } else {
                    window.omitted_units = candidates.len() - position;
                }
                break;
            }
            selected.push(*unit);
            running += cost;
        }

        if window.over_budget {
            tracing::warn!(
                target: "codeloop.context",
                budget = budget_tokens,
                cost = running,
                "highest-priority context unit exceeds the budget"
            );
        }

        // Chronological layout: important, then other entries by creation,
        // then code by rank, then turns in log order.
        let mut entries: Vec<&MemoryEntry> = Vec::new();
        let mut code: Vec<usize> = Vec::new();
        let mut turns: Vec<usize> = Vec::new();
        for unit in &selected {
            match unit {
                Unit::Entry(e) => entries.push(*e),
                Unit::Snippet(i) => code.push(*i),
                Unit::Turn(i) => turns.push(*i),
            }
        }
        entries.sort_by_key(|e| (e.scope != MemoryScope::Important, e.sequence));
        code.sort_unstable();
        turns.sort_unstable();

        for entry in &entries {
            window.text.push_str(&entry.render());
        }
        for index in &code {
            window.text.push_str(&snippets[*index].render());
        }
        for index in &turns {
            window.text.push_str(&history[*index].render());
        }

        window.missing_latest_turn =
            !history.is_empty() && turns.last() != Some(&(history.len() - 1));
        if window.missing_latest_turn {
            tracing::warn!(
                target: "codeloop.context",
                budget = budget_tokens,
                "latest turn does not fit in the context budget"
            );
        }

        window.included_entries = entries.len();
        window.included_snippets = code.len();
        window.included_turns = turns.len();
        window.estimated_tokens = estimate_tokens(&window.text);
        window
    }

    fn prioritized_units<'a>(
        &'a self,
        history: &[ConversationTurn],
        snippet_count: usize,
    ) -> Vec<Unit<'a>> {
        let mut units: Vec<Unit<'a>> = self
            .table
            .by_creation(MemoryScope::Important)
            .into_iter()
            .map(Unit::Entry)
            .collect();

        let recent_results: Vec<usize> = history
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, t)| t.role == Role::ToolResult)
            .take(self.tool_result_cap)
            .map(|(i, _)| i)
            .collect();
        units.extend(recent_results.iter().map(|i| Unit::Turn(*i)));

        units.extend(
            (0..history.len())
                .rev()
                .filter(|i| !recent_results.contains(i))
                .map(Unit::Turn),
        );

        units.extend((0..snippet_count).map(Unit::Snippet));
        units.extend(self.table.by_recency().into_iter().map(Unit::Entry));
        units
    }
}

fn render_unit(
    unit: Unit<'_>,
    history: &[ConversationTurn],
    snippets: &[RetrievedSnippet],
) -> String {
    match unit {
        Unit::Entry(entry) => entry.render(),
        Unit::Snippet(index) => snippets[index].render(),
        Unit::Turn(index) => history[index].render(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolExecutionResult;

    fn config() -> ContextConfig {
        ContextConfig {
            budget_tokens: 4096,
            tool_result_cap: 2,
            max_memory_entries: 16,
            memory_db: None,
        }
    }

    fn manager() -> MemoryManager {
        MemoryManager::new(&config())
    }

    fn history() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::user("first question"),
            ConversationTurn::assistant("first answer", Vec::new()),
            ConversationTurn::tool_result(ToolExecutionResult::success("c1", "search", "r1")),
            ConversationTurn::tool_result(ToolExecutionResult::success("c2", "search", "r2")),
            ConversationTurn::tool_result(ToolExecutionResult::success("c3", "search", "r3")),
            ConversationTurn::user("second question"),
        ]
    }

    #[test]
    fn test_everything_fits_in_chronological_order() {
        let mut memory = manager();
        memory.record("goal", "fix the build", MemoryScope::Important).unwrap();
        memory.record("note", "uses cargo", MemoryScope::ShortTerm).unwrap();
        let history = history();

        let window = memory.build_context(&history, 10_000);
        assert!(!window.over_budget);
        assert_eq!(window.included_entries, 2);
        assert_eq!(window.included_turns, 6);
        assert_eq!(window.omitted_units, 0);
        assert!(window.text.starts_with("[memory:goal] fix the build\n[memory:note] uses cargo\n"));
        let first = window.text.find("first question").unwrap();
        let second = window.text.find("second question").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_budget_prefers_important_then_recent_tool_results() {
        let mut memory = manager();
        memory.record("goal", "fix the build", MemoryScope::Important).unwrap();
        let history = history();

        let goal_cost = estimate_tokens("[memory:goal] fix the build\n");
        let r3_cost = estimate_tokens(&history[4].render());
        let r2_cost = estimate_tokens(&history[3].render());
        let budget = goal_cost + r3_cost + r2_cost;

        let window = memory.build_context(&history, budget);
        assert!(window.text.contains("fix the build"));
        assert!(window.text.contains("r3"));
        assert!(window.text.contains("r2"));
        assert!(!window.text.contains("r1"));
        assert!(!window.text.contains("second question"));
        assert!(window.estimated_tokens <= budget);
        assert!(window.omitted_units > 0);
    }

    #[test]
    fn test_remaining_turns_newest_first() {
        let memory = manager();
        let history = vec![
            ConversationTurn::user("oldest"),
            ConversationTurn::assistant("middle", Vec::new()),
            ConversationTurn::user("newest"),
        ];
        let budget = estimate_tokens(&history[2].render()) + estimate_tokens(&history[1].render());
        let window = memory.build_context(&history, budget);
        assert_eq!(window.text, "Assistant: middle\nUser: newest\n");
    }

    #[test]
    fn test_oversized_important_entry_is_flagged() {
        let mut memory = manager();
        memory.record("design", "x".repeat(400), MemoryScope::Important).unwrap();
        let history = history();

        let window = memory.build_context(&history, 10);
        assert!(window.over_budget);
        assert_eq!(window.included_entries, 1);
        assert_eq!(window.included_turns, 0);
        assert!(window.estimated_tokens > 10);
    }

    #[test]
    fn test_oversized_turn_is_never_forced_in() {
        let memory = manager();
        let history = vec![ConversationTurn::user("q".repeat(400))];

        let window = memory.build_context(&history, 10);
        assert!(window.estimated_tokens <= 10);
        assert!(!window.over_budget);
        assert!(window.missing_latest_turn);
        assert_eq!(window.included_turns, 0);
        assert_eq!(window.omitted_units, 1);
        assert_eq!(window.text, "");
    }

    #[test]
    fn test_oversized_long_term_entry_is_not_forced_in() {
        let mut memory = manager();
        memory.record("notes", "n".repeat(400), MemoryScope::LongTerm).unwrap();

        let window = memory.build_context(&[], 10);
        assert!(!window.over_budget);
        assert_eq!(window.included_entries, 0);
        assert_eq!(window.omitted_units, 1);
        assert!(!window.missing_latest_turn);
    }

    fn snippet(path: &str, text: &str) -> RetrievedSnippet {
        RetrievedSnippet {
            path: path.into(),
            chunk_index: 0,
            total_chunks: 1,
            text: text.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn test_snippets_sit_between_turns_and_other_entries() {
        let mut memory = manager();
        memory.record("goal", "fix the build", MemoryScope::Important).unwrap();
        memory.record("note", "uses cargo", MemoryScope::LongTerm).unwrap();
        let history = vec![ConversationTurn::user("where is main?")];
        let snippets = vec![
            snippet("src/main.rs", "fn main() {}"),
            snippet("src/lib.rs", "pub mod a;"),
        ];

        let window = memory.build_context_with(&history, &snippets, 10_000);
        assert_eq!(window.included_snippets, 2);
        assert!(!window.missing_latest_turn);
        let goal = window.text.find("[memory:goal]").unwrap();
        let main = window.text.find("[code:src/main.rs").unwrap();
        let lib = window.text.find("[code:src/lib.rs").unwrap();
        let turn = window.text.find("User: where is main?").unwrap();
        assert!(goal < main && main < lib && lib < turn);

        // Room for the goal, the turn and one snippet only.
        let budget = estimate_tokens("[memory:goal] fix the build\n")
            + estimate_tokens(&history[0].render())
            + estimate_tokens(&snippets[0].render());
        let window = memory.build_context_with(&history, &snippets, budget);
        assert_eq!(window.included_snippets, 1);
        assert_eq!(window.included_entries, 1);
        assert!(window.text.contains("fn main() {}"));
        assert!(!window.text.contains("pub mod a;"));
        assert!(!window.text.contains("uses cargo"));
        assert_eq!(window.omitted_units, 2);
    }

    #[test]
    fn test_stops_at_first_unit_that_does_not_fit() {
        let mut memory = manager();
        memory.record("a", "short", MemoryScope::Important).unwrap();
        memory.record("b", "y".repeat(200), MemoryScope::Important).unwrap();
        memory.record("c", "z", MemoryScope::Important).unwrap();

        let window = memory.build_context(&[], 10);
        assert!(!window.over_budget);
        assert_eq!(window.text, "[memory:a] short\n");
        assert_eq!(window.omitted_units, 2);
    }

    #[test]
    fn test_build_context_is_pure() {
        let mut memory = manager();
        memory.record("goal", "g", MemoryScope::Important).unwrap();
        let history = history();
        let first = memory.build_context(&history, 40);
        let second = memory.build_context(&history, 40);
        assert_eq!(first, second);
        assert_eq!(memory.entries().count(), 1);
    }

    #[test]
    fn test_empty_inputs() {
        let window = manager().build_context(&[], 0);
        assert_eq!(window.text, "");
        assert!(!window.over_budget);
    }

    #[test]
    fn test_reset_keeps_long_term_and_important() {
        let mut memory = manager();
        memory.record("a", "1", MemoryScope::ShortTerm).unwrap();
        memory.record("b", "2", MemoryScope::LongTerm).unwrap();
        memory.record("c", "3", MemoryScope::Important).unwrap();
        memory.push_turn(ConversationTurn::user("hi"));

        memory.reset_conversation();
        assert!(memory.history().is_empty());
        assert!(memory.entry("a").is_none());
        assert!(memory.entry("b").is_some());
        assert!(memory.entry("c").is_some());
    }

    #[test]
    fn test_database_round_trip_through_manager() {
        let db = MemoryDb::open_in_memory().unwrap();
        let mut memory = MemoryManager::with_db(&config(), db).unwrap();
        memory.record("fact", "persist me", MemoryScope::LongTerm).unwrap();
        memory.record("tmp", "not me", MemoryScope::ShortTerm).unwrap();
        memory.record("fact", "now temporary", MemoryScope::ShortTerm).unwrap();
        memory.record("goal", "keep", MemoryScope::Important).unwrap();

        let db = memory.db.take().unwrap();
        let stored: Vec<String> = db.load_all().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(stored, vec!["goal".to_string()]);

        let reloaded = MemoryManager::with_db(&config(), db).unwrap();
        assert_eq!(reloaded.entry("goal").unwrap().value, "keep");
        assert!(reloaded.entry("tmp").is_none());
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Scoped memory entries
//!
//! Entries are keyed facts with a scope that decides their lifetime:
//! ShortTerm entries die with the conversation, LongTerm entries survive
//! it, and Important entries are never evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime class of a memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    ShortTerm,
    LongTerm,
    Important,
}

impl MemoryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::ShortTerm => "short_term",
            MemoryScope::LongTerm => "long_term",
            MemoryScope::Important => "important",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "short_term" => Some(MemoryScope::ShortTerm),
            "long_term" => Some(MemoryScope::LongTerm),
            "important" => Some(MemoryScope::Important),
            _ => None,
        }
    }

    /// Whether entries of this scope outlive a conversation
    pub fn is_persistent(&self) -> bool {
        !matches!(self, MemoryScope::ShortTerm)
    }
}

/// A keyed fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub scope: MemoryScope,
    /// Monotonic creation order
    pub sequence: u64,
    /// Monotonic order of the last write, used for recency ranking
    pub touched: u64,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// Text of this entry as it appears in an assembled context.
    pub fn render(&self) -> String {
        format!("[memory:{}] {}\n", self.key, self.value)
    }
}

/// Entries held in memory, with capacity-bounded eviction
#[derive(Debug, Clone)]
pub struct MemoryTable {
    entries: Vec<MemoryEntry>,
    next_sequence: u64,
    capacity: usize,
}

impl MemoryTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 0,
            capacity,
        }
    }

    fn next(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Insert or update an entry. Returns entries evicted to stay within
    /// capacity.
    pub fn record(&mut self, key: &str, value: &str, scope: MemoryScope) -> Vec<MemoryEntry> {
        let seq = self.next();
        let now = Utc::now();

        if let Some(existing) = self.entries.iter_mut().find(|e| e.key == key) {
            existing.value = value.to_string();
            existing.scope = scope;
            existing.touched = seq;
            existing.last_touched_at = now;
        } else {
            self.entries.push(MemoryEntry {
                key: key.to_string(),
                value: value.to_string(),
                scope,
                sequence: seq,
                touched: seq,
                created_at: now,
                last_touched_at: now,
            });
        }

        self.evict_over_capacity()
    }

    /// Re-insert an entry loaded from storage, keeping its timestamps.
    pub fn restore(&mut self, mut entry: MemoryEntry) {
        let seq = self.next();
        entry.sequence = seq;
        entry.touched = seq;
        self.entries.retain(|e| e.key != entry.key);
        self.entries.push(entry);
    }

    fn evict_over_capacity(&mut self) -> Vec<MemoryEntry> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let victim = self
                .oldest_in(MemoryScope::ShortTerm)
                .or_else(|| self.oldest_in(MemoryScope::LongTerm));
            match victim {
                Some(index) => evicted.push(self.entries.remove(index)),
                None => break,
            }
        }
        evicted
    }

    fn oldest_in(&self, scope: MemoryScope) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.scope == scope)
            .min_by_key(|(_, e)| e.touched)
            .map(|(i, _)| i)
    }

    pub fn get(&self, key: &str) -> Option<&MemoryEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let index = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(index))
    }

    /// Drop every entry of a scope
    pub fn clear_scope(&mut self, scope: MemoryScope) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.scope != scope);
        before - self.entries.len()
    }

    /// Entries of a scope, oldest first
    pub fn by_creation(&self, scope: MemoryScope) -> Vec<&MemoryEntry> {
        let mut entries: Vec<&MemoryEntry> = self.entries.iter().filter(|e| e.scope == scope).collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Non-important entries, most recently touched first
    pub fn by_recency(&self) -> Vec<&MemoryEntry> {
        let mut entries: Vec<&MemoryEntry> = self
            .entries
            .iter()
            .filter(|e| e.scope != MemoryScope::Important)
            .collect();
        entries.sort_by(|a, b| b.touched.cmp(&a.touched));
        entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_update() {
        let mut table = MemoryTable::new(10);
        table.record("lang", "rust", MemoryScope::ShortTerm);
        let created = table.get("lang").unwrap().sequence;

        table.record("lang", "rust 2021", MemoryScope::LongTerm);
        let entry = table.get("lang").unwrap();
        assert_eq!(entry.value, "rust 2021");
        assert_eq!(entry.scope, MemoryScope::LongTerm);
        assert_eq!(entry.sequence, created);
        assert!(entry.touched > created);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_eviction_prefers_short_term_then_long_term() {
        let mut table = MemoryTable::new(3);
        table.record("goal", "ship it", MemoryScope::Important);
        table.record("fact", "uses tokio", MemoryScope::LongTerm);
        table.record("scratch1", "a", MemoryScope::ShortTerm);

        let evicted = table.record("scratch2", "b", MemoryScope::ShortTerm);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "scratch1");

        let evicted = table.record("fact2", "c", MemoryScope::LongTerm);
        assert_eq!(evicted[0].key, "scratch2");

        let evicted = table.record("fact3", "d", MemoryScope::LongTerm);
        assert_eq!(evicted[0].key, "fact");
        assert!(table.get("goal").is_some());
    }

    #[test]
    fn test_important_entries_are_never_evicted() {
        let mut table = MemoryTable::new(1);
        table.record("a", "1", MemoryScope::Important);
        let evicted = table.record("b", "2", MemoryScope::Important);
        assert!(evicted.is_empty());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_touch_refreshes_recency() {
        let mut table = MemoryTable::new(2);
        table.record("old", "1", MemoryScope::ShortTerm);
        table.record("new", "2", MemoryScope::ShortTerm);
        table.record("old", "1b", MemoryScope::ShortTerm);

        let evicted = table.record("third", "3", MemoryScope::ShortTerm);
        assert_eq!(evicted[0].key, "new");

        let keys: Vec<&str> = table.by_recency().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["third", "old"]);
    }

    #[test]
    fn test_clear_scope() {
        let mut table = MemoryTable::new(10);
        table.record("a", "1", MemoryScope::ShortTerm);
        table.record("b", "2", MemoryScope::LongTerm);
        table.record("c", "3", MemoryScope::ShortTerm);
        assert_eq!(table.clear_scope(MemoryScope::ShortTerm), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_scope_roundtrip() {
        for scope in [MemoryScope::ShortTerm, MemoryScope::LongTerm, MemoryScope::Important] {
            assert_eq!(MemoryScope::parse(scope.as_str()), Some(scope));
        }
        assert!(!MemoryScope::ShortTerm.is_persistent());
        assert!(MemoryScope::Important.is_persistent());
    }

    #[test]
    fn test_render() {
        let mut table = MemoryTable::new(4);
        table.record("cwd", "/repo", MemoryScope::Important);
        assert_eq!(table.get("cwd").unwrap().render(), "[memory:cwd] /repo\n");
    }
}

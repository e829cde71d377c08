// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! SQLite persistence for long-lived memory
//!
//! Only LongTerm and Important entries are written here; ShortTerm entries
//! belong to a single conversation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

use super::memory::{MemoryEntry, MemoryScope};
use crate::error::{CodeloopError, Result};

/// Parse a DateTime from a database RFC3339 string, converting errors to rusqlite errors
fn parse_datetime_from_db(
    timestamp: &str,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_scope_from_db(scope: &str, column: usize) -> std::result::Result<MemoryScope, rusqlite::Error> {
    MemoryScope::parse(scope).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("unknown memory scope '{}'", scope).into(),
        )
    })
}

/// Database of persistent memory entries
pub struct MemoryDb {
    conn: Connection,
}

impl MemoryDb {
    /// Open or create a memory database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| CodeloopError::Context(format!("Failed to open memory database: {}", e)))?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Database that lives only as long as this handle
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS memory_entries (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    last_touched_at TEXT NOT NULL
                )",
                [],
            )
            .map_err(|e| CodeloopError::Context(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Insert or replace an entry. ShortTerm entries are ignored.
    pub fn save(&self, entry: &MemoryEntry) -> Result<bool> {
        if !entry.scope.is_persistent() {
            return Ok(false);
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO memory_entries
            (key, value, scope, created_at, last_touched_at)
            VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &entry.key,
                &entry.value,
                entry.scope.as_str(),
                entry.created_at.to_rfc3339(),
                entry.last_touched_at.to_rfc3339()
            ],
        )?;
        Ok(true)
    }

    /// Delete an entry by key. Returns whether a row was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM memory_entries WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Load every stored entry, oldest write first.
    ///
    /// `sequence` and `touched` are left at zero; the in-memory table
    /// assigns them on restore.
    pub fn load_all(&self) -> Result<Vec<MemoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value, scope, created_at, last_touched_at
            FROM memory_entries
            ORDER BY last_touched_at ASC, key ASC",
        )?;

        let entries = stmt
            .query_map([], |row| {
                let scope: String = row.get(2)?;
                let created_at: String = row.get(3)?;
                let last_touched_at: String = row.get(4)?;
                Ok(MemoryEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    scope: parse_scope_from_db(&scope, 2)?,
                    sequence: 0,
                    touched: 0,
                    created_at: parse_datetime_from_db(&created_at, 3)?,
                    last_touched_at: parse_datetime_from_db(&last_touched_at, 4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Remove every stored entry
    pub fn clear_all(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM memory_entries", [])?)
    }
}

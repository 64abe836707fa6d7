//! Persistent Store (§4.3, §6): durable facts/prefs/sessions/error-patterns.
//!
//! Backed by an embedded SQLite database with five tables. All user-facing values
//! are JSON-serialized, then obfuscated (see [`crypto`]) before hitting disk.
//! I/O errors are logged and the call degrades to an in-memory fallback rather
//! than propagating — per §7, persistence failure is best-effort, not fatal.

pub mod crypto;
pub mod types;

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{instrument, warn};

pub use types::{ErrorPattern, MemoryEntry, MemoryType, SessionRecord, UserPreferences};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    memory_type TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    importance REAL NOT NULL,
    access_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    tags TEXT NOT NULL,
    embedding TEXT,
    UNIQUE(memory_type, key)
);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
CREATE INDEX IF NOT EXISTS idx_memories_key ON memories(key);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance DESC);
CREATE INDEX IF NOT EXISTS idx_memories_last_accessed ON memories(last_accessed DESC);

CREATE TABLE IF NOT EXISTS user_preferences (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    preferences TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_history (
    session_id TEXT PRIMARY KEY,
    start_time TEXT NOT NULL,
    end_time TEXT,
    summary TEXT NOT NULL,
    tasks_completed INTEGER NOT NULL,
    tasks_failed INTEGER NOT NULL,
    context TEXT
);
CREATE INDEX IF NOT EXISTS idx_session_start ON session_history(start_time DESC);

CREATE TABLE IF NOT EXISTS error_patterns (
    id TEXT PRIMARY KEY,
    error_signature TEXT NOT NULL UNIQUE,
    fix_pattern TEXT NOT NULL,
    success_count INTEGER NOT NULL,
    fail_count INTEGER NOT NULL,
    last_seen TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_error_signature ON error_patterns(error_signature);

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    vector TEXT NOT NULL
);
"#;

pub struct PersistentStore {
    conn: Mutex<Connection>,
    key: [u8; 32],
}

impl PersistentStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        let key = crypto::derive_machine_key()?;
        Ok(Self { conn: Mutex::new(conn), key })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        let key = crypto::derive_machine_key()?;
        Ok(Self { conn: Mutex::new(conn), key })
    }

    /// Upsert by (type, key); refreshes `updated_at`.
    #[instrument(skip(self, value))]
    pub fn store(
        &self,
        key: &str,
        value: &str,
        memory_type: MemoryType,
        importance: f32,
        tags: &[String],
    ) -> anyhow::Result<()> {
        let id = MemoryEntry::content_id(memory_type, key);
        let now = Utc::now();
        let obfuscated = crypto::obfuscate(value, &self.key);
        let tags_json = serde_json::to_string(tags)?;

        let run = || -> rusqlite::Result<()> {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO memories (id, memory_type, key, value, importance, access_count, created_at, updated_at, last_accessed, tags, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?6, ?7, NULL)
                 ON CONFLICT(memory_type, key) DO UPDATE SET
                    value = excluded.value,
                    importance = excluded.importance,
                    updated_at = excluded.updated_at,
                    tags = excluded.tags",
                params![id, memory_type.as_str(), key, obfuscated, importance, now.to_rfc3339(), tags_json],
            )?;
            Ok(())
        };

        if let Err(e) = run() {
            warn!(error = %e, "persistent store write failed; operation is best-effort");
        }
        Ok(())
    }

    /// Returns the value and increments access count / last-accessed.
    #[instrument(skip(self))]
    pub fn get(&self, key: &str, memory_type: Option<MemoryType>) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result: rusqlite::Result<Option<(String, String)>> = (|| {
            let (id, value): (String, String) = if let Some(mt) = memory_type {
                conn.query_row(
                    "SELECT id, value FROM memories WHERE memory_type = ?1 AND key = ?2",
                    params![mt.as_str(), key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
            } else {
                conn.query_row(
                    "SELECT id, value FROM memories WHERE key = ?1 ORDER BY updated_at DESC LIMIT 1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
            };
            Ok(Some((id, value)))
        })();

        match result {
            Ok(Some((id, value))) => {
                let now = Utc::now().to_rfc3339();
                let _ = conn.execute(
                    "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
                    params![now, id],
                );
                Ok(Some(crypto::deobfuscate(&value, &self.key)?))
            }
            Ok(None) => Ok(None),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                warn!(error = %e, "persistent store read failed; treating as miss");
                Ok(None)
            }
        }
    }

    /// Keyword-overlap ranked recall. Tokenizes on whitespace, underscore, hyphen, slash;
    /// score = overlap_fraction + 0.3*importance + recency_bonus (linear decay over 30 days).
    #[instrument(skip(self))]
    pub fn recall(
        &self,
        query: &str,
        memory_type: Option<MemoryType>,
        limit: usize,
        min_importance: f32,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = if memory_type.is_some() {
            conn.prepare(
                "SELECT id, memory_type, key, value, importance, access_count, created_at, updated_at, last_accessed, tags
                 FROM memories WHERE memory_type = ?1 AND importance >= ?2",
            )?
        } else {
            conn.prepare(
                "SELECT id, memory_type, key, value, importance, access_count, created_at, updated_at, last_accessed, tags
                 FROM memories WHERE importance >= ?1",
            )?
        };

        let rows: Vec<rusqlite::Result<(String, String, String, String, f32, u32, String, String, String, String)>> =
            if let Some(mt) = memory_type {
                stmt.query_map(params![mt.as_str(), min_importance], row_tuple)?.collect()
            } else {
                stmt.query_map(params![min_importance], row_tuple)?.collect()
            };

        let query_tokens = tokenize(query);
        let now = Utc::now();
        let mut scored: Vec<(f32, MemoryEntry)> = Vec::new();

        for row in rows {
            let (id, mt, key, value, importance, access_count, created_at, updated_at, last_accessed, tags) = row?;
            let decrypted = match crypto::deobfuscate(&value, &self.key) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to deobfuscate memory entry during recall");
                    continue;
                }
            };
            let candidate_tokens: std::collections::HashSet<String> =
                tokenize(&key).into_iter().chain(tokenize(&decrypted)).collect();
            let overlap = query_tokens.intersection(&candidate_tokens).count();
            if overlap == 0 {
                continue;
            }
            let overlap_fraction = overlap as f32 / query_tokens.len().max(1) as f32;

            let last_accessed_dt = chrono::DateTime::parse_from_rfc3339(&last_accessed)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(now);
            let age_days = (now - last_accessed_dt).num_seconds() as f32 / 86400.0;
            let recency_bonus = (0.2 * (1.0 - (age_days / 30.0)).clamp(0.0, 1.0)).max(0.0);

            let score = overlap_fraction + 0.3 * importance + recency_bonus;

            let entry = MemoryEntry {
                id,
                memory_type: MemoryType::parse(&mt).unwrap_or(MemoryType::Fact),
                key,
                value: decrypted,
                importance,
                access_count,
                created_at: parse_dt(&created_at),
                updated_at: parse_dt(&updated_at),
                last_accessed: last_accessed_dt,
                tags: serde_json::from_str(&tags).unwrap_or_default(),
                embedding: None,
            };
            scored.push((score, entry));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(_, e)| e).collect())
    }

    /// Deletes entries older than `days`, below `min_importance`, with access count < 3;
    /// also purges session history older than 90 days.
    #[instrument(skip(self))]
    pub fn compact(&self, days: i64, min_importance: f32) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM memories WHERE created_at < ?1 AND importance < ?2 AND access_count < 3",
            params![cutoff, min_importance],
        )?;
        let session_cutoff = (Utc::now() - chrono::Duration::days(90)).to_rfc3339();
        conn.execute("DELETE FROM session_history WHERE start_time < ?1", params![session_cutoff])?;
        Ok(deleted as u64)
    }

    #[instrument(skip(self))]
    pub fn learn_error_fix(&self, signature: &str, fix: &str, success: bool) -> anyhow::Result<()> {
        let id = MemoryEntry::content_id(MemoryType::Error, signature);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let existing: Option<(u32, u32)> = conn
            .query_row(
                "SELECT success_count, fail_count FROM error_patterns WHERE error_signature = ?1",
                params![signature],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let (success_count, fail_count) = match existing {
            Some((s, f)) => {
                if success { (s + 1, f) } else { (s, f + 1) }
            }
            None => {
                if success { (1, 0) } else { (0, 1) }
            }
        };

        conn.execute(
            "INSERT INTO error_patterns (id, error_signature, fix_pattern, success_count, fail_count, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(error_signature) DO UPDATE SET
                fix_pattern = excluded.fix_pattern,
                success_count = excluded.success_count,
                fail_count = excluded.fail_count,
                last_seen = excluded.last_seen",
            params![id, signature, fix, success_count, fail_count, now],
        )?;
        Ok(())
    }

    /// Best fix for a signature, only when successes outnumber failures.
    pub fn find_error_fix(&self, signature: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, u32, u32)> = conn
            .query_row(
                "SELECT fix_pattern, success_count, fail_count FROM error_patterns WHERE error_signature = ?1",
                params![signature],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .ok();
        Ok(row.and_then(|(fix, s, f)| if s > f { Some(fix) } else { None }))
    }

    pub fn save_preferences(&self, prefs: &UserPreferences) -> anyhow::Result<()> {
        let json = serde_json::to_string(prefs)?;
        let obfuscated = crypto::obfuscate(&json, &self.key);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_preferences (id, preferences, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET preferences = excluded.preferences, updated_at = excluded.updated_at",
            params![obfuscated, now],
        )?;
        Ok(())
    }

    pub fn load_preferences(&self) -> anyhow::Result<UserPreferences> {
        let conn = self.conn.lock().unwrap();
        let row: Option<String> = conn
            .query_row("SELECT preferences FROM user_preferences WHERE id = 1", [], |row| row.get(0))
            .ok();
        match row {
            Some(enc) => {
                let json = crypto::deobfuscate(&enc, &self.key)?;
                Ok(serde_json::from_str(&json)?)
            }
            None => Ok(UserPreferences::default()),
        }
    }

    pub fn start_session(&self, session_id: &str) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO session_history (session_id, start_time, end_time, summary, tasks_completed, tasks_failed, context)
             VALUES (?1, ?2, NULL, '', 0, 0, NULL)",
            params![session_id, now],
        )?;
        Ok(())
    }

    pub fn end_session(&self, session_id: &str, summary: &str, completed: u32, failed: u32) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE session_history SET end_time = ?1, summary = ?2, tasks_completed = ?3, tasks_failed = ?4 WHERE session_id = ?5",
            params![now, summary, completed, failed, session_id],
        )?;
        Ok(())
    }

    /// Cache key is (chunk_id, content_hash): a re-embed under a changed hash replaces
    /// the stale row rather than accumulating one per revision (§3 CodeChunk invariant).
    pub fn store_embedding(&self, chunk_id: &str, content_hash: &str, vector: &[f32]) -> anyhow::Result<()> {
        let vector_json = serde_json::to_string(vector)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO embeddings (chunk_id, content_hash, vector) VALUES (?1, ?2, ?3)
             ON CONFLICT(chunk_id) DO UPDATE SET content_hash = excluded.content_hash, vector = excluded.vector",
            params![chunk_id, content_hash, vector_json],
        )?;
        Ok(())
    }

    /// Returns the cached vector only when `content_hash` still matches; a stale
    /// entry (hash mismatch) is reported as absent so the caller re-embeds.
    pub fn get_embedding(&self, chunk_id: &str, content_hash: &str) -> anyhow::Result<Option<Vec<f32>>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT content_hash, vector FROM embeddings WHERE chunk_id = ?1",
                params![chunk_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        match row {
            Some((hash, vector_json)) if hash == content_hash => Ok(Some(serde_json::from_str(&vector_json)?)),
            _ => Ok(None),
        }
    }

    pub fn all_embeddings(&self) -> anyhow::Result<Vec<(String, String, Vec<f32>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT chunk_id, content_hash, vector FROM embeddings")?;
        let rows = stmt.query_map([], |row| {
            let chunk_id: String = row.get(0)?;
            let content_hash: String = row.get(1)?;
            let vector_json: String = row.get(2)?;
            Ok((chunk_id, content_hash, vector_json))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (chunk_id, content_hash, vector_json) = row?;
            let vector: Vec<f32> = serde_json::from_str(&vector_json)?;
            out.push((chunk_id, content_hash, vector));
        }
        Ok(out)
    }

    pub fn remove_embeddings_for_prefix(&self, file_path: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM embeddings WHERE chunk_id LIKE ?1", params![format!("{file_path}:%")])?;
        Ok(())
    }
}

fn row_tuple(
    row: &rusqlite::Row,
) -> rusqlite::Result<(String, String, String, String, f32, u32, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn parse_dt(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn tokenize(s: &str) -> std::collections::HashSet<String> {
    s.to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-' || c == '/')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_get_round_trips() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.store("favorite_color", "blue", MemoryType::Fact, 0.5, &[]).unwrap();
        let value = store.get("favorite_color", Some(MemoryType::Fact)).unwrap();
        assert_eq!(value, Some("blue".to_string()));
    }

    #[test]
    fn store_twice_same_key_leaves_one_entry() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.store("k", "v1", MemoryType::Fact, 0.5, &[]).unwrap();
        store.store("k", "v2", MemoryType::Fact, 0.5, &[]).unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories WHERE memory_type = 'fact' AND key = 'k'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        drop(conn);
        assert_eq!(store.get("k", Some(MemoryType::Fact)).unwrap(), Some("v2".to_string()));
    }

    #[test]
    fn recall_requires_overlap() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.store("rust_project", "a systems programming language", MemoryType::Fact, 0.8, &[]).unwrap();
        store.store("unrelated", "something else entirely", MemoryType::Fact, 0.8, &[]).unwrap();
        let results = store.recall("rust programming", None, 10, 0.0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "rust_project");
    }

    #[test]
    fn error_fix_requires_success_majority() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.learn_error_fix("sig1", "restart service", true).unwrap();
        store.learn_error_fix("sig1", "restart service", false).unwrap();
        store.learn_error_fix("sig1", "restart service", false).unwrap();
        // 1 success, 2 failures: should not be returned.
        assert_eq!(store.find_error_fix("sig1").unwrap(), None);

        store.learn_error_fix("sig1", "restart service", true).unwrap();
        store.learn_error_fix("sig1", "restart service", true).unwrap();
        // now 3 success, 2 fail.
        assert_eq!(store.find_error_fix("sig1").unwrap(), Some("restart service".to_string()));
    }

    #[test]
    fn stale_embedding_hash_is_reported_absent() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.store_embedding("src/lib.rs:1:10", "hash-a", &[0.1, 0.2, 0.3]).unwrap();
        assert!(store.get_embedding("src/lib.rs:1:10", "hash-a").unwrap().is_some());
        assert!(store.get_embedding("src/lib.rs:1:10", "hash-b").unwrap().is_none());
    }

    #[test]
    fn re_embed_replaces_stale_row_rather_than_accumulating() {
        let store = PersistentStore::open_in_memory().unwrap();
        store.store_embedding("src/lib.rs:1:10", "hash-a", &[0.1, 0.2]).unwrap();
        store.store_embedding("src/lib.rs:1:10", "hash-b", &[0.9, 0.9]).unwrap();
        let all = store.all_embeddings().unwrap();
        assert_eq!(all.iter().filter(|(id, _, _)| id == "src/lib.rs:1:10").count(), 1);
        assert_eq!(store.get_embedding("src/lib.rs:1:10", "hash-b").unwrap(), Some(vec![0.9, 0.9]));
    }

    #[test]
    fn preferences_round_trip() {
        let store = PersistentStore::open_in_memory().unwrap();
        let mut prefs = UserPreferences::default();
        prefs.theme = "light".to_string();
        store.save_preferences(&prefs).unwrap();
        let loaded = store.load_preferences().unwrap();
        assert_eq!(loaded.theme, "light");
    }
}

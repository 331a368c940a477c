//! # SQLite Entry Store
//!
//! The file-backed store type. One SQLite database per logical document
//! database; entries, ciphertext blobs, and dependency edges live in their
//! own tables so the indices of the store contract map onto SQL indices.
//!
//! The connection sits behind a mutex; every trait call takes it once and
//! runs to completion, which gives `put_entries` its per-call atomicity
//! (wrapped in a transaction) and readers a consistent snapshot.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::crypto::Signature;
use crate::entry::{codec, Entry, EntryMetadata, EntryType};
use crate::error::{Error, Result};
use crate::store::{
    EntryFilter, EntryStore, HaveSet, IdBloomSummary, ResolveOptions, ScanCursor, ScanPage,
};

mod schema {
    pub const SCHEMA_VERSION: i32 = 1;

    pub const CREATE_TABLES: &str = "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            id                TEXT PRIMARY KEY,
            entry_type        TEXT NOT NULL,
            doc_id            TEXT NOT NULL,
            dependency_ids    TEXT NOT NULL,
            created_at        INTEGER NOT NULL,
            created_by        TEXT NOT NULL,
            decryption_key_id TEXT NOT NULL,
            content_hash      TEXT NOT NULL,
            original_size     INTEGER NOT NULL,
            encrypted_size    INTEGER NOT NULL,
            signature         BLOB NOT NULL,
            blob_slot         INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entries_doc  ON entries(doc_id);
        CREATE INDEX IF NOT EXISTS idx_entries_type ON entries(entry_type);
        CREATE INDEX IF NOT EXISTS idx_entries_time ON entries(created_at, id);

        CREATE TABLE IF NOT EXISTS blobs (
            content_hash TEXT NOT NULL,
            slot         INTEGER NOT NULL,
            ciphertext   BLOB NOT NULL,
            refcount     INTEGER NOT NULL,
            PRIMARY KEY (content_hash, slot)
        );

        CREATE TABLE IF NOT EXISTS deps (
            entry_id TEXT NOT NULL,
            dep_id   TEXT NOT NULL,
            PRIMARY KEY (entry_id, dep_id)
        );

        CREATE INDEX IF NOT EXISTS idx_deps_dep ON deps(dep_id);
    ";
}

/// File-backed content-addressed store.
pub struct SqliteEntryStore {
    conn: Arc<Mutex<Connection>>,
    bloom_cache: RwLock<Option<IdBloomSummary>>,
}

impl SqliteEntryStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory SQLite database (tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            bloom_cache: RwLock::new(None),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )?;
                tracing::info!("Entry store schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v != schema::SCHEMA_VERSION => {
                return Err(Error::Storage(format!(
                    "unsupported entry store schema version {}",
                    v
                )));
            }
            Some(v) => {
                tracing::debug!("Entry store schema version: {}", v);
            }
        }
        Ok(())
    }

    /// Total refcount across all ciphertext slots for a content hash.
    pub fn ciphertext_refcount(&self, content_hash: &str) -> usize {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(refcount), 0) FROM blobs WHERE content_hash = ?",
            params![content_hash],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    /// Number of physically stored ciphertexts for a content hash.
    pub fn ciphertext_copies(&self, content_hash: &str) -> usize {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM blobs WHERE content_hash = ?",
            params![content_hash],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    fn invalidate_bloom(&self) {
        *self.bloom_cache.write() = None;
    }
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<EntryMetadata> {
    let entry_type: String = row.get("entry_type")?;
    let deps_json: String = row.get("dependency_ids")?;
    Ok(EntryMetadata {
        id: row.get("id")?,
        entry_type: EntryType::parse(&entry_type)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        doc_id: row.get("doc_id")?,
        dependency_ids: serde_json::from_str(&deps_json)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        created_at: row.get("created_at")?,
        created_by: row.get("created_by")?,
        decryption_key_id: row.get("decryption_key_id")?,
        content_hash: row.get("content_hash")?,
        original_size: row.get::<_, i64>("original_size")? as u64,
        encrypted_size: row.get::<_, i64>("encrypted_size")? as u64,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let metadata = metadata_from_row(row)?;
    let signature: Vec<u8> = row.get("signature")?;
    let ciphertext: Vec<u8> = row.get("ciphertext")?;
    let signature =
        Signature::from_slice(&signature).map_err(|_| rusqlite::Error::InvalidQuery)?;
    Ok(Entry {
        id: metadata.id,
        entry_type: metadata.entry_type,
        doc_id: metadata.doc_id,
        dependency_ids: metadata.dependency_ids,
        created_at: metadata.created_at,
        created_by: metadata.created_by,
        decryption_key_id: metadata.decryption_key_id,
        content_hash: metadata.content_hash,
        original_size: metadata.original_size,
        encrypted_size: metadata.encrypted_size,
        signature,
        encrypted_data: ciphertext,
    })
}

const ENTRY_SELECT: &str = "
    SELECT e.id, e.entry_type, e.doc_id, e.dependency_ids, e.created_at,
           e.created_by, e.decryption_key_id, e.content_hash,
           e.original_size, e.encrypted_size, e.signature, b.ciphertext
    FROM entries e
    JOIN blobs b ON b.content_hash = e.content_hash AND b.slot = e.blob_slot
";

#[async_trait]
impl EntryStore for SqliteEntryStore {
    async fn put_entries(&self, entries: &[Entry]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let batch_ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();

        // Validate before writing; the transaction makes the batch atomic
        // even on the error paths below.
        for entry in entries {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM entries WHERE id = ?",
                    params![entry.id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                continue;
            }
            if entry.entry_type != EntryType::DocCreate && entry.dependency_ids.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "entry {} of type {} has no dependencies",
                    entry.id,
                    entry.entry_type.as_str()
                )));
            }
            if codec::compute_id(&entry.metadata()) != entry.id {
                return Err(Error::Corruption(format!(
                    "entry id {} does not match its metadata",
                    entry.id
                )));
            }
            for dep in &entry.dependency_ids {
                if batch_ids.contains(dep.as_str()) {
                    continue;
                }
                let present: Option<i64> = tx
                    .query_row("SELECT 1 FROM entries WHERE id = ?", params![dep], |row| {
                        row.get(0)
                    })
                    .optional()?;
                if present.is_none() {
                    return Err(Error::DependencyMissing(dep.clone()));
                }
            }
        }

        let mut wrote = false;
        for entry in entries {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM entries WHERE id = ?",
                    params![entry.id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                continue;
            }

            // Find or create the ciphertext slot for this content hash
            let slot: i64 = {
                let mut stmt = tx.prepare(
                    "SELECT slot, ciphertext FROM blobs WHERE content_hash = ? ORDER BY slot",
                )?;
                let mut found: Option<i64> = None;
                let mut max_slot: i64 = -1;
                let rows = stmt.query_map(params![entry.content_hash], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    let (slot, ciphertext) = row?;
                    max_slot = max_slot.max(slot);
                    if ciphertext == entry.encrypted_data {
                        found = Some(slot);
                        break;
                    }
                }
                match found {
                    Some(slot) => {
                        tx.execute(
                            "UPDATE blobs SET refcount = refcount + 1
                             WHERE content_hash = ? AND slot = ?",
                            params![entry.content_hash, slot],
                        )?;
                        slot
                    }
                    None => {
                        let slot = max_slot + 1;
                        tx.execute(
                            "INSERT INTO blobs (content_hash, slot, ciphertext, refcount)
                             VALUES (?, ?, ?, 1)",
                            params![entry.content_hash, slot, entry.encrypted_data],
                        )?;
                        slot
                    }
                }
            };

            tx.execute(
                "INSERT INTO entries (id, entry_type, doc_id, dependency_ids, created_at,
                                      created_by, decryption_key_id, content_hash,
                                      original_size, encrypted_size, signature, blob_slot)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    entry.id,
                    entry.entry_type.as_str(),
                    entry.doc_id,
                    serde_json::to_string(&entry.dependency_ids)?,
                    entry.created_at,
                    entry.created_by,
                    entry.decryption_key_id,
                    entry.content_hash,
                    entry.original_size as i64,
                    entry.encrypted_size as i64,
                    entry.signature.as_bytes().to_vec(),
                    slot,
                ],
            )?;
            for dep in &entry.dependency_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO deps (entry_id, dep_id) VALUES (?, ?)",
                    params![entry.id, dep],
                )?;
            }
            wrote = true;
        }

        tx.commit()?;
        drop(conn);
        if wrote {
            self.invalidate_bloom();
        }
        Ok(())
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<Entry>> {
        let conn = self.conn.lock();
        let sql = format!("{} WHERE e.id = ?", ENTRY_SELECT);
        let mut stmt = conn.prepare(&sql)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = stmt
                .query_row(params![id], entry_from_row)
                .optional()?
            {
                out.push(entry);
            }
        }
        Ok(out)
    }

    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT 1 FROM entries WHERE id = ?")?;
        let mut out = Vec::new();
        for id in ids {
            let present: Option<i64> =
                stmt.query_row(params![id], |row| row.get(0)).optional()?;
            if present.is_some() {
                out.push(id.clone());
            }
        }
        Ok(out)
    }

    async fn get_all_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM entries")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    async fn find_new_entries(&self, have: &HaveSet) -> Result<Vec<EntryMetadata>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM entries ORDER BY created_at, id",
        )?;
        let all = stmt
            .query_map([], metadata_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(all.into_iter().filter(|m| !have.contains(&m.id)).collect())
    }

    async fn find_new_entries_for_doc(
        &self,
        have: &HaveSet,
        doc_id: &str,
    ) -> Result<Vec<EntryMetadata>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM entries WHERE doc_id = ? ORDER BY created_at, id",
        )?;
        let all = stmt
            .query_map(params![doc_id], metadata_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(all.into_iter().filter(|m| !have.contains(&m.id)).collect())
    }

    async fn find_entries(
        &self,
        entry_type: EntryType,
        from_ts: Option<i64>,
        to_ts: Option<i64>,
    ) -> Result<Vec<EntryMetadata>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM entries
             WHERE entry_type = ?
               AND created_at >= COALESCE(?, created_at)
               AND created_at <= COALESCE(?, created_at)
             ORDER BY created_at, id",
        )?;
        let found = stmt
            .query_map(
                params![entry_type.as_str(), from_ts, to_ts],
                metadata_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(found)
    }

    async fn scan_entries_since(
        &self,
        cursor: Option<&ScanCursor>,
        limit: usize,
        filter: Option<&EntryFilter>,
    ) -> Result<ScanPage> {
        let conn = self.conn.lock();
        let (cursor_ts, cursor_id) = match cursor {
            Some(c) => (c.created_at, c.id.clone()),
            None => (i64::MIN, String::new()),
        };
        let filter_doc = filter.and_then(|f| f.doc_id.clone());
        let filter_type = filter
            .and_then(|f| f.entry_type)
            .map(|t| t.as_str().to_string());

        let sql = format!(
            "{}
             WHERE (e.created_at > ?1 OR (e.created_at = ?1 AND e.id > ?2))
               AND e.doc_id = COALESCE(?3, e.doc_id)
               AND e.entry_type = COALESCE(?4, e.entry_type)
             ORDER BY e.created_at, e.id
             LIMIT ?5",
            ENTRY_SELECT
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut entries = stmt
            .query_map(
                params![cursor_ts, cursor_id, filter_doc, filter_type, (limit + 1) as i64],
                entry_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let has_more = entries.len() > limit;
        entries.truncate(limit);
        let next_cursor = entries
            .last()
            .map(|e| ScanCursor::after(e.created_at, &e.id));
        Ok(ScanPage {
            entries,
            next_cursor,
            has_more,
        })
    }

    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT entry_type, dependency_ids FROM entries WHERE id = ?")?;

        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(start_id.to_string(), false)];

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            let row: Option<(String, String)> = stmt
                .query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;
            let (entry_type, deps_json) =
                row.ok_or_else(|| Error::DependencyMissing(id.clone()))?;
            let entry_type = EntryType::parse(&entry_type)?;
            let mut deps: Vec<String> = serde_json::from_str(&deps_json)?;

            stack.push((id.clone(), true));
            if options.stop_at_entry_type != Some(entry_type) {
                deps.sort();
                for dep in deps.into_iter().rev() {
                    if !visited.contains(&dep) {
                        stack.push((dep, false));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn purge_doc_history(&self, doc_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let doomed: Vec<(String, String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, content_hash, blob_slot FROM entries WHERE doc_id = ?",
            )?;
            let rows = stmt
                .query_map(params![doc_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (id, content_hash, slot) in &doomed {
            tx.execute(
                "UPDATE blobs SET refcount = refcount - 1
                 WHERE content_hash = ? AND slot = ? AND refcount > 0",
                params![content_hash, slot],
            )?;
            tx.execute("DELETE FROM deps WHERE entry_id = ? OR dep_id = ?", params![id, id])?;
            tx.execute("DELETE FROM entries WHERE id = ?", params![id])?;
        }
        tx.execute("DELETE FROM blobs WHERE refcount <= 0", [])?;
        tx.commit()?;
        drop(conn);

        if !doomed.is_empty() {
            self.invalidate_bloom();
        }
        Ok(())
    }

    async fn id_bloom_summary(&self) -> Result<IdBloomSummary> {
        if let Some(cached) = self.bloom_cache.read().clone() {
            return Ok(cached);
        }
        let ids = self.get_all_ids().await?;
        let summary = IdBloomSummary::build(&ids);
        *self.bloom_cache.write() = Some(summary.clone());
        Ok(summary)
    }

    async fn get_attachment_chunk(&self, chunk_id: &str) -> Result<Vec<u8>> {
        let conn = self.conn.lock();
        let sql = format!("{} WHERE e.id = ?", ENTRY_SELECT);
        let entry = conn
            .query_row(&sql, params![chunk_id], entry_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("attachment chunk {}", chunk_id)))?;
        if entry.entry_type != EntryType::AttachmentChunk {
            return Err(Error::InvalidArgument(format!(
                "entry {} is not an attachment chunk",
                chunk_id
            )));
        }
        Ok(entry.encrypted_data)
    }
}

// ============================================================================
// TESTS
// ============================================================================

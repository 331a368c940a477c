//! # Content-Addressed Store
//!
//! Append-only persistence for entries, keyed by their content-derived ids.
//!
//! ## Contract
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ENTRY STORE CONTRACT                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  put_entries        idempotent by id, atomic per call,          │
//! │                     ciphertext dedup by content hash            │
//! │  get / has          by id; unknown ids silently dropped         │
//! │  find_new_entries   metadata for ids the caller lacks           │
//! │                     (explicit have-list or bloom summary)       │
//! │  find_entries       by type and inclusive time window           │
//! │  scan_entries_since cursor pages in (created_at, id) order      │
//! │  resolve_deps       topological ancestor walk, optional         │
//! │                     stop-at-type (inclusive)                    │
//! │  purge_doc_history  delete a doc's entries, GC shared blobs     │
//! │  id_bloom_summary   cached compact digest of get_all_ids()      │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two implementations live here: [`memory::MemoryEntryStore`] (the default)
//! and [`sqlite::SqliteEntryStore`] (the file store). Both are internally
//! thread-safe; readers observe all or none of a `put_entries` batch.

pub mod bloom;
pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::entry::{Entry, EntryMetadata, EntryType};
use crate::error::{Error, Result};

pub use bloom::IdBloomSummary;
pub use memory::MemoryEntryStore;
pub use sqlite::SqliteEntryStore;

/// What the caller already has, for diff queries.
///
/// The bloom variant trades exactness for size: a false positive makes the
/// diff *omit* an entry the caller actually lacks, which the sync engine
/// heals through dependency resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HaveSet {
    /// Explicit id list
    Ids(HashSet<String>),
    /// Compact probabilistic digest
    Bloom(IdBloomSummary),
}

impl HaveSet {
    pub fn empty() -> Self {
        HaveSet::Ids(HashSet::new())
    }

    /// Whether the caller (probably) has this id.
    pub fn contains(&self, id: &str) -> bool {
        match self {
            HaveSet::Ids(ids) => ids.contains(id),
            HaveSet::Bloom(summary) => summary.contains(id),
        }
    }
}

/// Resumable position in the (created_at, id) scan order.
///
/// Opaque to callers: the token form survives serialization boundaries and
/// is the only thing the wire carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub(crate) created_at: i64,
    pub(crate) id: String,
}

impl ScanCursor {
    /// Position strictly after the given entry.
    pub fn after(created_at: i64, id: &str) -> Self {
        Self {
            created_at,
            id: id.to_string(),
        }
    }

    /// Encode as an opaque token.
    pub fn to_token(&self) -> String {
        BASE64.encode(format!("{}:{}", self.created_at, self.id))
    }

    /// Decode a token produced by [`to_token`](Self::to_token).
    pub fn from_token(token: &str) -> Result<Self> {
        let raw = BASE64
            .decode(token)
            .map_err(|_| Error::InvalidArgument("malformed scan cursor".into()))?;
        let raw = String::from_utf8(raw)
            .map_err(|_| Error::InvalidArgument("malformed scan cursor".into()))?;
        let (ts, id) = raw
            .split_once(':')
            .ok_or_else(|| Error::InvalidArgument("malformed scan cursor".into()))?;
        Ok(Self {
            created_at: ts
                .parse()
                .map_err(|_| Error::InvalidArgument("malformed scan cursor".into()))?,
            id: id.to_string(),
        })
    }

    /// Whether the entry at (created_at, id) lies after this cursor.
    pub(crate) fn precedes(&self, created_at: i64, id: &str) -> bool {
        (created_at, id) > (self.created_at, self.id.as_str())
    }
}

/// Optional narrowing for scans.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub doc_id: Option<String>,
    pub entry_type: Option<EntryType>,
}

impl EntryFilter {
    pub fn matches(&self, metadata: &EntryMetadata) -> bool {
        if let Some(ref doc_id) = self.doc_id {
            if &metadata.doc_id != doc_id {
                return false;
            }
        }
        if let Some(entry_type) = self.entry_type {
            if metadata.entry_type != entry_type {
                return false;
            }
        }
        true
    }
}

/// One page of a scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub entries: Vec<Entry>,
    /// Cursor positioned after the last returned entry; `None` when the
    /// page is empty
    pub next_cursor: Option<ScanCursor>,
    pub has_more: bool,
}

/// Options for dependency resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOptions {
    /// Halt descent at entries of this type; the matching entry is still
    /// included in the output
    pub stop_at_entry_type: Option<EntryType>,
}

/// The append-only content-addressed store.
///
/// Implementations must be safe to share across tasks; `put_entries` is
/// atomic per call and the resulting total order over ids extends the
/// dependency order.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Append entries. Idempotent by id; dedups ciphertext by content hash.
    ///
    /// Every dependency of every entry must already be present in the store
    /// or earlier in the same batch, otherwise the whole call fails with
    /// `DependencyMissing` and nothing is written.
    async fn put_entries(&self, entries: &[Entry]) -> Result<()>;

    /// Fetch full entries; unknown ids are silently dropped.
    async fn get_entries(&self, ids: &[String]) -> Result<Vec<Entry>>;

    /// The subset of `ids` present in the store.
    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Every entry id. No ordering guarantee.
    async fn get_all_ids(&self) -> Result<Vec<String>>;

    /// Metadata for all entries the caller lacks.
    async fn find_new_entries(&self, have: &HaveSet) -> Result<Vec<EntryMetadata>>;

    /// Same, restricted to one document.
    async fn find_new_entries_for_doc(
        &self,
        have: &HaveSet,
        doc_id: &str,
    ) -> Result<Vec<EntryMetadata>>;

    /// Metadata filtered by entry type and inclusive time window.
    async fn find_entries(
        &self,
        entry_type: EntryType,
        from_ts: Option<i64>,
        to_ts: Option<i64>,
    ) -> Result<Vec<EntryMetadata>>;

    /// Page through entries in (created_at, id) order.
    async fn scan_entries_since(
        &self,
        cursor: Option<&ScanCursor>,
        limit: usize,
        filter: Option<&EntryFilter>,
    ) -> Result<ScanPage>;

    /// Ancestors of `start_id` (dependencies before dependents, the start
    /// entry last). See [`ResolveOptions::stop_at_entry_type`].
    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<String>>;

    /// Delete every entry of a document; ciphertext blobs are garbage
    /// collected once their refcount reaches zero.
    async fn purge_doc_history(&self, doc_id: &str) -> Result<()>;

    /// Compact digest of `get_all_ids`, cached until the next write.
    async fn id_bloom_summary(&self) -> Result<IdBloomSummary>;

    /// Ciphertext of one attachment chunk entry, for range reads.
    async fn get_attachment_chunk(&self, chunk_id: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_token_round_trip() {
        let cursor = ScanCursor::after(1_700_000_000_123, "abc123");
        let token = cursor.to_token();
        assert_eq!(ScanCursor::from_token(&token).unwrap(), cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(ScanCursor::from_token("not base64 !!!").is_err());
        assert!(ScanCursor::from_token(&BASE64.encode("no-separator")).is_err());
    }

    #[test]
    fn test_cursor_ordering() {
        let cursor = ScanCursor::after(100, "bb");
        assert!(cursor.precedes(101, "aa"));
        assert!(cursor.precedes(100, "bc"));
        assert!(!cursor.precedes(100, "bb"));
        assert!(!cursor.precedes(99, "zz"));
    }
}

//! # In-Memory Entry Store
//!
//! The default store type: all indices live in one `RwLock`-guarded state,
//! so a `put_entries` batch becomes visible atomically and readers never
//! observe a half-applied batch.
//!
//! Ciphertext is shared across entries by content hash. Entries whose
//! payloads encrypted deterministically (attachment chunks) land in the
//! same slot and bump its refcount; a random-nonce re-encryption of the
//! same plaintext gets its own slot so no entry's signed ciphertext is
//! ever replaced by a byte-different twin.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::crypto::Signature;
use crate::entry::{codec, Entry, EntryMetadata, EntryType};
use crate::error::{Error, Result};
use crate::store::{
    EntryFilter, EntryStore, HaveSet, IdBloomSummary, ResolveOptions, ScanCursor, ScanPage,
};

struct BlobSlot {
    ciphertext: Vec<u8>,
    refcount: usize,
}

struct StoredEntry {
    metadata: EntryMetadata,
    signature: Signature,
    /// Index into the blob slot list for this entry's content hash
    slot: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, StoredEntry>,
    /// content hash → ciphertext slots with refcounts
    blobs: HashMap<String, Vec<BlobSlot>>,
    /// doc id → (created_at, id), the per-document chain in scan order
    by_doc: HashMap<String, BTreeSet<(i64, String)>>,
    by_type: HashMap<EntryType, HashSet<String>>,
    /// global (created_at, id) scan order
    by_time: BTreeSet<(i64, String)>,
    /// dependency id → ids that depend on it (reverse edges)
    dependents: HashMap<String, HashSet<String>>,
    bloom_cache: Option<IdBloomSummary>,
}

impl Inner {
    fn rebuild_entry(&self, stored: &StoredEntry) -> Result<Entry> {
        let slots = self
            .blobs
            .get(&stored.metadata.content_hash)
            .ok_or_else(|| {
                Error::Corruption(format!(
                    "missing ciphertext blob for content hash {}",
                    stored.metadata.content_hash
                ))
            })?;
        let slot = slots.get(stored.slot).ok_or_else(|| {
            Error::Corruption(format!(
                "missing ciphertext slot {} for content hash {}",
                stored.slot, stored.metadata.content_hash
            ))
        })?;

        let m = &stored.metadata;
        Ok(Entry {
            id: m.id.clone(),
            entry_type: m.entry_type,
            doc_id: m.doc_id.clone(),
            dependency_ids: m.dependency_ids.clone(),
            created_at: m.created_at,
            created_by: m.created_by.clone(),
            decryption_key_id: m.decryption_key_id.clone(),
            content_hash: m.content_hash.clone(),
            original_size: m.original_size,
            encrypted_size: m.encrypted_size,
            signature: stored.signature,
            encrypted_data: slot.ciphertext.clone(),
        })
    }

    fn collect_new(&self, have: &HaveSet, doc_id: Option<&str>) -> Vec<EntryMetadata> {
        let scan: Box<dyn Iterator<Item = &(i64, String)>> = match doc_id {
            Some(doc) => match self.by_doc.get(doc) {
                Some(set) => Box::new(set.iter()),
                None => Box::new(std::iter::empty()),
            },
            None => Box::new(self.by_time.iter()),
        };
        scan.filter(|(_, id)| !have.contains(id))
            .filter_map(|(_, id)| self.entries.get(id))
            .map(|stored| stored.metadata.clone())
            .collect()
    }
}

/// Thread-safe in-memory content-addressed store.
#[derive(Default)]
pub struct MemoryEntryStore {
    inner: RwLock<Inner>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total refcount across all ciphertext slots for a content hash.
    pub fn ciphertext_refcount(&self, content_hash: &str) -> usize {
        self.inner
            .read()
            .blobs
            .get(content_hash)
            .map(|slots| slots.iter().map(|s| s.refcount).sum())
            .unwrap_or(0)
    }

    /// Number of physically stored ciphertexts for a content hash.
    pub fn ciphertext_copies(&self, content_hash: &str) -> usize {
        self.inner
            .read()
            .blobs
            .get(content_hash)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn put_entries(&self, entries: &[Entry]) -> Result<()> {
        let mut inner = self.inner.write();

        // Validate the whole batch before touching any index: the call is
        // atomic, readers see all of it or none of it.
        let batch_ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        for entry in entries {
            if inner.entries.contains_key(&entry.id) {
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
                if !inner.entries.contains_key(dep) && !batch_ids.contains(dep.as_str()) {
                    return Err(Error::DependencyMissing(dep.clone()));
                }
            }
        }

        let mut wrote = false;
        for entry in entries {
            if inner.entries.contains_key(&entry.id) {
                continue;
            }

            let slots = inner.blobs.entry(entry.content_hash.clone()).or_default();
            let slot = match slots
                .iter()
                .position(|s| s.ciphertext == entry.encrypted_data)
            {
                Some(index) => {
                    slots[index].refcount += 1;
                    index
                }
                None => {
                    slots.push(BlobSlot {
                        ciphertext: entry.encrypted_data.clone(),
                        refcount: 1,
                    });
                    slots.len() - 1
                }
            };

            inner
                .by_doc
                .entry(entry.doc_id.clone())
                .or_default()
                .insert((entry.created_at, entry.id.clone()));
            inner
                .by_type
                .entry(entry.entry_type)
                .or_default()
                .insert(entry.id.clone());
            inner.by_time.insert((entry.created_at, entry.id.clone()));
            for dep in &entry.dependency_ids {
                inner
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(entry.id.clone());
            }

            inner.entries.insert(
                entry.id.clone(),
                StoredEntry {
                    metadata: entry.metadata(),
                    signature: entry.signature,
                    slot,
                },
            );
            wrote = true;
        }

        if wrote {
            inner.bloom_cache = None;
        }
        Ok(())
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<Entry>> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(stored) = inner.entries.get(id) {
                out.push(inner.rebuild_entry(stored)?);
            }
        }
        Ok(out)
    }

    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .filter(|id| inner.entries.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get_all_ids(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().entries.keys().cloned().collect())
    }

    async fn find_new_entries(&self, have: &HaveSet) -> Result<Vec<EntryMetadata>> {
        Ok(self.inner.read().collect_new(have, None))
    }

    async fn find_new_entries_for_doc(
        &self,
        have: &HaveSet,
        doc_id: &str,
    ) -> Result<Vec<EntryMetadata>> {
        Ok(self.inner.read().collect_new(have, Some(doc_id)))
    }

    async fn find_entries(
        &self,
        entry_type: EntryType,
        from_ts: Option<i64>,
        to_ts: Option<i64>,
    ) -> Result<Vec<EntryMetadata>> {
        let inner = self.inner.read();
        let mut found: Vec<EntryMetadata> = inner
            .by_type
            .get(&entry_type)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.entries.get(id))
            .map(|stored| stored.metadata.clone())
            .filter(|m| from_ts.map_or(true, |from| m.created_at >= from))
            .filter(|m| to_ts.map_or(true, |to| m.created_at <= to))
            .collect();
        found.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(found)
    }

    async fn scan_entries_since(
        &self,
        cursor: Option<&ScanCursor>,
        limit: usize,
        filter: Option<&EntryFilter>,
    ) -> Result<ScanPage> {
        let inner = self.inner.read();
        let mut entries = Vec::new();
        let mut has_more = false;

        for (created_at, id) in inner.by_time.iter() {
            if let Some(cursor) = cursor {
                if !cursor.precedes(*created_at, id) {
                    continue;
                }
            }
            let stored = match inner.entries.get(id) {
                Some(s) => s,
                None => continue,
            };
            if let Some(filter) = filter {
                if !filter.matches(&stored.metadata) {
                    continue;
                }
            }
            if entries.len() == limit {
                has_more = true;
                break;
            }
            entries.push(inner.rebuild_entry(stored)?);
        }

        let next_cursor = entries
            .last()
            .map(|e: &Entry| ScanCursor::after(e.created_at, &e.id));
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
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        // (id, expanded): an id is pushed once unexpanded, its dependencies
        // land above it, and the second pop emits it — postorder, so every
        // dependency precedes its dependents.
        let mut stack = vec![(start_id.to_string(), false)];

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            let stored = inner
                .entries
                .get(&id)
                .ok_or_else(|| Error::DependencyMissing(id.clone()))?;

            stack.push((id.clone(), true));
            let stop = options.stop_at_entry_type == Some(stored.metadata.entry_type);
            if !stop {
                let mut deps = stored.metadata.dependency_ids.clone();
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
        let mut inner = self.inner.write();
        let doomed: Vec<(i64, String)> = match inner.by_doc.remove(doc_id) {
            Some(set) => set.into_iter().collect(),
            None => return Ok(()),
        };

        for (created_at, id) in doomed {
            let stored = match inner.entries.remove(&id) {
                Some(s) => s,
                None => continue,
            };

            if let Some(slots) = inner.blobs.get_mut(&stored.metadata.content_hash) {
                if let Some(slot) = slots.get_mut(stored.slot) {
                    slot.refcount = slot.refcount.saturating_sub(1);
                }
                if slots.iter().all(|s| s.refcount == 0) {
                    inner.blobs.remove(&stored.metadata.content_hash);
                }
            }

            if let Some(ids) = inner.by_type.get_mut(&stored.metadata.entry_type) {
                ids.remove(&id);
            }
            inner.by_time.remove(&(created_at, id.clone()));
            for dep in &stored.metadata.dependency_ids {
                if let Some(dependents) = inner.dependents.get_mut(dep) {
                    dependents.remove(&id);
                }
            }
            inner.dependents.remove(&id);
        }

        inner.bloom_cache = None;
        Ok(())
    }

    async fn id_bloom_summary(&self) -> Result<IdBloomSummary> {
        if let Some(cached) = self.inner.read().bloom_cache.clone() {
            return Ok(cached);
        }
        let mut inner = self.inner.write();
        let summary = IdBloomSummary::build(inner.entries.keys());
        inner.bloom_cache = Some(summary.clone());
        Ok(summary)
    }

    async fn get_attachment_chunk(&self, chunk_id: &str) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let stored = inner
            .entries
            .get(chunk_id)
            .ok_or_else(|| Error::NotFound(format!("attachment chunk {}", chunk_id)))?;
        if stored.metadata.entry_type != EntryType::AttachmentChunk {
            return Err(Error::InvalidArgument(format!(
                "entry {} is not an attachment chunk",
                chunk_id
            )));
        }
        Ok(inner.rebuild_entry(stored)?.encrypted_data)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;
    use crate::entry::codec::{seal, SealParams};
    use crate::keybag::{KeyBag, KeyScope};

    struct Fixture {
        bag: KeyBag,
        signer: SigningKeyPair,
    }

    impl Fixture {
        fn new() -> Self {
            let mut bag = KeyBag::new();
            bag.set(KeyScope::Doc, "k", &[5u8; 32], Some(1));
            Self {
                bag,
                signer: SigningKeyPair::generate(),
            }
        }

        fn entry(
            &self,
            entry_type: EntryType,
            doc_id: &str,
            plaintext: &[u8],
            deps: Vec<String>,
            created_at: i64,
        ) -> Entry {
            seal(
                SealParams {
                    entry_type,
                    doc_id,
                    plaintext,
                    dependency_ids: deps,
                    key_reference: "doc:k",
                    created_at,
                },
                &self.bag,
                &self.signer,
            )
            .unwrap()
        }

        /// A three-entry chain: create ← change ← change
        fn chain(&self, doc_id: &str) -> Vec<Entry> {
            let create = self.entry(EntryType::DocCreate, doc_id, b"{}", vec![], 100);
            let change1 = self.entry(
                EntryType::DocChange,
                doc_id,
                b"{\"a\":1}",
                vec![create.id.clone()],
                200,
            );
            let change2 = self.entry(
                EntryType::DocChange,
                doc_id,
                b"{\"b\":2}",
                vec![change1.id.clone()],
                300,
            );
            vec![create, change1, change2]
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");

        store.put_entries(&chain).await.unwrap();

        let ids: Vec<String> = chain.iter().map(|e| e.id.clone()).collect();
        let fetched = store.get_entries(&ids).await.unwrap();
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[0].encrypted_data, chain[0].encrypted_data);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");

        store.put_entries(&chain).await.unwrap();
        store.put_entries(&chain).await.unwrap();

        assert_eq!(store.get_all_ids().await.unwrap().len(), 3);
        // Idempotent puts do not inflate refcounts
        assert_eq!(store.ciphertext_refcount(&chain[0].content_hash), 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_one_batch() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let create = fx.entry(EntryType::DocCreate, "doc-1", b"{}", vec![], 100);

        store
            .put_entries(&[create.clone(), create.clone()])
            .await
            .unwrap();
        assert_eq!(store.get_all_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_dependency_rejected_atomically() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");

        // change1 depends on create, which is not in the batch or the store
        let result = store.put_entries(&chain[1..]).await;
        assert!(matches!(result, Err(Error::DependencyMissing(_))));
        assert!(store.get_all_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_batch_dependency_accepted_any_order() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let mut chain = fx.chain("doc-1");
        chain.reverse();

        store.put_entries(&chain).await.unwrap();
        assert_eq!(store.get_all_ids().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_get_drops_unknown_ids_silently() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");
        store.put_entries(&chain).await.unwrap();

        let fetched = store
            .get_entries(&[chain[0].id.clone(), "does-not-exist".into()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
    }

    #[tokio::test]
    async fn test_has_entries_returns_present_subset() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");
        store.put_entries(&chain).await.unwrap();

        let present = store
            .has_entries(&[chain[1].id.clone(), "ghost".into()])
            .await
            .unwrap();
        assert_eq!(present, vec![chain[1].id.clone()]);
    }

    #[tokio::test]
    async fn test_find_new_entries_with_id_list() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");
        store.put_entries(&chain).await.unwrap();

        let have = HaveSet::Ids([chain[0].id.clone()].into_iter().collect());
        let new = store.find_new_entries(&have).await.unwrap();
        assert_eq!(new.len(), 2);
        assert!(new.iter().all(|m| m.id != chain[0].id));
    }

    #[tokio::test]
    async fn test_find_new_entries_with_bloom() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");
        store.put_entries(&chain).await.unwrap();

        let have = HaveSet::Bloom(IdBloomSummary::build([&chain[0].id, &chain[1].id]));
        let new = store.find_new_entries(&have).await.unwrap();
        // chain[2] is definitely absent from the bloom; 0 or more of the
        // others may false-positive away, never the reverse
        assert!(new.iter().any(|m| m.id == chain[2].id) || new.is_empty());
    }

    #[tokio::test]
    async fn test_find_new_entries_for_doc_is_scoped() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        store.put_entries(&fx.chain("doc-1")).await.unwrap();
        store.put_entries(&fx.chain("doc-2")).await.unwrap();

        let new = store
            .find_new_entries_for_doc(&HaveSet::empty(), "doc-2")
            .await
            .unwrap();
        assert_eq!(new.len(), 3);
        assert!(new.iter().all(|m| m.doc_id == "doc-2"));
    }

    #[tokio::test]
    async fn test_find_entries_by_type_and_window() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        store.put_entries(&fx.chain("doc-1")).await.unwrap();

        let changes = store
            .find_entries(EntryType::DocChange, Some(200), Some(200))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].created_at, 200);

        // Window bounds are inclusive
        let all_changes = store
            .find_entries(EntryType::DocChange, Some(200), Some(300))
            .await
            .unwrap();
        assert_eq!(all_changes.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_pages_in_time_order_and_resumes() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");
        store.put_entries(&chain).await.unwrap();

        let first = store.scan_entries_since(None, 2, None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.entries[0].created_at, 100);

        let rest = store
            .scan_entries_since(first.next_cursor.as_ref(), 10, None)
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert!(!rest.has_more);
        assert_eq!(rest.entries[0].created_at, 300);
    }

    #[tokio::test]
    async fn test_scan_with_filter() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        store.put_entries(&fx.chain("doc-1")).await.unwrap();
        store.put_entries(&fx.chain("doc-2")).await.unwrap();

        let filter = EntryFilter {
            doc_id: Some("doc-1".into()),
            entry_type: Some(EntryType::DocChange),
        };
        let page = store
            .scan_entries_since(None, 100, Some(&filter))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page
            .entries
            .iter()
            .all(|e| e.doc_id == "doc-1" && e.entry_type == EntryType::DocChange));
    }

    #[tokio::test]
    async fn test_empty_store_boundaries() {
        let store = MemoryEntryStore::new();
        assert!(store.get_all_ids().await.unwrap().is_empty());
        let page = store.scan_entries_since(None, 10, None).await.unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next_cursor.is_none());
        assert_eq!(store.id_bloom_summary().await.unwrap().total_ids, 0);
    }

    #[tokio::test]
    async fn test_resolve_dependencies_topological() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let chain = fx.chain("doc-1");
        store.put_entries(&chain).await.unwrap();

        let order = store
            .resolve_dependencies(&chain[2].id, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(
            order,
            vec![chain[0].id.clone(), chain[1].id.clone(), chain[2].id.clone()]
        );
    }

    #[tokio::test]
    async fn test_resolve_dependencies_stop_at_type() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let create = fx.entry(EntryType::DocCreate, "d", b"{}", vec![], 100);
        let snapshot = fx.entry(
            EntryType::DocSnapshot,
            "d",
            b"{\"s\":1}",
            vec![create.id.clone()],
            200,
        );
        let change = fx.entry(
            EntryType::DocChange,
            "d",
            b"{\"c\":1}",
            vec![snapshot.id.clone()],
            300,
        );
        store
            .put_entries(&[create.clone(), snapshot.clone(), change.clone()])
            .await
            .unwrap();

        let order = store
            .resolve_dependencies(
                &change.id,
                &ResolveOptions {
                    stop_at_entry_type: Some(EntryType::DocSnapshot),
                },
            )
            .await
            .unwrap();
        // The snapshot is included but its ancestors are not
        assert_eq!(order, vec![snapshot.id.clone(), change.id.clone()]);
    }

    #[tokio::test]
    async fn test_resolve_dependencies_diamond() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let root = fx.entry(EntryType::DocCreate, "d", b"{}", vec![], 100);
        let left = fx.entry(
            EntryType::DocChange,
            "d",
            b"{\"l\":1}",
            vec![root.id.clone()],
            200,
        );
        let right = fx.entry(
            EntryType::DocChange,
            "d",
            b"{\"r\":1}",
            vec![root.id.clone()],
            201,
        );
        let merge = fx.entry(
            EntryType::DocChange,
            "d",
            b"{\"m\":1}",
            vec![left.id.clone(), right.id.clone()],
            300,
        );
        store
            .put_entries(&[root.clone(), left.clone(), right.clone(), merge.clone()])
            .await
            .unwrap();

        let order = store
            .resolve_dependencies(&merge.id, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(order.len(), 4);
        let pos =
            |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos(&root.id) < pos(&left.id));
        assert!(pos(&root.id) < pos(&right.id));
        assert!(pos(&left.id) < pos(&merge.id));
        assert!(pos(&right.id) < pos(&merge.id));
    }

    #[tokio::test]
    async fn test_ciphertext_dedup_and_refcounts() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let create1 = fx.entry(EntryType::DocCreate, "doc-1", b"{}", vec![], 100);
        let create2 = fx.entry(EntryType::DocCreate, "doc-2", b"{}", vec![], 100);
        // Identical 10-byte chunk payload attached to two documents
        let chunk1 = fx.entry(
            EntryType::AttachmentChunk,
            "doc-1",
            b"0123456789",
            vec![create1.id.clone()],
            200,
        );
        let chunk2 = fx.entry(
            EntryType::AttachmentChunk,
            "doc-2",
            b"0123456789",
            vec![create2.id.clone()],
            201,
        );

        store
            .put_entries(&[create1, create2, chunk1.clone(), chunk2.clone()])
            .await
            .unwrap();

        assert_eq!(chunk1.content_hash, chunk2.content_hash);
        assert_eq!(store.ciphertext_refcount(&chunk1.content_hash), 2);
        assert_eq!(store.ciphertext_copies(&chunk1.content_hash), 1);
    }

    #[tokio::test]
    async fn test_purge_doc_history_gc() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let create1 = fx.entry(EntryType::DocCreate, "doc-1", b"{}", vec![], 100);
        let create2 = fx.entry(EntryType::DocCreate, "doc-2", b"{}", vec![], 100);
        let chunk1 = fx.entry(
            EntryType::AttachmentChunk,
            "doc-1",
            b"shared-bytes",
            vec![create1.id.clone()],
            200,
        );
        let chunk2 = fx.entry(
            EntryType::AttachmentChunk,
            "doc-2",
            b"shared-bytes",
            vec![create2.id.clone()],
            201,
        );
        store
            .put_entries(&[create1, create2, chunk1.clone(), chunk2.clone()])
            .await
            .unwrap();

        store.purge_doc_history("doc-1").await.unwrap();

        // doc-2 and its chunk survive; the shared blob keeps refcount 1
        assert_eq!(store.ciphertext_refcount(&chunk2.content_hash), 1);
        assert!(store
            .get_entries(&[chunk2.id.clone()])
            .await
            .unwrap()
            .len()
            == 1);
        assert!(store
            .get_entries(&[chunk1.id.clone()])
            .await
            .unwrap()
            .is_empty());

        store.purge_doc_history("doc-2").await.unwrap();
        assert_eq!(store.ciphertext_refcount(&chunk2.content_hash), 0);
        assert!(store.get_all_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bloom_cache_invalidated_by_writes() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let before = store.id_bloom_summary().await.unwrap();
        assert_eq!(before.total_ids, 0);

        store.put_entries(&fx.chain("doc-1")).await.unwrap();
        let after = store.id_bloom_summary().await.unwrap();
        assert_eq!(after.total_ids, 3);
    }

    #[tokio::test]
    async fn test_get_attachment_chunk() {
        let fx = Fixture::new();
        let store = MemoryEntryStore::new();
        let create = fx.entry(EntryType::DocCreate, "d", b"{}", vec![], 100);
        let chunk = fx.entry(
            EntryType::AttachmentChunk,
            "d",
            b"chunk-bytes",
            vec![create.id.clone()],
            200,
        );
        store
            .put_entries(&[create.clone(), chunk.clone()])
            .await
            .unwrap();

        let ciphertext = store.get_attachment_chunk(&chunk.id).await.unwrap();
        assert_eq!(ciphertext, chunk.encrypted_data);

        assert!(matches!(
            store.get_attachment_chunk("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.get_attachment_chunk(&create.id).await,
            Err(Error::InvalidArgument(_))
        ));
    }
}

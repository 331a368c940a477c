//! # Encrypted Database Facade
//!
//! The API client code talks to: create documents, mutate them inside a
//! `change_document` callback, attach files, travel in time, and sync
//! with peers. Everything below it is the entry engine — the facade's job
//! is to turn intents into signed, encrypted, content-addressed entries.
//!
//! ## Mutation discipline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      change_document                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   db.change_document(&id, |doc| {                               │
//! │       doc.set("name", "John Doe");        // mutable inside     │
//! │       doc.add_attachment(bytes, ..);      // the callback only  │
//! │       Ok(())                                                    │
//! │   }).await?                                                     │
//! │                                                                 │
//! │   On return: diff against the prior state → one doc_change      │
//! │   entry depending on the document's frontier, plus chunk and    │
//! │   manifest entries for attachment operations, appended in one   │
//! │   atomic batch.                                                 │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The builder is consumed when the callback returns, so mutation outside
//! the callback is impossible by construction. Reentrant changes to the
//! same document fail with `InvalidArgument`.

pub mod attachments;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::crypto::SigningKeyPair;
use crate::directory::{frontier_of, TrustProvider};
use crate::document::{
    assemble, assemble_history, AttachmentManifest, AttachmentRef, ChunkRef, Document,
    DocumentRevision, LwwMerger, StateMerger,
};
use crate::entry::codec::{seal, SealParams};
use crate::entry::{codec, Entry, EntryType};
use crate::error::{Error, Result};
use crate::keybag::{KeyBag, KeyScope};
use crate::store::{EntryStore, HaveSet, ScanCursor};
use crate::sync::{self, LocalPeer, SyncOptions, SyncPeer, SyncResult};

use attachments::{build_attachment_entries, build_removal_entry, locate_range};

/// Entries scanned per page while iterating changes.
const SCAN_PAGE_SIZE: usize = 256;

/// One changed document yielded by [`Database::iterate_changes_since`].
#[derive(Debug, Clone)]
pub struct ChangedDocument {
    pub document: Document,
    /// Resume position: strictly after this document's advancing entry
    pub cursor: ScanCursor,
}

/// An encrypted, content-addressed document database.
pub struct Database {
    store: Arc<dyn EntryStore>,
    keybag: Arc<RwLock<KeyBag>>,
    signer: Arc<SigningKeyPair>,
    merger: Arc<dyn StateMerger>,
    trust: Option<Arc<dyn TrustProvider>>,
    /// Key reference for documents without an explicit binding
    default_key: String,
    /// doc id → key reference recorded by `create_encrypted_document`
    doc_keys: Mutex<HashMap<String, String>>,
    /// Documents handed out by `create_document` but not yet written
    pending: Mutex<HashSet<String>>,
    /// Documents with a change callback in flight (reentrancy guard)
    changing: Arc<Mutex<HashSet<String>>>,
}

impl Database {
    pub fn new(
        store: Arc<dyn EntryStore>,
        keybag: Arc<RwLock<KeyBag>>,
        signer: Arc<SigningKeyPair>,
        default_key_reference: &str,
    ) -> Self {
        Self {
            store,
            keybag,
            signer,
            merger: Arc::new(LwwMerger),
            trust: None,
            default_key: default_key_reference.to_string(),
            doc_keys: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            changing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Verify synced entries against this trust provider.
    pub fn with_trust(mut self, trust: Arc<dyn TrustProvider>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Swap the CRDT merger.
    pub fn with_merger(mut self, merger: Arc<dyn StateMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn store(&self) -> Arc<dyn EntryStore> {
        self.store.clone()
    }

    pub fn keybag(&self) -> Arc<RwLock<KeyBag>> {
        self.keybag.clone()
    }

    /// This database's store as a sync peer (in-process replication).
    pub fn as_peer(&self) -> LocalPeer {
        LocalPeer::new(self.store.clone())
    }

    // ========================================================================
    // DOCUMENT LIFECYCLE
    // ========================================================================

    /// Reserve a new document id. Nothing is written until the first
    /// `change_document`, which emits the `doc_create` entry.
    pub fn create_document(&self) -> String {
        let doc_id = uuid::Uuid::new_v4().to_string();
        self.pending.lock().insert(doc_id.clone());
        doc_id
    }

    /// Reserve a new document bound to a named doc key. All of the
    /// document's entries will encrypt under `doc:<key_id>`.
    pub fn create_encrypted_document(&self, key_id: &str) -> Result<String> {
        let reference = crate::keybag::key_ref(KeyScope::Doc, key_id);
        if self.keybag.read().get(KeyScope::Doc, key_id).is_none() {
            return Err(Error::MissingKey(reference));
        }
        let doc_id = self.create_document();
        self.doc_keys.lock().insert(doc_id.clone(), reference);
        Ok(doc_id)
    }

    /// Mutate a document through a builder passed to the callback.
    ///
    /// The diff against the prior state becomes a `doc_change` entry
    /// depending on the document's current frontier; attachment operations
    /// append their chunk/manifest entries in the same atomic batch.
    pub async fn change_document<F>(&self, doc_id: &str, mutate: F) -> Result<Document>
    where
        F: FnOnce(&mut DocBuilder) -> Result<()>,
    {
        let _guard = self.begin_change(doc_id)?;

        let entries = self.load_doc_entries(doc_id).await?;
        if entries.is_empty() && !self.pending.lock().contains(doc_id) {
            return Err(Error::NotFound(format!("document {}", doc_id)));
        }
        let key_reference = self.key_reference_for(doc_id, &entries);

        let (before, attachment_refs, mut frontier) = if entries.is_empty() {
            (Value::Object(Map::new()), Vec::new(), Vec::new())
        } else {
            let bag = self.keybag.read();
            let assembly = assemble(doc_id, &entries, &bag, self.merger.as_ref(), None)?
                .ok_or_else(|| Error::NotFound(format!("document {}", doc_id)))?;
            if assembly.applied == 0 {
                // Entries exist but none decrypts: explicit mutation is the
                // one place a missing key is fatal
                return Err(Error::MissingKey(key_reference));
            }
            let metadata: Vec<_> = entries.iter().map(|e| e.metadata()).collect();
            (
                assembly.document.data().clone(),
                assembly.document.attachments.clone(),
                frontier_of(&metadata),
            )
        };

        let mut builder = DocBuilder::new(&before, attachment_refs);
        mutate(&mut builder)?;
        let (after, attachment_ops) = builder.finish();

        // Resolve manifests for append/remove ops that refer to attachments
        // persisted before this change (additions in the same callback are
        // found in the batch-local map below).
        let mut external_manifests: HashMap<String, AttachmentManifest> = HashMap::new();
        {
            let mut added: HashSet<String> = HashSet::new();
            for op in &attachment_ops {
                match op {
                    AttachmentOp::Add { attachment_id, .. } => {
                        added.insert(attachment_id.clone());
                    }
                    AttachmentOp::Append { attachment_id, .. }
                    | AttachmentOp::Remove { attachment_id } => {
                        if !added.contains(attachment_id)
                            && !external_manifests.contains_key(attachment_id)
                        {
                            let manifest = self.manifest_from_ref(attachment_id).await?;
                            external_manifests.insert(attachment_id.clone(), manifest);
                        }
                    }
                }
            }
        }

        let now = crate::time::now_timestamp_millis();
        let mut batch: Vec<Entry> = Vec::new();
        {
            let bag = self.keybag.read();

            if entries.is_empty() {
                let create = seal(
                    SealParams {
                        entry_type: EntryType::DocCreate,
                        doc_id,
                        plaintext: b"{}",
                        dependency_ids: vec![],
                        key_reference: &key_reference,
                        created_at: now,
                    },
                    &bag,
                    &self.signer,
                )?;
                frontier = vec![create.id.clone()];
                batch.push(create);
            }

            if let Some(change) = self.merger.diff(&before, &after)? {
                let entry = seal(
                    SealParams {
                        entry_type: EntryType::DocChange,
                        doc_id,
                        plaintext: &change,
                        dependency_ids: frontier.clone(),
                        key_reference: &key_reference,
                        created_at: now,
                    },
                    &bag,
                    &self.signer,
                )?;
                frontier = vec![entry.id.clone()];
                batch.push(entry);
            }

            // Manifests produced earlier in this batch, for append/remove
            // of attachments added within the same callback
            let mut built: HashMap<String, AttachmentManifest> = HashMap::new();
            for op in attachment_ops {
                match op {
                    AttachmentOp::Add {
                        attachment_id,
                        filename,
                        mime,
                        data,
                    } => {
                        let (entries, manifest) = build_attachment_entries(
                            doc_id,
                            &frontier,
                            &attachment_id,
                            &filename,
                            &mime,
                            &data,
                            Vec::new(),
                            &key_reference,
                            &bag,
                            &self.signer,
                            now,
                        )?;
                        frontier = vec![entries.last().expect("manifest entry").id.clone()];
                        built.insert(attachment_id, manifest);
                        batch.extend(entries);
                    }
                    AttachmentOp::Append {
                        attachment_id,
                        data,
                    } => {
                        let existing = match built.get(&attachment_id) {
                            Some(manifest) => manifest.clone(),
                            None => external_manifests
                                .get(&attachment_id)
                                .cloned()
                                .ok_or_else(|| {
                                    Error::NotFound(format!("attachment {}", attachment_id))
                                })?,
                        };
                        let (entries, manifest) = build_attachment_entries(
                            doc_id,
                            &frontier,
                            &attachment_id,
                            &existing.filename,
                            &existing.mime,
                            &data,
                            existing.chunks,
                            &key_reference,
                            &bag,
                            &self.signer,
                            now,
                        )?;
                        frontier = vec![entries.last().expect("manifest entry").id.clone()];
                        built.insert(attachment_id, manifest);
                        batch.extend(entries);
                    }
                    AttachmentOp::Remove { attachment_id } => {
                        let existing = match built.remove(&attachment_id) {
                            Some(manifest) => manifest,
                            None => external_manifests
                                .get(&attachment_id)
                                .cloned()
                                .ok_or_else(|| {
                                    Error::NotFound(format!("attachment {}", attachment_id))
                                })?,
                        };
                        let entry = build_removal_entry(
                            doc_id,
                            &frontier,
                            &existing,
                            &key_reference,
                            &bag,
                            &self.signer,
                            now,
                        )?;
                        frontier = vec![entry.id.clone()];
                        batch.push(entry);
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.store.put_entries(&batch).await?;
            self.pending.lock().remove(doc_id);
        }
        self.get_document(doc_id).await
    }

    /// Emit a `doc_delete` tombstone depending on the current frontier.
    pub async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let _guard = self.begin_change(doc_id)?;
        let entries = self.load_doc_entries(doc_id).await?;
        if entries.is_empty() {
            return Err(Error::NotFound(format!("document {}", doc_id)));
        }
        let key_reference = self.key_reference_for(doc_id, &entries);
        let metadata: Vec<_> = entries.iter().map(|e| e.metadata()).collect();

        let entry = {
            let bag = self.keybag.read();
            seal(
                SealParams {
                    entry_type: EntryType::DocDelete,
                    doc_id,
                    plaintext: b"{}",
                    dependency_ids: frontier_of(&metadata),
                    key_reference: &key_reference,
                    created_at: crate::time::now_timestamp_millis(),
                },
                &bag,
                &self.signer,
            )?
        };
        self.store.put_entries(&[entry]).await
    }

    /// Materialize the current document state.
    pub async fn get_document(&self, doc_id: &str) -> Result<Document> {
        let entries = self.load_doc_entries(doc_id).await?;
        if entries.is_empty() {
            return Err(Error::NotFound(format!("document {}", doc_id)));
        }
        let bag = self.keybag.read();
        let assembly = assemble(doc_id, &entries, &bag, self.merger.as_ref(), None)?
            .ok_or_else(|| Error::NotFound(format!("document {}", doc_id)))?;
        Ok(assembly.document)
    }

    /// Materialize the document as it stood at `timestamp`.
    pub async fn get_document_at_timestamp(
        &self,
        doc_id: &str,
        timestamp: i64,
    ) -> Result<Document> {
        let entries = self.load_doc_entries(doc_id).await?;
        let bag = self.keybag.read();
        assemble(doc_id, &entries, &bag, self.merger.as_ref(), Some(timestamp))?
            .map(|a| a.document)
            .ok_or_else(|| Error::NotFound(format!("document {} at {}", doc_id, timestamp)))
    }

    /// Ids of all readable, undeleted documents.
    pub async fn get_all_document_ids(&self) -> Result<Vec<String>> {
        self.document_ids_at(None).await
    }

    /// Same, as of a timestamp (documents whose state at that time was
    /// deleted are excluded).
    pub async fn get_all_document_ids_at_timestamp(&self, timestamp: i64) -> Result<Vec<String>> {
        self.document_ids_at(Some(timestamp)).await
    }

    async fn document_ids_at(&self, until: Option<i64>) -> Result<Vec<String>> {
        let all = self.store.find_new_entries(&HaveSet::empty()).await?;
        let mut doc_ids: Vec<String> = Vec::new();
        for metadata in &all {
            if !doc_ids.contains(&metadata.doc_id) {
                doc_ids.push(metadata.doc_id.clone());
            }
        }

        let mut out = Vec::new();
        for doc_id in doc_ids {
            let entries = self.load_doc_entries(&doc_id).await?;
            let bag = self.keybag.read();
            if let Some(assembly) =
                assemble(&doc_id, &entries, &bag, self.merger.as_ref(), until)?
            {
                // A document this replica cannot read at all is relayed,
                // not listed
                if assembly.applied > 0 && !assembly.document.is_deleted {
                    out.push(doc_id);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// The document state after each applied entry, oldest first.
    pub async fn iterate_document_history(&self, doc_id: &str) -> Result<Vec<DocumentRevision>> {
        let entries = self.load_doc_entries(doc_id).await?;
        if entries.is_empty() {
            return Err(Error::NotFound(format!("document {}", doc_id)));
        }
        let bag = self.keybag.read();
        assemble_history(doc_id, &entries, &bag, self.merger.as_ref())
    }

    // ========================================================================
    // CHANGE ITERATION
    // ========================================================================

    /// Walk the store's scan order and yield up to `limit` documents whose
    /// frontier advanced past the cursor, each with a resumable position.
    /// Deleted documents are yielded with `is_deleted = true`.
    pub async fn iterate_changes_since(
        &self,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<Vec<ChangedDocument>> {
        let mut order: Vec<String> = Vec::new();
        let mut advancing: HashMap<String, ScanCursor> = HashMap::new();
        let mut scan_cursor = cursor.cloned();
        let mut last_consumed_ts: Option<i64> = None;

        'scan: loop {
            let page = self
                .store
                .scan_entries_since(scan_cursor.as_ref(), SCAN_PAGE_SIZE, None)
                .await?;
            for entry in &page.entries {
                let position = ScanCursor::after(entry.created_at, &entry.id);
                if let Some(current) = advancing.get_mut(&entry.doc_id) {
                    *current = position;
                } else if advancing.len() >= limit
                    && last_consumed_ts.map_or(true, |ts| entry.created_at > ts)
                {
                    // The limit is soft within one timestamp: a document's
                    // batch shares a created_at, and cutting inside the
                    // group would re-yield its docs on resumption
                    break 'scan;
                } else {
                    order.push(entry.doc_id.clone());
                    advancing.insert(entry.doc_id.clone(), position);
                }
                last_consumed_ts = Some(entry.created_at);
            }
            if !page.has_more {
                break;
            }
            scan_cursor = page.next_cursor;
        }

        // Yield in order of each document's advancing entry
        order.sort_by(|a, b| {
            let ka = &advancing[a];
            let kb = &advancing[b];
            (ka.created_at, &ka.id).cmp(&(kb.created_at, &kb.id))
        });

        let mut out = Vec::with_capacity(order.len());
        for doc_id in order {
            let entries = self.load_doc_entries(&doc_id).await?;
            let bag = self.keybag.read();
            if let Some(assembly) =
                assemble(&doc_id, &entries, &bag, self.merger.as_ref(), None)?
            {
                out.push(ChangedDocument {
                    document: assembly.document,
                    cursor: advancing[&doc_id].clone(),
                });
            }
        }
        Ok(out)
    }

    /// Streaming wrapper over [`iterate_changes_since`](Self::iterate_changes_since).
    pub fn changes_stream(
        &self,
        from: Option<ScanCursor>,
    ) -> impl Stream<Item = Result<ChangedDocument>> + '_ {
        async_stream::try_stream! {
            let mut cursor = from;
            loop {
                let events = self.iterate_changes_since(cursor.as_ref(), 32).await?;
                let Some(last) = events.last() else { break };
                cursor = Some(last.cursor.clone());
                for event in events {
                    yield event;
                }
            }
        }
    }

    // ========================================================================
    // ATTACHMENTS
    // ========================================================================

    /// Attach bytes to a document (a `change_document` convenience).
    pub async fn add_attachment(
        &self,
        doc_id: &str,
        data: &[u8],
        filename: &str,
        mime: &str,
    ) -> Result<String> {
        let mut new_id = None;
        self.change_document(doc_id, |doc| {
            new_id = Some(doc.add_attachment(data, filename, mime));
            Ok(())
        })
        .await?;
        Ok(new_id.expect("attachment id recorded"))
    }

    /// Attach a byte stream, chunking and appending incrementally so the
    /// whole attachment never has to sit in memory.
    pub async fn add_attachment_stream<S>(
        &self,
        doc_id: &str,
        mut stream: S,
        filename: &str,
        mime: &str,
    ) -> Result<String>
    where
        S: Stream<Item = Result<Vec<u8>>> + Send + Unpin,
    {
        let _guard = self.begin_change(doc_id)?;

        let entries = self.load_doc_entries(doc_id).await?;
        if entries.is_empty() && !self.pending.lock().contains(doc_id) {
            return Err(Error::NotFound(format!("document {}", doc_id)));
        }
        let key_reference = self.key_reference_for(doc_id, &entries);

        let mut frontier = if entries.is_empty() {
            let create = {
                let bag = self.keybag.read();
                seal(
                    SealParams {
                        entry_type: EntryType::DocCreate,
                        doc_id,
                        plaintext: b"{}",
                        dependency_ids: vec![],
                        key_reference: &key_reference,
                        created_at: crate::time::now_timestamp_millis(),
                    },
                    &bag,
                    &self.signer,
                )?
            };
            let frontier = vec![create.id.clone()];
            self.store.put_entries(&[create]).await?;
            self.pending.lock().remove(doc_id);
            frontier
        } else {
            let metadata: Vec<_> = entries.iter().map(|e| e.metadata()).collect();
            frontier_of(&metadata)
        };

        let attachment_id = uuid::Uuid::new_v4().to_string();
        let mut chunks: Vec<ChunkRef> = Vec::new();
        let mut buffer: Vec<u8> = Vec::with_capacity(attachments::DEFAULT_CHUNK_SIZE);

        let mut flush = |buffer: &mut Vec<u8>, frontier: &[String]| -> Result<Entry> {
            let bag = self.keybag.read();
            let entry = seal(
                SealParams {
                    entry_type: EntryType::AttachmentChunk,
                    doc_id,
                    plaintext: buffer,
                    dependency_ids: frontier.to_vec(),
                    key_reference: &key_reference,
                    created_at: crate::time::now_timestamp_millis(),
                },
                &bag,
                &self.signer,
            )?;
            chunks.push(ChunkRef {
                entry_id: entry.id.clone(),
                size: buffer.len() as u64,
            });
            buffer.clear();
            Ok(entry)
        };

        while let Some(piece) = stream.next().await {
            buffer.extend_from_slice(&piece?);
            while buffer.len() >= attachments::DEFAULT_CHUNK_SIZE {
                let rest = buffer.split_off(attachments::DEFAULT_CHUNK_SIZE);
                let entry = flush(&mut buffer, &frontier)?;
                buffer = rest;
                self.store.put_entries(std::slice::from_ref(&entry)).await?;
            }
        }
        if !buffer.is_empty() {
            let entry = flush(&mut buffer, &frontier)?;
            self.store.put_entries(std::slice::from_ref(&entry)).await?;
        }
        drop(flush);

        if !chunks.is_empty() {
            frontier = chunks.iter().map(|c| c.entry_id.clone()).collect();
            frontier.sort();
            frontier.dedup();
        }
        let manifest = AttachmentManifest {
            attachment_id: attachment_id.clone(),
            filename: filename.to_string(),
            mime: mime.to_string(),
            size: chunks.iter().map(|c| c.size).sum(),
            chunks,
            deleted: false,
        };
        let manifest_entry = {
            let bag = self.keybag.read();
            seal(
                SealParams {
                    entry_type: EntryType::AttachmentManifest,
                    doc_id,
                    plaintext: &serde_json::to_vec(&manifest)?,
                    dependency_ids: frontier,
                    key_reference: &key_reference,
                    created_at: crate::time::now_timestamp_millis(),
                },
                &bag,
                &self.signer,
            )?
        };
        self.store.put_entries(&[manifest_entry]).await?;
        Ok(attachment_id)
    }

    /// Read `[start, end)` of an attachment, decrypting only the spanning
    /// chunks.
    pub async fn get_attachment_range(
        &self,
        attachment_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        let (manifest, _) = self.find_manifest(attachment_id).await?;
        let slices = locate_range(&manifest.chunks, start, end)?;

        let mut needed: Vec<String> = slices
            .iter()
            .map(|s| manifest.chunks[s.chunk_index].entry_id.clone())
            .collect();
        needed.sort();
        needed.dedup();
        let chunk_entries = self.store.get_entries(&needed).await?;
        if chunk_entries.len() != needed.len() {
            return Err(Error::DependencyMissing(
                "attachment chunk missing from store".into(),
            ));
        }
        let mut plaintexts: HashMap<String, Vec<u8>> = HashMap::new();
        {
            let bag = self.keybag.read();
            for entry in &chunk_entries {
                plaintexts.insert(entry.id.clone(), codec::decrypt(entry, &bag)?);
            }
        }

        let mut out = Vec::with_capacity((end - start) as usize);
        for slice in slices {
            let entry_id = &manifest.chunks[slice.chunk_index].entry_id;
            let plaintext = plaintexts
                .get(entry_id)
                .ok_or_else(|| Error::NotFound(format!("attachment chunk {}", entry_id)))?;
            out.extend_from_slice(&plaintext[slice.from..slice.to]);
        }
        Ok(out)
    }

    /// Read a whole attachment.
    pub async fn get_attachment(&self, attachment_id: &str) -> Result<Vec<u8>> {
        let (manifest, _) = self.find_manifest(attachment_id).await?;
        if manifest.size == 0 {
            return Ok(Vec::new());
        }
        self.get_attachment_range(attachment_id, 0, manifest.size)
            .await
    }

    /// Tombstone an attachment with a `deleted` manifest.
    pub async fn remove_attachment(&self, attachment_id: &str) -> Result<()> {
        let (_, doc_id) = self.find_manifest(attachment_id).await?;
        self.change_document(&doc_id, |doc| doc.remove_attachment(attachment_id))
            .await?;
        Ok(())
    }

    /// Append bytes to an attachment: new chunk entries plus a manifest
    /// listing old and new chunks.
    pub async fn append_to_attachment(&self, attachment_id: &str, data: &[u8]) -> Result<()> {
        let (_, doc_id) = self.find_manifest(attachment_id).await?;
        self.change_document(&doc_id, |doc| {
            doc.append_to_attachment(attachment_id, data)
        })
        .await?;
        Ok(())
    }

    // ========================================================================
    // SYNC
    // ========================================================================

    pub async fn pull_changes_from(
        &self,
        peer: &dyn SyncPeer,
        options: &SyncOptions,
    ) -> Result<SyncResult> {
        sync::pull_changes(self.store.as_ref(), peer, self.trust.as_deref(), options).await
    }

    pub async fn push_changes_to(
        &self,
        peer: &dyn SyncPeer,
        options: &SyncOptions,
    ) -> Result<SyncResult> {
        sync::push_changes(self.store.as_ref(), peer, options).await
    }

    /// Pull then push against the same peer.
    pub async fn sync_store_changes(
        &self,
        peer: &dyn SyncPeer,
        options: &SyncOptions,
    ) -> Result<SyncResult> {
        sync::sync_changes(self.store.as_ref(), peer, self.trust.as_deref(), options).await
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn load_doc_entries(&self, doc_id: &str) -> Result<Vec<Entry>> {
        let metadata = self
            .store
            .find_new_entries_for_doc(&HaveSet::empty(), doc_id)
            .await?;
        let ids: Vec<String> = metadata.into_iter().map(|m| m.id).collect();
        self.store.get_entries(&ids).await
    }

    /// The key new entries of this document encrypt under: an explicit
    /// binding, else the key of the newest existing entry, else the
    /// database default.
    fn key_reference_for(&self, doc_id: &str, entries: &[Entry]) -> String {
        if let Some(bound) = self.doc_keys.lock().get(doc_id) {
            return bound.clone();
        }
        entries
            .iter()
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .map(|e| e.decryption_key_id.clone())
            .unwrap_or_else(|| self.default_key.clone())
    }

    fn begin_change(&self, doc_id: &str) -> Result<ChangeGuard> {
        let mut changing = self.changing.lock();
        if !changing.insert(doc_id.to_string()) {
            return Err(Error::InvalidArgument(format!(
                "change already in progress for document {}",
                doc_id
            )));
        }
        Ok(ChangeGuard {
            changing: self.changing.clone(),
            doc_id: doc_id.to_string(),
        })
    }

    /// Find the newest manifest for an attachment id across the database.
    /// Returns the manifest and its owning document.
    async fn find_manifest(&self, attachment_id: &str) -> Result<(AttachmentManifest, String)> {
        let mut candidates = self
            .store
            .find_entries(EntryType::AttachmentManifest, None, None)
            .await?;
        // Newest first: the latest manifest for the id wins
        candidates.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        let ids: Vec<String> = candidates.iter().map(|m| m.id.clone()).collect();
        let entries = self.store.get_entries(&ids).await?;

        let bag = self.keybag.read();
        for entry in &entries {
            let plaintext = match codec::decrypt(entry, &bag) {
                Ok(p) => p,
                Err(Error::MissingKey(_)) => continue,
                Err(e) => return Err(e),
            };
            let manifest: AttachmentManifest = serde_json::from_slice(&plaintext)?;
            if manifest.attachment_id == attachment_id {
                if manifest.deleted {
                    return Err(Error::NotFound(format!("attachment {}", attachment_id)));
                }
                return Ok((manifest, entry.doc_id.clone()));
            }
        }
        Err(Error::NotFound(format!("attachment {}", attachment_id)))
    }

    async fn manifest_from_ref(&self, attachment_id: &str) -> Result<AttachmentManifest> {
        let (manifest, _) = self.find_manifest(attachment_id).await?;
        Ok(manifest)
    }
}

struct ChangeGuard {
    changing: Arc<Mutex<HashSet<String>>>,
    doc_id: String,
}

impl Drop for ChangeGuard {
    fn drop(&mut self) {
        self.changing.lock().remove(&self.doc_id);
    }
}

// ============================================================================
// DOC BUILDER
// ============================================================================

enum AttachmentOp {
    Add {
        attachment_id: String,
        filename: String,
        mime: String,
        data: Vec<u8>,
    },
    Append {
        attachment_id: String,
        data: Vec<u8>,
    },
    Remove {
        attachment_id: String,
    },
}

/// Mutable view of a document, alive only inside the `change_document`
/// callback.
pub struct DocBuilder {
    data: Map<String, Value>,
    attachments: Vec<AttachmentRef>,
    ops: Vec<AttachmentOp>,
}

impl DocBuilder {
    fn new(before: &Value, attachments: Vec<AttachmentRef>) -> Self {
        Self {
            data: before.as_object().cloned().unwrap_or_default(),
            attachments,
            ops: Vec::new(),
        }
    }

    /// Read a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Write a field.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.data.insert(field.to_string(), value.into());
    }

    /// Remove a field.
    pub fn remove(&mut self, field: &str) {
        self.data.remove(field);
    }

    /// The attachments as of the prior state (ops are not reflected).
    pub fn attachments(&self) -> &[AttachmentRef] {
        &self.attachments
    }

    /// Queue an attachment; returns its stable id.
    pub fn add_attachment(&mut self, data: &[u8], filename: &str, mime: &str) -> String {
        let attachment_id = uuid::Uuid::new_v4().to_string();
        self.ops.push(AttachmentOp::Add {
            attachment_id: attachment_id.clone(),
            filename: filename.to_string(),
            mime: mime.to_string(),
            data: data.to_vec(),
        });
        attachment_id
    }

    /// Queue appending bytes to an existing (or just-added) attachment.
    pub fn append_to_attachment(&mut self, attachment_id: &str, data: &[u8]) -> Result<()> {
        if !self.knows_attachment(attachment_id) {
            return Err(Error::NotFound(format!("attachment {}", attachment_id)));
        }
        self.ops.push(AttachmentOp::Append {
            attachment_id: attachment_id.to_string(),
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Queue removal of an existing (or just-added) attachment.
    pub fn remove_attachment(&mut self, attachment_id: &str) -> Result<()> {
        if !self.knows_attachment(attachment_id) {
            return Err(Error::NotFound(format!("attachment {}", attachment_id)));
        }
        self.ops.push(AttachmentOp::Remove {
            attachment_id: attachment_id.to_string(),
        });
        Ok(())
    }

    fn knows_attachment(&self, attachment_id: &str) -> bool {
        self.attachments
            .iter()
            .any(|a| a.attachment_id == attachment_id)
            || self.ops.iter().any(|op| match op {
                AttachmentOp::Add { attachment_id: id, .. } => id == attachment_id,
                _ => false,
            })
    }

    fn finish(self) -> (Value, Vec<AttachmentOp>) {
        (Value::Object(self.data), self.ops)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntryStore;
    use serde_json::json;

    /// A replica: its own store, key bag, and signing identity.
    struct Replica {
        db: Database,
        store: Arc<MemoryEntryStore>,
    }

    impl Replica {
        /// Replica holding the shared doc key `doc:k` plus its own default.
        fn with_keys(keys: &[(&str, [u8; 32])]) -> Self {
            let store = Arc::new(MemoryEntryStore::new());
            let mut bag = KeyBag::new();
            for (key_id, bytes) in keys {
                bag.set(KeyScope::Doc, key_id, bytes, Some(1));
            }
            let db = Database::new(
                store.clone(),
                Arc::new(RwLock::new(bag)),
                Arc::new(SigningKeyPair::generate()),
                "doc:k",
            );
            Self { db, store }
        }

        fn new() -> Self {
            Self::with_keys(&[("k", [9u8; 32])])
        }
    }

    #[tokio::test]
    async fn test_create_and_read_document() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();

        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("name", "John Doe");
                doc.set("email", "john@e.com");
                doc.set("phone", "+1");
                Ok(())
            })
            .await
            .unwrap();

        let ids = replica.db.get_all_document_ids().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0], doc_id);

        let doc = replica.db.get_document(&doc_id).await.unwrap();
        assert_eq!(
            doc.data(),
            &json!({"name": "John Doe", "email": "john@e.com", "phone": "+1"})
        );
    }

    #[tokio::test]
    async fn test_two_peer_sync_and_merge() {
        let a = Replica::new();
        let b = Replica::new();

        let doc_id = a.db.create_document();
        a.db.change_document(&doc_id, |doc| {
            doc.set("name", "John Doe");
            doc.set("email", "john@e.com");
            doc.set("phone", "+1");
            Ok(())
        })
        .await
        .unwrap();

        // B starts empty and pulls everything
        let result = b
            .db
            .pull_changes_from(&a.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();
        assert!(result.transferred_entries > 0);
        assert_eq!(b.db.get_all_document_ids().await.unwrap(), vec![doc_id.clone()]);
        let b_doc = b.db.get_document(&doc_id).await.unwrap();
        assert_eq!(b_doc.get("name").unwrap(), "John Doe");

        // B edits, A pulls back the merged state
        b.db.change_document(&doc_id, |doc| {
            doc.set("name", "John Smith");
            doc.set("address", "123 Main St");
            Ok(())
        })
        .await
        .unwrap();

        a.db.pull_changes_from(&b.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();
        let merged = a.db.get_document(&doc_id).await.unwrap();
        assert_eq!(merged.get("name").unwrap(), "John Smith");
        assert_eq!(merged.get("address").unwrap(), "123 Main St");
        assert_eq!(merged.get("email").unwrap(), "john@e.com");
        assert_eq!(merged.get("phone").unwrap(), "+1");
    }

    #[tokio::test]
    async fn test_keyless_intermediary_relays_without_reading() {
        // A and C share the named key; B holds no doc keys at all
        let a = Replica::with_keys(&[("k", [9u8; 32]), ("shared", [7u8; 32])]);
        let b = Replica::with_keys(&[]);
        let c = Replica::with_keys(&[("k", [9u8; 32]), ("shared", [7u8; 32])]);

        let doc_id = a.db.create_encrypted_document("shared").unwrap();
        a.db.change_document(&doc_id, |doc| {
            doc.set("secret", "for C only");
            Ok(())
        })
        .await
        .unwrap();

        // A → B: sync succeeds, but B cannot list or read the doc
        b.db.pull_changes_from(&a.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();
        assert!(b.db.get_all_document_ids().await.unwrap().is_empty());
        assert!(!b.store.get_all_ids().await.unwrap().is_empty());

        // B → C: C can read the plaintext
        c.db.pull_changes_from(&b.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(c.db.get_all_document_ids().await.unwrap(), vec![doc_id.clone()]);
        let doc = c.db.get_document(&doc_id).await.unwrap();
        assert_eq!(doc.get("secret").unwrap(), "for C only");

        // C edits; the edit relays C → B → A
        c.db.change_document(&doc_id, |doc| {
            doc.set("reply", "thanks");
            Ok(())
        })
        .await
        .unwrap();
        b.db.pull_changes_from(&c.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();
        a.db.pull_changes_from(&b.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();
        let doc = a.db.get_document(&doc_id).await.unwrap();
        assert_eq!(doc.get("reply").unwrap(), "thanks");
    }

    #[tokio::test]
    async fn test_attachment_round_trip_and_range() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("title", "with attachment");
                Ok(())
            })
            .await
            .unwrap();

        let payload: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let attachment_id = replica
            .db
            .add_attachment(&doc_id, &payload, "data.bin", "application/octet-stream")
            .await
            .unwrap();

        let doc = replica.db.get_document(&doc_id).await.unwrap();
        assert_eq!(doc.attachments.len(), 1);
        assert_eq!(doc.attachments[0].filename, "data.bin");
        assert_eq!(doc.attachments[0].size, 1000);

        assert_eq!(replica.db.get_attachment(&attachment_id).await.unwrap(), payload);
        assert_eq!(
            replica
                .db
                .get_attachment_range(&attachment_id, 10, 20)
                .await
                .unwrap(),
            payload[10..20]
        );

        // Boundary behavior: end beyond size and empty ranges fail
        assert!(matches!(
            replica.db.get_attachment_range(&attachment_id, 0, 1001).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            replica.db.get_attachment_range(&attachment_id, 20, 20).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_attachment_dedup_across_documents() {
        let replica = Replica::new();
        let payload = b"same bytes";

        let doc1 = replica.db.create_document();
        replica.db.change_document(&doc1, |_| Ok(())).await.unwrap();
        replica
            .db
            .add_attachment(&doc1, payload, "first.txt", "text/plain")
            .await
            .unwrap();

        let doc2 = replica.db.create_document();
        replica.db.change_document(&doc2, |_| Ok(())).await.unwrap();
        replica
            .db
            .add_attachment(&doc2, payload, "second.txt", "text/plain")
            .await
            .unwrap();

        // The chunk entries share a content hash; ciphertext is stored once
        // with refcount 2
        let chunks = replica
            .store
            .find_entries(EntryType::AttachmentChunk, None, None)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content_hash, chunks[1].content_hash);
        assert_eq!(replica.store.ciphertext_refcount(&chunks[0].content_hash), 2);
        assert_eq!(replica.store.ciphertext_copies(&chunks[0].content_hash), 1);
    }

    #[tokio::test]
    async fn test_append_and_remove_attachment() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica.db.change_document(&doc_id, |_| Ok(())).await.unwrap();

        let attachment_id = replica
            .db
            .add_attachment(&doc_id, b"hello ", "greeting.txt", "text/plain")
            .await
            .unwrap();
        replica
            .db
            .append_to_attachment(&attachment_id, b"world")
            .await
            .unwrap();

        assert_eq!(
            replica.db.get_attachment(&attachment_id).await.unwrap(),
            b"hello world"
        );
        let doc = replica.db.get_document(&doc_id).await.unwrap();
        assert_eq!(doc.attachments[0].size, 11);
        assert_eq!(doc.attachments[0].chunks.len(), 2);

        replica.db.remove_attachment(&attachment_id).await.unwrap();
        let doc = replica.db.get_document(&doc_id).await.unwrap();
        assert!(doc.attachments.is_empty());
        assert!(matches!(
            replica.db.get_attachment(&attachment_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_attachment_stream_chunks_incrementally() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica.db.change_document(&doc_id, |_| Ok(())).await.unwrap();

        // 300 KiB delivered in 64 KiB pieces: 2 chunks (256 + 44)
        let payload = vec![0x42u8; 300 * 1024];
        let pieces: Vec<Result<Vec<u8>>> = payload
            .chunks(64 * 1024)
            .map(|p| Ok(p.to_vec()))
            .collect();
        let stream = futures::stream::iter(pieces);

        let attachment_id = replica
            .db
            .add_attachment_stream(&doc_id, stream, "big.bin", "application/octet-stream")
            .await
            .unwrap();

        let doc = replica.db.get_document(&doc_id).await.unwrap();
        assert_eq!(doc.attachments[0].size, 300 * 1024);
        assert_eq!(doc.attachments[0].chunks.len(), 2);
        assert_eq!(doc.attachments[0].chunks[0].size, 256 * 1024);
        assert_eq!(
            replica.db.get_attachment(&attachment_id).await.unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn test_delete_document() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 1);
                Ok(())
            })
            .await
            .unwrap();

        replica.db.delete_document(&doc_id).await.unwrap();

        assert!(replica.db.get_all_document_ids().await.unwrap().is_empty());
        // The document still materializes, flagged deleted
        let doc = replica.db.get_document(&doc_id).await.unwrap();
        assert!(doc.is_deleted);
    }

    #[tokio::test]
    async fn test_time_travel() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 1);
                Ok(())
            })
            .await
            .unwrap();
        let after_first = crate::time::now_timestamp_millis();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 2);
                Ok(())
            })
            .await
            .unwrap();

        let old = replica
            .db
            .get_document_at_timestamp(&doc_id, after_first)
            .await
            .unwrap();
        assert_eq!(old.get("v").unwrap(), 1);

        let now_doc = replica.db.get_document(&doc_id).await.unwrap();
        assert_eq!(now_doc.get("v").unwrap(), 2);

        // Before creation, the doc does not resolve
        assert!(replica
            .db
            .get_document_at_timestamp(&doc_id, 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_deleted_docs_excluded_at_timestamp() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 1);
                Ok(())
            })
            .await
            .unwrap();
        let before_delete = crate::time::now_timestamp_millis();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        replica.db.delete_document(&doc_id).await.unwrap();

        let then = replica
            .db
            .get_all_document_ids_at_timestamp(before_delete)
            .await
            .unwrap();
        assert_eq!(then, vec![doc_id.clone()]);
        let now = replica.db.get_all_document_ids().await.unwrap();
        assert!(now.is_empty());
    }

    #[tokio::test]
    async fn test_change_unknown_document_fails() {
        let replica = Replica::new();
        let result = replica
            .db
            .change_document("no-such-doc", |doc| {
                doc.set("x", 1);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reentrant_change_fails() {
        let replica = Arc::new(Replica::new());
        let doc_id = replica.db.create_document();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 1);
                Ok(())
            })
            .await
            .unwrap();

        // Hold the change guard open by blocking inside the callback while
        // a second change on the same doc is attempted
        let guard = replica.db.begin_change(&doc_id).unwrap();
        let result = replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 2);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        drop(guard);

        // After the first change completes, the doc is mutable again
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 3);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_noop_change_emits_only_doc_create() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica.db.change_document(&doc_id, |_| Ok(())).await.unwrap();

        let ids = replica.store.get_all_ids().await.unwrap();
        assert_eq!(ids.len(), 1);

        // A second no-op change adds nothing
        replica.db.change_document(&doc_id, |_| Ok(())).await.unwrap();
        assert_eq!(replica.store.get_all_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_resumption_covers_all_docs() {
        let replica = Replica::new();
        let mut expected: Vec<String> = Vec::new();
        for i in 0..500 {
            let doc_id = replica.db.create_document();
            replica
                .db
                .change_document(&doc_id, |doc| {
                    doc.set("n", i);
                    Ok(())
                })
                .await
                .unwrap();
            expected.push(doc_id);
        }
        expected.sort();

        let first = replica.db.iterate_changes_since(None, 200).await.unwrap();
        assert!(first.len() >= 200);
        let resume = first.last().unwrap().cursor.clone();

        let rest = replica
            .db
            .iterate_changes_since(Some(&resume), 1000)
            .await
            .unwrap();

        let mut seen: Vec<String> = first
            .iter()
            .chain(rest.iter())
            .map(|c| c.document.id.clone())
            .collect();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), total, "no duplicates across resumption");
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_iterate_changes_yields_deleted_docs() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 1);
                Ok(())
            })
            .await
            .unwrap();
        replica.db.delete_document(&doc_id).await.unwrap();

        let events = replica.db.iterate_changes_since(None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].document.is_deleted);
    }

    #[tokio::test]
    async fn test_changes_stream_walks_everything() {
        let replica = Replica::new();
        for i in 0..40 {
            let doc_id = replica.db.create_document();
            replica
                .db
                .change_document(&doc_id, |doc| {
                    doc.set("n", i);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let stream = replica.db.changes_stream(None);
        futures::pin_mut!(stream);
        let mut count = 0;
        while let Some(event) = stream.next().await {
            event.unwrap();
            count += 1;
        }
        assert_eq!(count, 40);
    }

    #[tokio::test]
    async fn test_document_history() {
        let replica = Replica::new();
        let doc_id = replica.db.create_document();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 1);
                Ok(())
            })
            .await
            .unwrap();
        replica
            .db
            .change_document(&doc_id, |doc| {
                doc.set("v", 2);
                doc.set("w", true);
                Ok(())
            })
            .await
            .unwrap();

        let history = replica.db.iterate_document_history(&doc_id).await.unwrap();
        // create + change, change
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].document.get("v").unwrap(), 1);
        assert_eq!(history[2].document.get("v").unwrap(), 2);
        assert_eq!(history[2].document.get("w").unwrap(), true);
    }

    #[tokio::test]
    async fn test_create_encrypted_document_requires_key() {
        let replica = Replica::new();
        assert!(matches!(
            replica.db.create_encrypted_document("absent"),
            Err(Error::MissingKey(_))
        ));
    }

    #[tokio::test]
    async fn test_change_without_any_key_is_fatal() {
        // B pulls an encrypted doc it cannot read, then tries to edit it
        let a = Replica::with_keys(&[("k", [9u8; 32]), ("shared", [7u8; 32])]);
        let b = Replica::with_keys(&[]);

        let doc_id = a.db.create_encrypted_document("shared").unwrap();
        a.db.change_document(&doc_id, |doc| {
            doc.set("x", 1);
            Ok(())
        })
        .await
        .unwrap();
        b.db.pull_changes_from(&a.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();

        let result = b
            .db
            .change_document(&doc_id, |doc| {
                doc.set("y", 2);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::MissingKey(_))));
    }

    #[tokio::test]
    async fn test_synced_doc_keeps_its_key_binding() {
        // C edits a doc created by A under a named key; C's entries must
        // encrypt under the same key even without an explicit binding
        let a = Replica::with_keys(&[("k", [9u8; 32]), ("shared", [7u8; 32])]);
        let c = Replica::with_keys(&[("k", [1u8; 32]), ("shared", [7u8; 32])]);

        let doc_id = a.db.create_encrypted_document("shared").unwrap();
        a.db.change_document(&doc_id, |doc| {
            doc.set("from", "a");
            Ok(())
        })
        .await
        .unwrap();
        c.db.pull_changes_from(&a.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();

        c.db.change_document(&doc_id, |doc| {
            doc.set("from", "c");
            Ok(())
        })
        .await
        .unwrap();

        // A pulls C's edit and can still read it (same named key)
        a.db.pull_changes_from(&c.db.as_peer(), &SyncOptions::default())
            .await
            .unwrap();
        let doc = a.db.get_document(&doc_id).await.unwrap();
        assert_eq!(doc.get("from").unwrap(), "c");
    }
}

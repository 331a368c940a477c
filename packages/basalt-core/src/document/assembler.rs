//! # Document Assembler
//!
//! Folds an unordered batch of one document's entries into a materialized
//! [`Document`].
//!
//! ## Algorithm
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     DOCUMENT ASSEMBLY                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  1. Drop entries newer than the time-travel cutoff (if any)     │
//! │  2. Topologically sort by dependencies (Kahn's algorithm,       │
//! │     ties broken by (created_at, id))                            │
//! │  3. Fold:                                                       │
//! │       doc_create    → fresh state, record created_at            │
//! │       doc_snapshot  → replace state wholesale                   │
//! │       doc_change    → merge via the state merger                │
//! │       doc_delete    → is_deleted = true (stays true)            │
//! │       manifest      → supersede attachment by attachment_id     │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An entry whose symmetric key is absent from the bag is *skipped*, not
//! an error: a keyless intermediary still assembles (an empty view of)
//! the document while relaying the full ciphertext chain.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::document::{AttachmentManifest, AttachmentRef, Document};
use crate::entry::{codec, Entry, EntryType};
use crate::error::{Error, Result};
use crate::keybag::{self, KeyBag};

use super::merger::{ChangeStamp, StateMerger};

/// The result of assembling a document.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub document: Document,
    /// Entries whose plaintext contributed to (or was verified against)
    /// the document
    pub applied: usize,
    /// Entries retained in the store but skipped for lack of a key
    pub skipped: usize,
}

/// One step of a document's history.
#[derive(Debug, Clone)]
pub struct DocumentRevision {
    /// Document state after this entry was applied
    pub document: Document,
    pub change_created_at: i64,
    pub change_created_by: String,
}

/// Assemble the document state from its entries, optionally only those
/// with `created_at <= until` (time travel). Returns `None` when no entry
/// survives the cutoff.
pub fn assemble(
    doc_id: &str,
    entries: &[Entry],
    keybag: &KeyBag,
    merger: &dyn StateMerger,
    until: Option<i64>,
) -> Result<Option<Assembly>> {
    let mut folder = match Folder::new(doc_id, entries, keybag, merger, until)? {
        Some(f) => f,
        None => return Ok(None),
    };
    folder.run()?;
    Ok(Some(folder.finish()?))
}

/// Assemble step by step, yielding the document state after each applied
/// entry in topological order.
pub fn assemble_history(
    doc_id: &str,
    entries: &[Entry],
    keybag: &KeyBag,
    merger: &dyn StateMerger,
) -> Result<Vec<DocumentRevision>> {
    let selected: Vec<Entry> = entries.iter().filter(|e| e.doc_id == doc_id).cloned().collect();
    if selected.is_empty() {
        return Ok(Vec::new());
    }
    let order = topological_sort(&selected)?;

    // Fold cutting after each step to materialize the intermediate states.
    // History is an occasional debugging surface; clarity beats avoiding
    // the quadratic fold.
    let mut out = Vec::new();
    for step in 1..=order.len() {
        let last = &order[step - 1];
        if last.entry_type == EntryType::AttachmentChunk {
            continue;
        }
        if matches!(codec::decrypt(last, keybag), Err(Error::MissingKey(_))) {
            continue;
        }
        if let Some(assembly) = assemble(doc_id, &order[..step], keybag, merger, None)? {
            out.push(DocumentRevision {
                document: assembly.document,
                change_created_at: last.created_at,
                change_created_by: last.created_by.clone(),
            });
        }
    }
    Ok(out)
}

/// Topological sort by dependency edges, ties broken by (created_at, id).
///
/// Dependencies that are not part of the input set are treated as already
/// satisfied — clock skew can push a time-travel cutoff between an entry
/// and its dependency.
pub fn topological_sort(entries: &[Entry]) -> Result<Vec<Entry>> {
    let by_id: HashMap<&str, &Entry> = entries.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for entry in entries {
        let local_deps = entry
            .dependency_ids
            .iter()
            .filter(|dep| by_id.contains_key(dep.as_str()))
            .count();
        in_degree.insert(&entry.id, local_deps);
        for dep in &entry.dependency_ids {
            if by_id.contains_key(dep.as_str()) {
                dependents.entry(dep.as_str()).or_default().push(&entry.id);
            }
        }
    }

    let mut ready: BTreeSet<(i64, &str)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| (by_id[*id].created_at, *id))
        .collect();

    let mut out = Vec::with_capacity(entries.len());
    while let Some((created_at, id)) = ready.iter().next().copied() {
        ready.remove(&(created_at, id));
        out.push(by_id[id].clone());
        for dependent in dependents.get(id).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent).expect("degree exists");
            *degree -= 1;
            if *degree == 0 {
                ready.insert((by_id[dependent].created_at, dependent));
            }
        }
    }

    if out.len() != entries.len() {
        return Err(Error::Corruption(
            "dependency cycle in document entries".into(),
        ));
    }
    Ok(out)
}

struct Folder<'a> {
    keybag: &'a KeyBag,
    merger: &'a dyn StateMerger,
    order: Vec<Entry>,
    known_ids: HashSet<String>,
    state: Vec<u8>,
    document: Document,
    applied: usize,
    skipped: usize,
    attachments: BTreeMap<String, AttachmentRef>,
}

impl<'a> Folder<'a> {
    fn new(
        doc_id: &str,
        entries: &[Entry],
        keybag: &'a KeyBag,
        merger: &'a dyn StateMerger,
        until: Option<i64>,
    ) -> Result<Option<Self>> {
        let selected: Vec<Entry> = entries
            .iter()
            .filter(|e| e.doc_id == doc_id)
            .filter(|e| until.map_or(true, |t| e.created_at <= t))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Ok(None);
        }

        let known_ids = selected.iter().map(|e| e.id.clone()).collect();
        let order = topological_sort(&selected)?;
        let mut document = Document::new(doc_id.to_string());
        document.created_at = order.first().map(|e| e.created_at).unwrap_or(0);

        Ok(Some(Self {
            keybag,
            merger,
            order,
            known_ids,
            state: merger.init()?,
            document,
            applied: 0,
            skipped: 0,
            attachments: BTreeMap::new(),
        }))
    }

    fn run(&mut self) -> Result<()> {
        let order = self.order.clone();
        for entry in &order {
            if self.apply(entry)? {
                self.applied += 1;
                self.document.last_modified = self.document.last_modified.max(entry.created_at);
            } else {
                self.skipped += 1;
            }
        }
        Ok(())
    }

    /// Apply one entry; returns whether it contributed.
    fn apply(&mut self, entry: &Entry) -> Result<bool> {
        // Chunks carry no document state; checking key presence decides
        // whether this replica can read the attachment at all.
        if entry.entry_type == EntryType::AttachmentChunk {
            let (scope, key_id) = keybag::parse_key_ref(&entry.decryption_key_id)?;
            return Ok(self.keybag.get(scope, key_id).is_some());
        }

        let plaintext = match codec::decrypt(entry, self.keybag) {
            Ok(p) => p,
            Err(Error::MissingKey(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        match entry.entry_type {
            EntryType::DocCreate => {
                self.state = self.merger.init()?;
                self.document.created_at = entry.created_at;
            }
            EntryType::DocSnapshot => {
                for dep in &entry.dependency_ids {
                    if !self.known_ids.contains(dep) {
                        return Err(Error::DependencyMissing(dep.clone()));
                    }
                }
                self.state = plaintext;
            }
            EntryType::DocChange => {
                self.state = self.merger.apply(
                    &self.state,
                    &plaintext,
                    &ChangeStamp {
                        at: entry.created_at,
                        by: entry.id.clone(),
                    },
                )?;
            }
            EntryType::DocDelete => {
                self.document.is_deleted = true;
            }
            EntryType::AttachmentManifest => {
                let manifest: AttachmentManifest = serde_json::from_slice(&plaintext)?;
                if manifest.deleted {
                    self.attachments.remove(&manifest.attachment_id);
                } else {
                    self.attachments
                        .insert(manifest.attachment_id.clone(), manifest.to_ref());
                }
            }
            EntryType::AttachmentChunk => unreachable!("handled above"),
            // Directory admin entries carry no document state
            EntryType::GrantAccess | EntryType::RevokeAccess => {}
        }
        Ok(true)
    }

    fn finish(mut self) -> Result<Assembly> {
        self.document.set_data(self.merger.data(&self.state)?);
        self.document.attachments = self.attachments.into_values().collect();
        Ok(Assembly {
            document: self.document,
            applied: self.applied,
            skipped: self.skipped,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

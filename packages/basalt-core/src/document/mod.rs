//! # Documents
//!
//! A document is never stored as an object — it is the fold of its entry
//! chain, materialized on demand by the [`assembler`]. This module holds
//! the materialized shape plus the plaintext payload types that entries
//! carry.

pub mod assembler;
pub mod merger;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use assembler::{assemble, assemble_history, Assembly, DocumentRevision};
pub use merger::{ChangeStamp, LwwMerger, StateMerger};

/// A materialized document: an independent snapshot owned by the caller.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub created_at: i64,
    pub last_modified: i64,
    pub is_deleted: bool,
    data: Value,
    pub attachments: Vec<AttachmentRef>,
}

impl Document {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            created_at: 0,
            last_modified: 0,
            is_deleted: false,
            data: Value::Object(Default::default()),
            attachments: Vec::new(),
        }
    }

    /// The merged document state.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// One field of the document state.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Look up an attachment by its stable id.
    pub fn attachment(&self, attachment_id: &str) -> Option<&AttachmentRef> {
        self.attachments
            .iter()
            .find(|a| a.attachment_id == attachment_id)
    }

    pub(crate) fn set_data(&mut self, data: Value) {
        self.data = data;
    }
}

/// Reference to one attachment, reconstructed from its newest manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Random id, stable across appends and re-manifests
    pub attachment_id: String,
    pub filename: String,
    pub mime: String,
    /// Total attachment size in bytes
    pub size: u64,
    /// Ordered chunk list
    pub chunks: Vec<ChunkRef>,
}

/// One chunk inside an attachment manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Entry id of the `attachment_chunk` entry
    pub entry_id: String,
    /// Plaintext size of this chunk
    pub size: u64,
}

/// Plaintext payload of an `attachment_manifest` entry.
///
/// A manifest supersedes any earlier manifest with the same
/// `attachment_id`; a manifest with `deleted = true` removes the
/// attachment from the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentManifest {
    pub attachment_id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub chunks: Vec<ChunkRef>,
    #[serde(default)]
    pub deleted: bool,
}

impl AttachmentManifest {
    pub fn to_ref(&self) -> AttachmentRef {
        AttachmentRef {
            attachment_id: self.attachment_id.clone(),
            filename: self.filename.clone(),
            mime: self.mime.clone(),
            size: self.size,
            chunks: self.chunks.clone(),
        }
    }
}

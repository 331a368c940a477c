//! # Attachment Chunking
//!
//! Attachments are stored as a sequence of content-addressed
//! `attachment_chunk` entries plus one `attachment_manifest` listing them.
//! Chunks split at a fixed 256 KiB boundary and encrypt deterministically,
//! so identical chunks deduplicate across attachments and documents.

use crate::crypto::SigningKeyPair;
use crate::document::{AttachmentManifest, ChunkRef};
use crate::entry::codec::{seal, SealParams};
use crate::entry::{Entry, EntryType};
use crate::error::{Error, Result};
use crate::keybag::KeyBag;

/// Chunk boundary: 256 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Build the chunk entries and manifest for an attachment's bytes.
///
/// Chunk entries depend on the document frontier; the manifest depends on
/// its chunks (or the frontier for an empty attachment), so replicating
/// the manifest always drags the chunk bytes along.
#[allow(clippy::too_many_arguments)]
pub fn build_attachment_entries(
    doc_id: &str,
    frontier: &[String],
    attachment_id: &str,
    filename: &str,
    mime: &str,
    data: &[u8],
    existing_chunks: Vec<ChunkRef>,
    key_reference: &str,
    keybag: &KeyBag,
    signer: &SigningKeyPair,
    created_at: i64,
) -> Result<(Vec<Entry>, AttachmentManifest)> {
    let mut entries = Vec::new();
    let mut chunks = existing_chunks;

    for window in data.chunks(DEFAULT_CHUNK_SIZE) {
        let entry = seal(
            SealParams {
                entry_type: EntryType::AttachmentChunk,
                doc_id,
                plaintext: window,
                dependency_ids: frontier.to_vec(),
                key_reference,
                created_at,
            },
            keybag,
            signer,
        )?;
        chunks.push(ChunkRef {
            entry_id: entry.id.clone(),
            size: window.len() as u64,
        });
        entries.push(entry);
    }

    let manifest = AttachmentManifest {
        attachment_id: attachment_id.to_string(),
        filename: filename.to_string(),
        mime: mime.to_string(),
        size: chunks.iter().map(|c| c.size).sum(),
        chunks,
        deleted: false,
    };

    let manifest_deps: Vec<String> = if entries.is_empty() {
        frontier.to_vec()
    } else {
        entries.iter().map(|e| e.id.clone()).collect()
    };
    let manifest_entry = seal(
        SealParams {
            entry_type: EntryType::AttachmentManifest,
            doc_id,
            plaintext: &serde_json::to_vec(&manifest)?,
            dependency_ids: manifest_deps,
            key_reference,
            created_at,
        },
        keybag,
        signer,
    )?;
    entries.push(manifest_entry);

    Ok((entries, manifest))
}

/// Build a tombstone manifest marking the attachment deleted.
pub fn build_removal_entry(
    doc_id: &str,
    frontier: &[String],
    existing: &AttachmentManifest,
    key_reference: &str,
    keybag: &KeyBag,
    signer: &SigningKeyPair,
    created_at: i64,
) -> Result<Entry> {
    let tombstone = AttachmentManifest {
        deleted: true,
        chunks: Vec::new(),
        size: 0,
        ..existing.clone()
    };
    seal(
        SealParams {
            entry_type: EntryType::AttachmentManifest,
            doc_id,
            plaintext: &serde_json::to_vec(&tombstone)?,
            dependency_ids: frontier.to_vec(),
            key_reference,
            created_at,
        },
        keybag,
        signer,
    )
}

/// One chunk's contribution to a byte range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlice {
    /// Index into the manifest's chunk list
    pub chunk_index: usize,
    /// Byte range within the decrypted chunk
    pub from: usize,
    pub to: usize,
}

/// Locate the chunks spanning `[start, end)` of an attachment.
///
/// Fails when the range is empty or reaches past the attachment size.
pub fn locate_range(chunks: &[ChunkRef], start: u64, end: u64) -> Result<Vec<ChunkSlice>> {
    let total: u64 = chunks.iter().map(|c| c.size).sum();
    if start >= end {
        return Err(Error::InvalidArgument(format!(
            "empty attachment range: {}..{}",
            start, end
        )));
    }
    if end > total {
        return Err(Error::InvalidArgument(format!(
            "attachment range {}..{} exceeds size {}",
            start, end, total
        )));
    }

    let mut slices = Vec::new();
    let mut offset: u64 = 0;
    for (chunk_index, chunk) in chunks.iter().enumerate() {
        let chunk_end = offset + chunk.size;
        if chunk_end > start && offset < end {
            let from = start.saturating_sub(offset) as usize;
            let to = (end.min(chunk_end) - offset) as usize;
            slices.push(ChunkSlice {
                chunk_index,
                from,
                to,
            });
        }
        offset = chunk_end;
        if offset >= end {
            break;
        }
    }
    Ok(slices)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(sizes: &[u64]) -> Vec<ChunkRef> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| ChunkRef {
                entry_id: format!("chunk-{}", i),
                size: *size,
            })
            .collect()
    }

    #[test]
    fn test_locate_range_within_one_chunk() {
        let slices = locate_range(&chunks(&[10, 10, 10]), 12, 18).unwrap();
        assert_eq!(
            slices,
            vec![ChunkSlice {
                chunk_index: 1,
                from: 2,
                to: 8
            }]
        );
    }

    #[test]
    fn test_locate_range_spanning_chunks() {
        let slices = locate_range(&chunks(&[10, 10, 10]), 5, 25).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0], ChunkSlice { chunk_index: 0, from: 5, to: 10 });
        assert_eq!(slices[1], ChunkSlice { chunk_index: 1, from: 0, to: 10 });
        assert_eq!(slices[2], ChunkSlice { chunk_index: 2, from: 0, to: 5 });
    }

    #[test]
    fn test_locate_range_full() {
        let slices = locate_range(&chunks(&[10, 5]), 0, 15).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1].to, 5);
    }

    #[test]
    fn test_locate_range_rejects_bad_bounds() {
        let refs = chunks(&[10, 10]);
        assert!(matches!(
            locate_range(&refs, 5, 5),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            locate_range(&refs, 8, 3),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            locate_range(&refs, 0, 21),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_build_attachment_entries_chunking() {
        use crate::keybag::{KeyBag, KeyScope};
        let mut bag = KeyBag::new();
        bag.set(KeyScope::Doc, "k", &[1u8; 32], Some(1));
        let signer = SigningKeyPair::generate();

        // 600 KiB → 3 chunks (256 + 256 + 88)
        let data = vec![0x5au8; 600 * 1024];
        let (entries, manifest) = build_attachment_entries(
            "d",
            &["root".to_string()],
            "att-1",
            "blob.bin",
            "application/octet-stream",
            &data,
            Vec::new(),
            "doc:k",
            &bag,
            &signer,
            1000,
        )
        .unwrap();

        // 3 chunks + 1 manifest
        assert_eq!(entries.len(), 4);
        assert_eq!(manifest.chunks.len(), 3);
        assert_eq!(manifest.size, 600 * 1024);
        assert_eq!(manifest.chunks[0].size, 256 * 1024);
        assert_eq!(manifest.chunks[2].size, 88 * 1024);
        // All-identical content: the two full 256 KiB chunks are the same
        // content-addressed entry, listed twice in the manifest layout
        assert_eq!(entries[0].content_hash, entries[1].content_hash);
        assert_eq!(entries[0].id, entries[1].id);
        assert_eq!(manifest.chunks[0].entry_id, manifest.chunks[1].entry_id);
    }
}

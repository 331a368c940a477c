//! # Id Bloom Summary
//!
//! Compact probabilistic digest of a store's id set, exchanged during sync
//! so a replica can say "here is (roughly) what I have" without shipping
//! every id.
//!
//! The filter parameters are fixed constants — including the SipHash keys —
//! so any replica can rebuild a queryable filter from nothing but the
//! bitset. A false positive makes the sender skip an entry the receiver
//! actually lacks; the sync engine's dependency-resolution pass fetches it
//! when some dependent arrives.

use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};

use crate::entry::base64_bytes;

/// Summary format version
pub const BLOOM_VERSION: u32 = 1;

/// Hash functions per item (targets ~1% false positives at 10 bits/item)
const K_NUM: u32 = 7;

/// Bits per item
const BITS_PER_ID: usize = 10;

/// Fixed SipHash keys: every replica must derive identical filters
const SIP_KEYS: [(u64, u64); 2] = [
    (0x7062_6173_616c_7431, 0x6964_626c_6f6f_6d31),
    (0x7062_6173_616c_7432, 0x6964_626c_6f6f_6d32),
];

/// A serialized bloom digest of an id set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdBloomSummary {
    pub version: u32,
    pub total_ids: u64,
    #[serde(rename = "bitsetBase64", with = "base64_bytes")]
    pub bitset: Vec<u8>,
}

impl IdBloomSummary {
    /// Build a summary over a set of ids.
    pub fn build<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        if ids.is_empty() {
            return Self {
                version: BLOOM_VERSION,
                total_ids: 0,
                bitset: Vec::new(),
            };
        }

        let bitmap_bytes = (ids.len() * BITS_PER_ID).div_ceil(8).max(1);
        let mut bloom: Bloom<String> = Bloom::from_existing(
            &vec![0u8; bitmap_bytes],
            (bitmap_bytes * 8) as u64,
            K_NUM,
            SIP_KEYS,
        );
        for id in &ids {
            bloom.set(id);
        }

        Self {
            version: BLOOM_VERSION,
            total_ids: ids.len() as u64,
            bitset: bloom.bitmap(),
        }
    }

    /// Whether the summarized set (probably) contains `id`.
    ///
    /// An empty summary contains nothing.
    pub fn contains(&self, id: &str) -> bool {
        if self.total_ids == 0 || self.bitset.is_empty() {
            return false;
        }
        let bloom: Bloom<String> = Bloom::from_existing(
            &self.bitset,
            (self.bitset.len() * 8) as u64,
            K_NUM,
            SIP_KEYS,
        );
        bloom.check(&id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let summary = IdBloomSummary::build(Vec::<String>::new());
        assert_eq!(summary.total_ids, 0);
        assert!(summary.bitset.is_empty());
        assert!(!summary.contains("anything"));
    }

    #[test]
    fn test_members_are_found() {
        let ids: Vec<String> = (0..200).map(|i| format!("entry-{:04}", i)).collect();
        let summary = IdBloomSummary::build(&ids);

        assert_eq!(summary.total_ids, 200);
        for id in &ids {
            assert!(summary.contains(id), "bloom lost member {}", id);
        }
    }

    #[test]
    fn test_false_positive_rate_is_plausible() {
        let ids: Vec<String> = (0..1000).map(|i| format!("member-{}", i)).collect();
        let summary = IdBloomSummary::build(&ids);

        let false_positives = (0..1000)
            .map(|i| format!("stranger-{}", i))
            .filter(|id| summary.contains(id))
            .count();
        // 1% target; allow generous slack to keep the test stable
        assert!(
            false_positives < 60,
            "false positive count too high: {}",
            false_positives
        );
    }

    #[test]
    fn test_summary_survives_serialization() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let summary = IdBloomSummary::build(&ids);

        let json = serde_json::to_string(&summary).unwrap();
        let restored: IdBloomSummary = serde_json::from_str(&json).unwrap();

        for id in &ids {
            assert!(restored.contains(id));
        }
        assert_eq!(restored.total_ids, 3);
    }
}

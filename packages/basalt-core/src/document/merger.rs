//! # State Merger
//!
//! The CRDT engine behind document reconstruction, held at a capability
//! boundary: the assembler only ever sees opaque state bytes and change
//! payloads, so the merge strategy can be swapped without touching the
//! entry engine.
//!
//! The default merger is a last-writer-wins field map. Every field carries
//! a `(timestamp, entry id)` stamp; merging keeps the greater stamp. The
//! stamp order is total (ids are unique), which makes the merge
//! commutative, associative, and idempotent — any permutation of the same
//! entry set folds to the same state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The stamp a change carries: the entry's creation time, tie-broken by
/// the entry id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChangeStamp {
    pub at: i64,
    pub by: String,
}

/// Pluggable convergent-merge engine.
///
/// State bytes are self-contained: they double as `doc_snapshot` payloads,
/// so `serialize(state)` is the identity and deserialization happens in
/// [`apply`](Self::apply)/[`data`](Self::data).
pub trait StateMerger: Send + Sync {
    /// Fresh empty state.
    fn init(&self) -> Result<Vec<u8>>;

    /// Fold one change payload into the state.
    fn apply(&self, state: &[u8], change: &[u8], stamp: &ChangeStamp) -> Result<Vec<u8>>;

    /// Compute the change payload that turns `before` into `after`, or
    /// `None` when they are equal.
    fn diff(&self, before: &Value, after: &Value) -> Result<Option<Vec<u8>>>;

    /// The user-facing document data for a state.
    fn data(&self, state: &[u8]) -> Result<Value>;
}

/// Plaintext payload of a `doc_change` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Fields written (or overwritten)
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    /// Fields removed
    #[serde(default)]
    pub remove: Vec<String>,
}

impl ChangePayload {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// One field with its winning stamp. `value = None` is a removal
/// tombstone — it must keep competing on stamps, otherwise a late
/// concurrent write could never lose to the removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FieldStamp {
    value: Option<Value>,
    at: i64,
    by: String,
}

/// Serialized merge state of the LWW merger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LwwState {
    fields: BTreeMap<String, FieldStamp>,
}

/// Last-writer-wins field map, the default merger.
#[derive(Debug, Clone, Copy, Default)]
pub struct LwwMerger;

impl LwwMerger {
    fn decode_state(state: &[u8]) -> Result<LwwState> {
        serde_json::from_slice(state)
            .map_err(|e| Error::Corruption(format!("malformed merge state: {}", e)))
    }

    fn encode_state(state: &LwwState) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }
}

impl StateMerger for LwwMerger {
    fn init(&self) -> Result<Vec<u8>> {
        Self::encode_state(&LwwState::default())
    }

    fn apply(&self, state: &[u8], change: &[u8], stamp: &ChangeStamp) -> Result<Vec<u8>> {
        let mut state = Self::decode_state(state)?;
        let change: ChangePayload = serde_json::from_slice(change)
            .map_err(|e| Error::Corruption(format!("malformed change payload: {}", e)))?;

        let mut write = |field: &str, value: Option<Value>| {
            let incoming = FieldStamp {
                value,
                at: stamp.at,
                by: stamp.by.clone(),
            };
            match state.fields.get(field) {
                Some(existing)
                    if (existing.at, existing.by.as_str())
                        >= (incoming.at, incoming.by.as_str()) => {}
                _ => {
                    state.fields.insert(field.to_string(), incoming);
                }
            }
        };

        for (field, value) in &change.set {
            write(field, Some(value.clone()));
        }
        for field in &change.remove {
            write(field, None);
        }

        Self::encode_state(&state)
    }

    fn diff(&self, before: &Value, after: &Value) -> Result<Option<Vec<u8>>> {
        let empty = Map::new();
        let before = before.as_object().unwrap_or(&empty);
        let after = after
            .as_object()
            .ok_or_else(|| Error::InvalidArgument("document data must be a JSON object".into()))?;

        let mut change = ChangePayload::default();
        for (field, value) in after {
            if before.get(field) != Some(value) {
                change.set.insert(field.clone(), value.clone());
            }
        }
        for field in before.keys() {
            if !after.contains_key(field) {
                change.remove.push(field.clone());
            }
        }
        change.remove.sort();

        if change.is_empty() {
            Ok(None)
        } else {
            Ok(Some(serde_json::to_vec(&change)?))
        }
    }

    fn data(&self, state: &[u8]) -> Result<Value> {
        let state = Self::decode_state(state)?;
        let mut map = Map::new();
        for (field, stamp) in state.fields {
            if let Some(value) = stamp.value {
                map.insert(field, value);
            }
        }
        Ok(Value::Object(map))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stamp(at: i64, by: &str) -> ChangeStamp {
        ChangeStamp {
            at,
            by: by.to_string(),
        }
    }

    fn change(set: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "set": set })).unwrap()
    }

    #[test]
    fn test_apply_and_read_back() {
        let merger = LwwMerger;
        let state = merger.init().unwrap();
        let state = merger
            .apply(&state, &change(json!({"name": "John"})), &stamp(1, "a"))
            .unwrap();

        assert_eq!(merger.data(&state).unwrap(), json!({"name": "John"}));
    }

    #[test]
    fn test_later_stamp_wins() {
        let merger = LwwMerger;
        let state = merger.init().unwrap();
        let state = merger
            .apply(&state, &change(json!({"name": "Old"})), &stamp(1, "a"))
            .unwrap();
        let state = merger
            .apply(&state, &change(json!({"name": "New"})), &stamp(2, "b"))
            .unwrap();

        assert_eq!(merger.data(&state).unwrap()["name"], "New");
    }

    #[test]
    fn test_earlier_stamp_loses_regardless_of_apply_order() {
        let merger = LwwMerger;
        let state = merger.init().unwrap();
        let state = merger
            .apply(&state, &change(json!({"name": "New"})), &stamp(2, "b"))
            .unwrap();
        let state = merger
            .apply(&state, &change(json!({"name": "Old"})), &stamp(1, "a"))
            .unwrap();

        assert_eq!(merger.data(&state).unwrap()["name"], "New");
    }

    #[test]
    fn test_equal_timestamp_tie_broken_by_id() {
        let merger = LwwMerger;
        let forward = {
            let s = merger.init().unwrap();
            let s = merger
                .apply(&s, &change(json!({"x": "from-a"})), &stamp(5, "aaa"))
                .unwrap();
            merger
                .apply(&s, &change(json!({"x": "from-z"})), &stamp(5, "zzz"))
                .unwrap()
        };
        let backward = {
            let s = merger.init().unwrap();
            let s = merger
                .apply(&s, &change(json!({"x": "from-z"})), &stamp(5, "zzz"))
                .unwrap();
            merger
                .apply(&s, &change(json!({"x": "from-a"})), &stamp(5, "aaa"))
                .unwrap()
        };

        assert_eq!(
            merger.data(&forward).unwrap(),
            merger.data(&backward).unwrap()
        );
        assert_eq!(merger.data(&forward).unwrap()["x"], "from-z");
    }

    #[test]
    fn test_concurrent_edits_of_different_fields_both_survive() {
        let merger = LwwMerger;
        let state = merger.init().unwrap();
        let state = merger
            .apply(
                &state,
                &change(json!({"name": "John Smith", "address": "123 Main St"})),
                &stamp(10, "b"),
            )
            .unwrap();
        let state = merger
            .apply(&state, &change(json!({"email": "john@e.com"})), &stamp(5, "a"))
            .unwrap();

        let data = merger.data(&state).unwrap();
        assert_eq!(data["name"], "John Smith");
        assert_eq!(data["address"], "123 Main St");
        assert_eq!(data["email"], "john@e.com");
    }

    #[test]
    fn test_removal_tombstone_beats_earlier_write() {
        let merger = LwwMerger;
        let state = merger.init().unwrap();
        let state = merger
            .apply(
                &state,
                &serde_json::to_vec(&json!({"remove": ["phone"]})).unwrap(),
                &stamp(10, "b"),
            )
            .unwrap();
        // Concurrent earlier write arrives after the removal
        let state = merger
            .apply(&state, &change(json!({"phone": "+1"})), &stamp(5, "a"))
            .unwrap();

        assert!(merger.data(&state).unwrap().get("phone").is_none());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let merger = LwwMerger;
        let payload = change(json!({"k": "v"}));
        let state = merger.init().unwrap();
        let once = merger.apply(&state, &payload, &stamp(3, "e")).unwrap();
        let twice = merger.apply(&once, &payload, &stamp(3, "e")).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_diff_produces_set_and_remove() {
        let merger = LwwMerger;
        let before = json!({"keep": 1, "change": "old", "drop": true});
        let after = json!({"keep": 1, "change": "new", "add": [1, 2]});

        let payload = merger.diff(&before, &after).unwrap().unwrap();
        let change: ChangePayload = serde_json::from_slice(&payload).unwrap();

        assert_eq!(change.set.len(), 2);
        assert_eq!(change.set["change"], "new");
        assert_eq!(change.set["add"], json!([1, 2]));
        assert_eq!(change.remove, vec!["drop".to_string()]);
    }

    #[test]
    fn test_diff_of_equal_states_is_none() {
        let merger = LwwMerger;
        let data = json!({"a": 1});
        assert!(merger.diff(&data, &data).unwrap().is_none());
    }
}

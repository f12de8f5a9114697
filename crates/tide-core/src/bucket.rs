//! # Bucket Types
//!
//! Op ids, additive checksums, oplog entries and checkpoints.
//!
//! ## Checksum Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Bucket Checksum (u32, wrapping)                     │
//! │                                                                         │
//! │  bucket "b1"                                                            │
//! │  ┌──────────┬──────────┬──────────┐                                    │
//! │  │ op 1 PUT │ op 2 PUT │ op 3 MOV │   each op carries its own checksum │
//! │  │   c=20   │   c=22   │   c=5    │                                    │
//! │  └──────────┴──────────┴──────────┘                                    │
//! │                                                                         │
//! │  bucket checksum = add_checksum + Σ op.checksum   (mod 2^32)            │
//! │                                                                         │
//! │  Addition commutes, so delivery order inside a checkpoint interval      │
//! │  does not change the result, and compaction can merge a row's chain     │
//! │  into one op carrying the summed checksum.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use crate::error::CoreError;

// =============================================================================
// Op Id
// =============================================================================

/// Operation id. Strictly increasing within a bucket.
///
/// The server sends 64-bit ids as strings to survive JSON number precision;
/// both strings and numbers are accepted when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OpId(pub i64);

impl OpId {
    /// The id before any operation.
    pub const ZERO: OpId = OpId(0);

    /// Sentinel meaning "a write checkpoint has been requested but not yet received".
    pub const MAX: OpId = OpId(i64::MAX);

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OpId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(OpId)
            .map_err(|_| CoreError::InvalidOpId(s.to_string()))
    }
}

impl Serialize for OpId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for OpId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OpIdVisitor;

        impl<'de> Visitor<'de> for OpIdVisitor {
            type Value = OpId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an op id as integer or decimal string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<OpId, E> {
                Ok(OpId(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<OpId, E> {
                i64::try_from(v)
                    .map(OpId)
                    .map_err(|_| E::custom(format!("op id out of range: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<OpId, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(OpIdVisitor)
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// Order-independent additive checksum, wrapping at 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Checksum(u32);

impl Checksum {
    pub const ZERO: Checksum = Checksum(0);

    pub fn new(value: u32) -> Self {
        Checksum(value)
    }

    /// Truncates a wire value to 32 bits. Servers may send signed values.
    pub fn from_wire(value: i64) -> Self {
        Checksum(value as u32)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Value as stored in SQLite INTEGER columns.
    pub fn as_i64(self) -> i64 {
        i64::from(self.0)
    }
}

impl Add for Checksum {
    type Output = Checksum;

    fn add(self, rhs: Checksum) -> Checksum {
        Checksum(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Checksum {
    fn add_assign(&mut self, rhs: Checksum) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

impl Sum for Checksum {
    fn sum<I: Iterator<Item = Checksum>>(iter: I) -> Checksum {
        iter.fold(Checksum::ZERO, |acc, c| acc + c)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ChecksumVisitor;

        impl<'de> Visitor<'de> for ChecksumVisitor {
            type Value = Checksum;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a checksum as integer")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Checksum, E> {
                Ok(Checksum::from_wire(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Checksum, E> {
                Ok(Checksum(v as u32))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Checksum, E> {
                v.trim()
                    .parse::<i64>()
                    .map(Checksum::from_wire)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ChecksumVisitor)
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Kind of a bucket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    /// Upsert the full row.
    Put,
    /// Merge the given columns into the row.
    Patch,
    /// Delete the row from this bucket.
    Remove,
    /// Row moved to another bucket. Only contributes its checksum.
    Move,
    /// Drop every op in the bucket. Its checksum becomes the bucket's base.
    Clear,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Put => "PUT",
            OpType::Patch => "PATCH",
            OpType::Remove => "REMOVE",
            OpType::Move => "MOVE",
            OpType::Clear => "CLEAR",
        }
    }

    /// True for ops that address a single row.
    pub fn is_row_op(&self) -> bool {
        matches!(self, OpType::Put | OpType::Patch | OpType::Remove)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUT" => Ok(OpType::Put),
            "PATCH" => Ok(OpType::Patch),
            "REMOVE" | "DELETE" => Ok(OpType::Remove),
            "MOVE" => Ok(OpType::Move),
            "CLEAR" => Ok(OpType::Clear),
            other => Err(CoreError::InvalidOpType(other.to_string())),
        }
    }
}

/// One entry of a bucket's operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_id: OpId,
    pub op: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Row payload for PUT/PATCH. Accepted as an object or a JSON-encoded object.
    #[serde(
        default,
        deserialize_with = "deserialize_op_data",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Map<String, Value>>,
    pub checksum: Checksum,
    #[serde(
        default,
        deserialize_with = "deserialize_subkey",
        skip_serializing_if = "Option::is_none"
    )]
    pub subkey: Option<String>,
}

impl OplogEntry {
    /// Returns `(row_type, row_id)` for row ops.
    pub fn row_key(&self) -> Option<(&str, &str)> {
        match (&self.object_type, &self.object_id) {
            (Some(t), Some(id)) => Some((t.as_str(), id.as_str())),
            _ => None,
        }
    }

    /// Parses the stored text form of `data`.
    pub fn parse_data(text: Option<&str>) -> Result<Option<Map<String, Value>>, String> {
        match text {
            None => Ok(None),
            Some(s) => match serde_json::from_str::<Value>(s).map_err(|e| e.to_string())? {
                Value::Null => Ok(None),
                Value::Object(map) => Ok(Some(map)),
                other => Err(format!("expected object, got {}", other)),
            },
        }
    }
}

fn deserialize_op_data<'de, D>(deserializer: D) -> Result<Option<Map<String, Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::String(text)) => OplogEntry::parse_data(Some(&text)).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!(
            "operation data must be an object, got {}",
            other
        ))),
    }
}

fn deserialize_subkey<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// A batch of operations for one bucket (`{"data": {...}}` line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDataBatch {
    pub bucket: String,
    #[serde(default)]
    pub data: Vec<OplogEntry>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_after: Option<OpId>,
}

impl SyncDataBatch {
    /// Highest op id in the batch.
    pub fn last_op_id(&self) -> Option<OpId> {
        self.data.iter().map(|op| op.op_id).max()
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Expected state of one bucket at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketChecksum {
    pub bucket: String,
    pub checksum: Checksum,
    #[serde(default, alias = "opId", alias = "last_op_id", skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// Server-issued consistency snapshot (`{"checkpoint": {...}}` line).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_op_id: Option<OpId>,
    /// Highest local write the server has acknowledged into this checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<OpId>,
    #[serde(default)]
    pub buckets: Vec<BucketChecksum>,
}

impl Checkpoint {
    pub fn bucket(&self, name: &str) -> Option<&BucketChecksum> {
        self.buckets.iter().find(|b| b.bucket == name)
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.bucket.as_str())
    }

    /// Names in `existing` that this checkpoint no longer references.
    pub fn removed_buckets<'a>(&self, existing: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        existing
            .into_iter()
            .filter(|name| self.bucket(name).is_none())
            .map(str::to_string)
            .collect()
    }

    /// Applies an incremental diff, producing the new full checkpoint.
    pub fn apply_diff(&self, diff: &CheckpointDiff) -> Checkpoint {
        let mut buckets: BTreeMap<String, BucketChecksum> = self
            .buckets
            .iter()
            .map(|b| (b.bucket.clone(), b.clone()))
            .collect();

        for removed in &diff.removed_buckets {
            buckets.remove(removed);
        }
        for updated in &diff.updated_buckets {
            buckets.insert(updated.bucket.clone(), updated.clone());
        }

        Checkpoint {
            last_op_id: diff.last_op_id.or(self.last_op_id),
            write_checkpoint: diff.write_checkpoint,
            buckets: buckets.into_values().collect(),
        }
    }
}

/// Incremental change to the previous checkpoint (`{"checkpoint_diff": {...}}` line).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_op_id: Option<OpId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<OpId>,
    #[serde(default)]
    pub updated_buckets: Vec<BucketChecksum>,
    #[serde(default)]
    pub removed_buckets: Vec<String>,
}

/// Per-bucket resume cursor sent with every stream request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRequest {
    pub name: String,
    pub after: OpId,
}

// =============================================================================
// Row Folding
// =============================================================================

/// Result of replaying one row's op chain within a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct RowState {
    /// Final row data, `None` when the chain ends removed.
    pub data: Option<Map<String, Value>>,
    /// Highest op id in the chain.
    pub op_id: OpId,
    /// Sum of every op's checksum in the chain.
    pub checksum: Checksum,
}

/// Replays a row's ops in ascending op id order.
///
/// PUT replaces the row, PATCH merges its columns into the current row
/// (or an empty one), REMOVE clears it. MOVE and CLEAR only contribute
/// their checksum.
pub fn fold_row_ops<'a>(ops: impl IntoIterator<Item = &'a OplogEntry>) -> RowState {
    let mut ordered: Vec<&OplogEntry> = ops.into_iter().collect();
    ordered.sort_by_key(|op| op.op_id);

    let mut state = RowState {
        data: None,
        op_id: OpId::ZERO,
        checksum: Checksum::ZERO,
    };

    for op in ordered {
        state.checksum += op.checksum;
        state.op_id = state.op_id.max(op.op_id);

        match op.op {
            OpType::Put => state.data = Some(op.data.clone().unwrap_or_default()),
            OpType::Patch => {
                let row = state.data.get_or_insert_with(Map::new);
                if let Some(patch) = &op.data {
                    for (column, value) in patch {
                        row.insert(column.clone(), value.clone());
                    }
                }
            }
            OpType::Remove => state.data = None,
            OpType::Move | OpType::Clear => {}
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn op(op_id: i64, op: OpType, data: Option<Value>, checksum: u32) -> OplogEntry {
        OplogEntry {
            op_id: OpId(op_id),
            op,
            object_type: Some("assets".into()),
            object_id: Some("r1".into()),
            data: data.and_then(|v| v.as_object().cloned()),
            checksum: Checksum::new(checksum),
            subkey: None,
        }
    }

    #[test]
    fn test_op_id_accepts_string_and_number() {
        let a: OpId = serde_json::from_str("\"42\"").unwrap();
        let b: OpId = serde_json::from_str("42").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"42\"");
        assert!(serde_json::from_str::<OpId>("\"abc\"").is_err());
    }

    #[test]
    fn test_checksum_wraps() {
        let total = Checksum::new(u32::MAX) + Checksum::new(2);
        assert_eq!(total, Checksum::new(1));
        assert_eq!(Checksum::from_wire(-1), Checksum::new(u32::MAX));
    }

    #[test]
    fn test_oplog_entry_string_data() {
        let entry: OplogEntry = serde_json::from_value(json!({
            "op_id": "3",
            "op": "PUT",
            "object_type": "assets",
            "object_id": "r1",
            "data": "{\"description\":\"test\"}",
            "checksum": 20
        }))
        .unwrap();
        assert_eq!(entry.op_id, OpId(3));
        assert_eq!(entry.data.as_ref().unwrap()["description"], json!("test"));
        assert_eq!(entry.row_key(), Some(("assets", "r1")));
    }

    #[test]
    fn test_oplog_entry_rejects_non_object_data() {
        let result = serde_json::from_value::<OplogEntry>(json!({
            "op_id": 1, "op": "PUT", "object_type": "t", "object_id": "1",
            "data": [1, 2], "checksum": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_bucket_checksum_op_id_aliases() {
        let a: BucketChecksum =
            serde_json::from_value(json!({"bucket": "b1", "checksum": 42, "opId": 2})).unwrap();
        let b: BucketChecksum =
            serde_json::from_value(json!({"bucket": "b1", "checksum": 42, "last_op_id": "2"}))
                .unwrap();
        assert_eq!(a.op_id, Some(OpId(2)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_checkpoint_apply_diff() {
        let base = Checkpoint {
            last_op_id: Some(OpId(5)),
            write_checkpoint: None,
            buckets: vec![
                BucketChecksum { bucket: "a".into(), checksum: Checksum::new(1), op_id: None, count: None },
                BucketChecksum { bucket: "b".into(), checksum: Checksum::new(2), op_id: None, count: None },
            ],
        };
        let diff = CheckpointDiff {
            last_op_id: Some(OpId(9)),
            write_checkpoint: Some(OpId(3)),
            updated_buckets: vec![BucketChecksum {
                bucket: "c".into(),
                checksum: Checksum::new(7),
                op_id: None,
                count: None,
            }],
            removed_buckets: vec!["a".into()],
        };

        let next = base.apply_diff(&diff);
        assert_eq!(next.last_op_id, Some(OpId(9)));
        assert_eq!(next.write_checkpoint, Some(OpId(3)));
        assert_eq!(next.bucket_names().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(base.removed_buckets(["a", "b", "z"]), vec!["z".to_string()]);
    }

    #[test]
    fn test_fold_put_then_patch() {
        let ops = vec![
            op(1, OpType::Put, Some(json!({"description": "a", "make": "x"})), 10),
            op(2, OpType::Patch, Some(json!({"description": "b"})), 5),
        ];
        let state = fold_row_ops(&ops);
        assert_eq!(
            Value::Object(state.data.unwrap()),
            json!({"description": "b", "make": "x"})
        );
        assert_eq!(state.op_id, OpId(2));
        assert_eq!(state.checksum, Checksum::new(15));
    }

    #[test]
    fn test_fold_ends_removed() {
        let ops = vec![
            op(4, OpType::Remove, None, 3),
            op(1, OpType::Put, Some(json!({"a": 1})), 1),
        ];
        let state = fold_row_ops(&ops);
        assert!(state.data.is_none());
        assert_eq!(state.checksum, Checksum::new(4));
    }

    proptest! {
        #[test]
        fn prop_checksum_order_independent(
            (values, shuffled) in prop::collection::vec(any::<i64>(), 0..64)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            let a: Checksum = values.iter().copied().map(Checksum::from_wire).sum();
            let b: Checksum = shuffled.iter().copied().map(Checksum::from_wire).sum();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_fold_checksum_is_sum(checksums in prop::collection::vec(any::<u32>(), 1..16)) {
            let ops: Vec<OplogEntry> = checksums
                .iter()
                .enumerate()
                .map(|(i, c)| op(i as i64 + 1, OpType::Patch, Some(json!({"n": i})), *c))
                .collect();
            let expected: Checksum = checksums.iter().copied().map(Checksum::new).sum();
            prop_assert_eq!(fold_row_ops(&ops).checksum, expected);
        }
    }
}

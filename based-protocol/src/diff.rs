//! Structural diff patches for cached observable values.
//!
//! A patch is a JSON value:
//!
//! - `[0, v]` replaces the value with `v`
//! - `[1]` deletes it
//! - `[2, len, op...]` rebuilds an array of `len` items, where each op is
//!   `[0, v...]` (insert literals), `[1, count, from]` (copy `count` old
//!   items starting at `from`) or `[2, from, patch...]` (copy old items
//!   starting at `from`, each amended by the matching nested patch)
//! - an object applies nested patches per key

use serde_json::{Map, Value};
use thiserror::Error;

const OP_SET: u64 = 0;
const OP_DELETE: u64 = 1;
const OP_ARRAY: u64 = 2;

const ARRAY_INSERT: u64 = 0;
const ARRAY_COPY: u64 = 1;
const ARRAY_AMEND: u64 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    Malformed(&'static str),

    #[error("patch expects {expected} but value is {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("array patch reads index {index} of {len} items")]
    OutOfBounds { index: usize, len: usize },

    #[error("array patch built {actual} items, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Applies `patch` to `value` and returns the patched value.
pub fn apply_patch(value: Value, patch: &Value) -> Result<Value, PatchError> {
    match patch {
        Value::Array(ops) => apply_op(value, ops),
        Value::Object(fields) => apply_fields(value, fields),
        _ => Err(PatchError::Malformed("patch must be an array or object")),
    }
}

fn apply_op(value: Value, ops: &[Value]) -> Result<Value, PatchError> {
    let code = ops
        .first()
        .and_then(Value::as_u64)
        .ok_or(PatchError::Malformed("missing operation code"))?;

    match code {
        OP_SET => ops
            .get(1)
            .cloned()
            .ok_or(PatchError::Malformed("set without value")),
        OP_DELETE => Ok(Value::Null),
        OP_ARRAY => {
            let len = index_at(ops, 1)?;
            let old = match value {
                Value::Array(items) => items,
                other => {
                    return Err(PatchError::TypeMismatch {
                        expected: "array",
                        actual: kind(&other),
                    })
                }
            };
            rebuild_array(old, len, &ops[2..]).map(Value::Array)
        }
        _ => Err(PatchError::Malformed("unknown operation code")),
    }
}

fn rebuild_array(old: Vec<Value>, len: usize, ops: &[Value]) -> Result<Vec<Value>, PatchError> {
    // `len` comes off the wire; ops can only produce what they carry or copy.
    let mut out = Vec::with_capacity(len.min(old.len().saturating_add(ops.len())));

    for op in ops {
        let op = op
            .as_array()
            .ok_or(PatchError::Malformed("array op must be an array"))?;
        let code = op
            .first()
            .and_then(Value::as_u64)
            .ok_or(PatchError::Malformed("missing array op code"))?;

        match code {
            ARRAY_INSERT => out.extend(op[1..].iter().cloned()),
            ARRAY_COPY => {
                let count = index_at(op, 1)?;
                let from = index_at(op, 2)?;
                let end = from.saturating_add(count);
                if end > old.len() {
                    return Err(PatchError::OutOfBounds {
                        index: end.saturating_sub(1),
                        len: old.len(),
                    });
                }
                out.extend(old[from..end].iter().cloned());
            }
            ARRAY_AMEND => {
                let from = index_at(op, 1)?;
                for (offset, nested) in op[2..].iter().enumerate() {
                    let index = from.saturating_add(offset);
                    let item = old
                        .get(index)
                        .cloned()
                        .ok_or(PatchError::OutOfBounds {
                            index,
                            len: old.len(),
                        })?;
                    out.push(apply_patch(item, nested)?);
                }
            }
            _ => return Err(PatchError::Malformed("unknown array op code")),
        }
    }

    if out.len() != len {
        return Err(PatchError::LengthMismatch {
            expected: len,
            actual: out.len(),
        });
    }
    Ok(out)
}

fn apply_fields(value: Value, fields: &Map<String, Value>) -> Result<Value, PatchError> {
    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(PatchError::TypeMismatch {
                expected: "object",
                actual: kind(&other),
            })
        }
    };

    for (key, nested) in fields {
        if is_delete(nested) {
            object.remove(key);
            continue;
        }
        let current = object.remove(key).unwrap_or(Value::Null);
        object.insert(key.clone(), apply_patch(current, nested)?);
    }

    Ok(Value::Object(object))
}

fn is_delete(patch: &Value) -> bool {
    matches!(patch.as_array(), Some(ops) if ops.len() == 1 && ops[0].as_u64() == Some(OP_DELETE))
}

fn index_at(ops: &[Value], pos: usize) -> Result<usize, PatchError> {
    ops.get(pos)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or(PatchError::Malformed("expected a non-negative integer"))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counter_increment() {
        assert_eq!(apply_patch(json!(1), &json!([0, 2])).unwrap(), json!(2));
    }

    #[test]
    fn test_delete_top_level() {
        assert_eq!(apply_patch(json!({"a": 1}), &json!([1])).unwrap(), Value::Null);
    }

    #[test]
    fn test_object_fields() {
        let value = json!({"title": "a", "done": false, "gone": 1});
        let patch = json!({"done": [0, true], "gone": [1], "new": [0, [1, 2]]});
        assert_eq!(
            apply_patch(value, &patch).unwrap(),
            json!({"title": "a", "done": true, "new": [1, 2]})
        );
    }

    #[test]
    fn test_nested_object() {
        let value = json!({"user": {"name": "x", "age": 3}});
        let patch = json!({"user": {"age": [0, 4]}});
        assert_eq!(
            apply_patch(value, &patch).unwrap(),
            json!({"user": {"name": "x", "age": 4}})
        );
    }

    #[test]
    fn test_array_append() {
        let value = json!([1, 2, 3]);
        let patch = json!([2, 4, [1, 3, 0], [0, 4]]);
        assert_eq!(apply_patch(value, &patch).unwrap(), json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_array_remove_middle() {
        let value = json!(["a", "b", "c", "d"]);
        let patch = json!([2, 3, [1, 1, 0], [1, 2, 2]]);
        assert_eq!(apply_patch(value, &patch).unwrap(), json!(["a", "c", "d"]));
    }

    #[test]
    fn test_array_amend_items() {
        let value = json!([{"n": 1}, {"n": 2}, {"n": 3}]);
        let patch = json!([2, 3, [1, 1, 0], [2, 1, {"n": [0, 20]}, {"n": [0, 30]}]]);
        assert_eq!(
            apply_patch(value, &patch).unwrap(),
            json!([{"n": 1}, {"n": 20}, {"n": 30}])
        );
    }

    #[test]
    fn test_array_length_mismatch() {
        let patch = json!([2, 5, [1, 2, 0]]);
        assert_eq!(
            apply_patch(json!([1, 2]), &patch),
            Err(PatchError::LengthMismatch {
                expected: 5,
                actual: 2
            })
        );
    }

    #[test]
    fn test_array_copy_out_of_bounds() {
        let patch = json!([2, 3, [1, 3, 1]]);
        assert!(matches!(
            apply_patch(json!([1, 2]), &patch),
            Err(PatchError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_array_huge_length_is_rejected() {
        let patch = json!([2, 1u64 << 62, [1, 1, 0]]);
        assert_eq!(
            apply_patch(json!([1]), &patch),
            Err(PatchError::LengthMismatch {
                expected: 1usize << 62,
                actual: 1
            })
        );
    }

    #[test]
    fn test_array_amend_index_overflow() {
        let patch = json!([2, 1, [2, u64::MAX, [0, 1], [0, 2]]]);
        assert!(matches!(
            apply_patch(json!([1]), &patch),
            Err(PatchError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_type_mismatch() {
        assert!(matches!(
            apply_patch(json!("text"), &json!({"a": [0, 1]})),
            Err(PatchError::TypeMismatch { expected: "object", .. })
        ));
        assert!(matches!(
            apply_patch(json!({}), &json!([2, 0])),
            Err(PatchError::TypeMismatch { expected: "array", .. })
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            apply_patch(json!(1), &json!("x")),
            Err(PatchError::Malformed(_))
        ));
        assert!(matches!(
            apply_patch(json!(1), &json!([9])),
            Err(PatchError::Malformed(_))
        ));
        assert!(matches!(
            apply_patch(json!(1), &json!([0])),
            Err(PatchError::Malformed(_))
        ));
        assert!(matches!(
            apply_patch(json!(1), &json!([])),
            Err(PatchError::Malformed(_))
        ));
    }
}

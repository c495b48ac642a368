//! RFC-6902-style JSON patch: diff two documents, apply a patch.
//!
//! Used only for change-callback old/new reconciliation (see
//! `latchkv_engine::session`): the session diffs its previous frozen value
//! against the mutated working copy, then applies that diff to the previous
//! frozen value to produce the callback's "new" value, so that subtrees the
//! transform never touched compare equal (by value) to the old tree.
//!
//! Supports `add`, `remove`, and `replace`. `move`/`copy`/`test` are not
//! needed by the one caller in this crate and are not implemented.

use serde_json::Value;

/// A single RFC-6902 operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Add (or replace, for array `-` append) a value at `path`.
    Add { path: String, value: Value },
    /// Remove the value at `path`.
    Remove { path: String },
    /// Replace the value at `path`.
    Replace { path: String, value: Value },
}

/// Escapes a single JSON-pointer reference token per RFC 6901 (`~0` = `~`, `~1` = `/`).
fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn push_path(base: &str, token: &str) -> String {
    format!("{base}/{}", escape_token(token))
}

/// Computes the patch that transforms `old` into `new`.
///
/// Object keys are compared structurally; arrays are compared element-wise
/// by index, with a trailing `-` append op when `new` is longer than `old`
/// in a simple array-growth case (append-only arrays are the only shape
/// this store's transforms produce for arrays; general array diffing is not
/// attempted, matching the narrow contract this helper was supplied for).
#[must_use]
pub fn create_patch(old: &Value, new: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_at("", old, new, &mut ops);
    ops
}

fn diff_at(path: &str, old: &Value, new: &Value, ops: &mut Vec<PatchOp>) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_val) in old_map {
                let child_path = push_path(path, key);
                match new_map.get(key) {
                    Some(new_val) => diff_at(&child_path, old_val, new_val, ops),
                    None => ops.push(PatchOp::Remove { path: child_path }),
                }
            }
            for (key, new_val) in new_map {
                if !old_map.contains_key(key) {
                    ops.push(PatchOp::Add {
                        path: push_path(path, key),
                        value: new_val.clone(),
                    });
                }
            }
        }
        (Value::Array(old_arr), Value::Array(new_arr)) => {
            let shared = old_arr.len().min(new_arr.len());
            for i in 0..shared {
                diff_at(&push_path(path, &i.to_string()), &old_arr[i], &new_arr[i], ops);
            }
            if new_arr.len() > old_arr.len() {
                for item in &new_arr[shared..] {
                    ops.push(PatchOp::Add {
                        path: push_path(path, "-"),
                        value: item.clone(),
                    });
                }
            } else {
                for i in (shared..old_arr.len()).rev() {
                    ops.push(PatchOp::Remove {
                        path: push_path(path, &i.to_string()),
                    });
                }
            }
        }
        _ => ops.push(PatchOp::Replace {
            path: path.to_string(),
            value: new.clone(),
        }),
    }
}

/// Splits a JSON pointer into its unescaped reference tokens.
fn pointer_tokens(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    path.trim_start_matches('/')
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect()
}

/// Applies a sequence of patch ops to `doc`, returning the transformed document.
///
/// # Errors
///
/// Returns an error naming the failing path if a `remove`/`replace` targets
/// a path that does not exist, or an intermediate path segment is not a
/// container.
pub fn apply_patch(doc: &Value, ops: &[PatchOp]) -> Result<Value, String> {
    let mut current = doc.clone();
    for op in ops {
        current = apply_one(current, op)?;
    }
    Ok(current)
}

fn apply_one(doc: Value, op: &PatchOp) -> Result<Value, String> {
    match op {
        PatchOp::Add { path, value } => set_at(doc, &pointer_tokens(path), value.clone(), true),
        PatchOp::Replace { path, value } => {
            set_at(doc, &pointer_tokens(path), value.clone(), false)
        }
        PatchOp::Remove { path } => remove_at(doc, &pointer_tokens(path)),
    }
}

fn set_at(mut doc: Value, tokens: &[String], value: Value, is_add: bool) -> Result<Value, String> {
    if tokens.is_empty() {
        return Ok(value);
    }
    set_in_place(&mut doc, tokens, value, is_add)?;
    Ok(doc)
}

fn set_in_place(node: &mut Value, tokens: &[String], value: Value, is_add: bool) -> Result<(), String> {
    let (head, rest) = tokens.split_first().expect("non-empty checked by caller");
    if rest.is_empty() {
        match node {
            Value::Object(map) => {
                map.insert(head.clone(), value);
                Ok(())
            }
            Value::Array(arr) => {
                if head == "-" {
                    arr.push(value);
                    return Ok(());
                }
                let idx: usize = head
                    .parse()
                    .map_err(|_| format!("invalid array index {head:?}"))?;
                if is_add {
                    if idx > arr.len() {
                        return Err(format!("array index {idx} out of bounds"));
                    }
                    arr.insert(idx, value);
                } else {
                    if idx >= arr.len() {
                        return Err(format!("array index {idx} out of bounds"));
                    }
                    arr[idx] = value;
                }
                Ok(())
            }
            _ => Err(format!("cannot set field {head:?} on non-container")),
        }
    } else {
        match node {
            Value::Object(map) => {
                let child = map
                    .get_mut(head)
                    .ok_or_else(|| format!("path segment {head:?} not found"))?;
                set_in_place(child, rest, value, is_add)
            }
            Value::Array(arr) => {
                let idx: usize = head
                    .parse()
                    .map_err(|_| format!("invalid array index {head:?}"))?;
                let child = arr
                    .get_mut(idx)
                    .ok_or_else(|| format!("array index {idx} out of bounds"))?;
                set_in_place(child, rest, value, is_add)
            }
            _ => Err(format!("path segment {head:?} traverses a scalar")),
        }
    }
}

fn remove_at(mut doc: Value, tokens: &[String]) -> Result<Value, String> {
    if tokens.is_empty() {
        return Err("cannot remove the document root".to_string());
    }
    remove_in_place(&mut doc, tokens)?;
    Ok(doc)
}

fn remove_in_place(node: &mut Value, tokens: &[String]) -> Result<(), String> {
    let (head, rest) = tokens.split_first().expect("non-empty checked by caller");
    if rest.is_empty() {
        match node {
            Value::Object(map) => {
                map.remove(head)
                    .ok_or_else(|| format!("path segment {head:?} not found"))?;
                Ok(())
            }
            Value::Array(arr) => {
                let idx: usize = head
                    .parse()
                    .map_err(|_| format!("invalid array index {head:?}"))?;
                if idx >= arr.len() {
                    return Err(format!("array index {idx} out of bounds"));
                }
                arr.remove(idx);
                Ok(())
            }
            _ => Err(format!("cannot remove field {head:?} from non-container")),
        }
    } else {
        match node {
            Value::Object(map) => {
                let child = map
                    .get_mut(head)
                    .ok_or_else(|| format!("path segment {head:?} not found"))?;
                remove_in_place(child, rest)
            }
            Value::Array(arr) => {
                let idx: usize = head
                    .parse()
                    .map_err(|_| format!("invalid array index {head:?}"))?;
                let child = arr
                    .get_mut(idx)
                    .ok_or_else(|| format!("array index {idx} out of bounds"))?;
                remove_in_place(child, rest)
            }
            _ => Err(format!("path segment {head:?} traverses a scalar")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_and_apply_round_trip_leaf_change() {
        let old = json!({"coins": 1, "inventory": ["sword"]});
        let new = json!({"coins": 2, "inventory": ["sword"]});
        let ops = create_patch(&old, &new);
        assert_eq!(ops, vec![PatchOp::Replace {
            path: "/coins".to_string(),
            value: json!(2),
        }]);
        let applied = apply_patch(&old, &ops).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn diff_handles_added_and_removed_keys() {
        let old = json!({"a": 1, "b": 2});
        let new = json!({"a": 1, "c": 3});
        let ops = create_patch(&old, &new);
        let applied = apply_patch(&old, &ops).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn diff_handles_array_append() {
        let old = json!({"inventory": ["sword"]});
        let new = json!({"inventory": ["sword", "shield"]});
        let ops = create_patch(&old, &new);
        assert_eq!(ops, vec![PatchOp::Add {
            path: "/inventory/-".to_string(),
            value: json!("shield"),
        }]);
        let applied = apply_patch(&old, &ops).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn path_escaping_round_trips_tilde_and_slash() {
        let old = json!({"a/b": 1, "c~d": 2});
        let new = json!({"a/b": 9, "c~d": 2});
        let ops = create_patch(&old, &new);
        assert_eq!(ops, vec![PatchOp::Replace {
            path: "/a~1b".to_string(),
            value: json!(9),
        }]);
        let applied = apply_patch(&old, &ops).unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn equal_documents_produce_no_ops() {
        let doc = json!({"a": [1, 2, {"b": true}]});
        assert!(create_patch(&doc, &doc).is_empty());
    }

    proptest::proptest! {
        #[test]
        fn patch_round_trip_arbitrary_objects(
            a in proptest::collection::vec("[a-c]", 0..4),
            b in proptest::collection::vec("[a-c]", 0..4),
        ) {
            let old = Value::Object(a.iter().enumerate().map(|(i, k)| (format!("{k}{i}"), json!(i))).collect());
            let new = Value::Object(b.iter().enumerate().map(|(i, k)| (format!("{k}{i}"), json!(i * 2))).collect());
            let ops = create_patch(&old, &new);
            let applied = apply_patch(&old, &ops).unwrap();
            proptest::prop_assert_eq!(applied, new);
        }
    }
}

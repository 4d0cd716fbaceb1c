// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Path-scoped mutations on a [`Value`] tree.
//!
//! Paths are `/`-delimited and relative to the tree root; the empty path
//! addresses the root itself. Both mutations leave the tree untouched when
//! they fail: conflicts can only be found on segments that already exist,
//! and those are walked before anything new is created.

use super::{TreeError, Value};

/// Strip `prefix` from an absolute store key, returning the relative path.
///
/// The remainder must be empty or start at a segment boundary, so a room at
/// `/a/room1` never claims keys of `/a/room10`.
pub fn subkey<'a>(prefix: &str, key: &'a str) -> Result<&'a str, TreeError> {
    let outside = || TreeError::KeyOutsidePrefix {
        prefix: prefix.to_string(),
        key: key.to_string(),
    };

    let rest = key.strip_prefix(prefix).ok_or_else(outside)?;
    if rest.is_empty() {
        return Ok(rest);
    }
    if let Some(stripped) = rest.strip_prefix('/') {
        return Ok(stripped);
    }
    if prefix.is_empty() || prefix.ends_with('/') {
        return Ok(rest);
    }
    Err(outside())
}

/// Assign `value` at `path`, creating intermediate objects as needed.
///
/// A null root or null intermediate is replaced by an empty object; any other
/// non-object on the way is a [`TreeError::TypeConflict`].
///
/// ```
/// use room_sync::tree::{set_by_path, Value};
///
/// let mut root = Value::from_json_str(r#"{"a": {"b": 10}}"#).unwrap();
/// set_by_path(&mut root, "a/c/d", Value::from(5i64)).unwrap();
/// assert_eq!(root, Value::from_json_str(r#"{"a": {"b": 10, "c": {"d": 5}}}"#).unwrap());
/// ```
pub fn set_by_path(root: &mut Value, path: &str, value: Value) -> Result<(), TreeError> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }

    let mut segments = path.split('/').peekable();
    let mut walked = String::new();
    let mut node = ensure_object(root, &walked)?;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            node.insert(segment.to_string(), value);
            return Ok(());
        }
        push_segment(&mut walked, segment);
        let child = node.entry(segment.to_string()).or_insert(Value::Null);
        node = ensure_object(child, &walked)?;
    }
    Ok(())
}

/// Remove the key at `path`.
///
/// The empty path clears the whole tree to null. A missing intermediate means
/// the target is already gone and is not an error.
pub fn del_by_path(root: &mut Value, path: &str) -> Result<(), TreeError> {
    if path.is_empty() {
        *root = Value::Null;
        return Ok(());
    }

    let mut node = match root {
        Value::Null => return Ok(()),
        Value::Object(map) => map,
        other => return Err(conflict("", other)),
    };

    let mut segments = path.split('/').peekable();
    let mut walked = String::new();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            node.remove(segment);
            return Ok(());
        }
        push_segment(&mut walked, segment);
        node = match node.get_mut(segment) {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Object(map)) => map,
            Some(other) => return Err(conflict(&walked, other)),
        };
    }
    Ok(())
}

fn ensure_object<'a>(
    slot: &'a mut Value,
    walked: &str,
) -> Result<&'a mut std::collections::BTreeMap<String, Value>, TreeError> {
    if slot.is_null() {
        *slot = Value::object();
    }
    match slot {
        Value::Object(map) => Ok(map),
        other => Err(conflict(walked, other)),
    }
}

fn conflict(path: &str, found: &Value) -> TreeError {
    TreeError::TypeConflict {
        path: path.to_string(),
        found: found.kind(),
    }
}

fn push_segment(walked: &mut String, segment: &str) {
    if !walked.is_empty() {
        walked.push('/');
    }
    walked.push_str(segment);
}

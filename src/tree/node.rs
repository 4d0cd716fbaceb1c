// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconstruction of a [`Value`] from store nodes.

use crate::store::Node;

use super::{subkey, TreeError, Value};

/// Depth-first rebuild of a node and its descendants.
///
/// Leaves decode as JSON, an empty leaf is null. Directories become objects
/// keyed by each child's key relative to the directory. The returned index is
/// the maximum modified index over the node and everything below it, so a
/// fresh recursive read never reports an older version than any leaf it holds.
pub fn to_value(node: &Node) -> Result<(Value, u64), TreeError> {
    if !node.dir {
        if node.value.is_empty() {
            return Ok((Value::Null, node.modified_index));
        }
        let value = Value::from_json_str(&node.value).map_err(|source| TreeError::Decode {
            key: node.key.clone(),
            source,
        })?;
        return Ok((value, node.modified_index));
    }

    let mut children = std::collections::BTreeMap::new();
    let mut max_index = node.modified_index;
    for child in &node.nodes {
        let key = subkey(&node.key, &child.key)?;
        let (value, index) = to_value(child)?;
        max_index = max_index.max(index);
        children.insert(key.to_string(), value);
    }
    Ok((Value::Object(children), max_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/rooms/ns/ab/cd/room";

    fn leaf(key: &str, value: &str, index: u64) -> Node {
        Node::leaf(format!("{ROOT}{key}"), value, index)
    }

    #[test]
    fn test_reconstructs_nested_fixture_with_max_index() {
        let mut eee = Node::dir(format!("{ROOT}/eee"), 3);
        eee.nodes.push(leaf("/eee/fff", "333", 7));

        let mut root = Node::dir(ROOT, 2);
        root.nodes.push(leaf("/aaa", "111", 5));
        root.nodes.push(leaf("/ddd", "222", 4));
        root.nodes.push(eee);

        let (value, index) = to_value(&root).unwrap();
        assert_eq!(
            value,
            Value::from_json_str(r#"{"aaa": 111, "ddd": 222, "eee": {"fff": 333}}"#).unwrap()
        );
        assert_eq!(index, 7);
    }

    #[test]
    fn test_dir_index_wins_when_newest() {
        let mut root = Node::dir(ROOT, 50);
        root.nodes.push(leaf("/aaa", "1", 10));
        let (_, index) = to_value(&root).unwrap();
        assert_eq!(index, 50);
    }

    #[test]
    fn test_empty_leaf_is_null() {
        let (value, index) = to_value(&leaf("/gone", "", 9)).unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(index, 9);
    }

    #[test]
    fn test_empty_dir_is_empty_object() {
        let (value, index) = to_value(&Node::dir(ROOT, 0)).unwrap();
        assert_eq!(value, Value::object());
        assert_eq!(index, 0);
    }

    #[test]
    fn test_bad_leaf_is_decode_error() {
        let err = to_value(&leaf("/aaa", "{broken", 1)).unwrap_err();
        assert!(matches!(err, TreeError::Decode { .. }));
    }

    #[test]
    fn test_child_outside_parent_is_rejected() {
        let mut root = Node::dir(ROOT, 1);
        root.nodes.push(Node::leaf("/elsewhere/aaa", "1", 2));
        assert!(matches!(to_value(&root), Err(TreeError::KeyOutsidePrefix { .. })));
    }
}

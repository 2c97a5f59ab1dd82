//! Dotted-path access into a [`StateValue`] tree.
//!
//! Reads never fail: a missing intermediate yields `None`. Writes copy every
//! ancestor along the path and reuse all other branches by reference.

use tracing::warn;

use crate::value::StateValue;

/// Read the value at `path` (segments separated by `.`).
///
/// List nodes are walked by numeric index. The empty path addresses the
/// tree itself.
pub fn get_at(tree: &StateValue, path: &str) -> Option<StateValue> {
    if path.is_empty() {
        return Some(tree.clone());
    }
    let mut node = tree;
    for segment in path.split('.') {
        node = node.get(segment)?;
    }
    Some(node.clone())
}

/// Return a new tree with `value` placed at `path`.
///
/// Every ancestor of the target is shallow-copied; siblings keep their
/// identity. Missing or scalar intermediates become empty maps. A list is
/// written by numeric index, padded with `Null` when the index is past its
/// end; a non-index segment on a list leaves the list unchanged.
pub fn set_at(tree: &StateValue, path: &str, value: StateValue) -> StateValue {
    if path.is_empty() {
        return value;
    }
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(tree, &segments, value)
}

fn set_segments(node: &StateValue, segments: &[&str], value: StateValue) -> StateValue {
    let Some((head, rest)) = segments.split_first() else {
        return value;
    };
    if let Some(items) = node.as_list() {
        let Ok(index) = head.parse::<usize>() else {
            warn!(segment = *head, "non-index segment on a list, write ignored");
            return node.clone();
        };
        let child = items.get(index).cloned().unwrap_or_default();
        let mut copy = items.to_vec();
        if index >= copy.len() {
            copy.resize(index + 1, StateValue::Null);
        }
        copy[index] = set_segments(&child, rest, value);
        return StateValue::from(copy);
    }

    let child = node.get(head).cloned().unwrap_or_default();
    node.with(*head, set_segments(&child, rest, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> StateValue {
        StateValue::from(json!({
            "cart": {"items": ["x"], "saved": {"count": 0}},
            "user": {"name": "ann"}
        }))
    }

    // ========================================================================
    // get_at
    // ========================================================================

    #[test]
    fn get_nested_value() {
        let t = tree();
        let count = get_at(&t, "cart.saved.count").unwrap();
        assert_eq!(count.as_i64(), Some(0));
    }

    #[test]
    fn get_missing_intermediate_is_none() {
        let t = tree();
        assert!(get_at(&t, "orders.open.count").is_none());
        assert!(get_at(&t, "cart.saved.count.deeper").is_none());
    }

    #[test]
    fn get_walks_list_index() {
        let t = tree();
        assert_eq!(get_at(&t, "cart.items.0").unwrap().as_str(), Some("x"));
        assert!(get_at(&t, "cart.items.3").is_none());
    }

    #[test]
    fn empty_path_is_the_tree() {
        let t = tree();
        assert!(get_at(&t, "").unwrap().ptr_eq(&t));
    }

    // ========================================================================
    // set_at
    // ========================================================================

    #[test]
    fn set_shares_untouched_siblings() {
        let t = tree();
        let t2 = set_at(&t, "cart.saved.count", StateValue::from(1));

        assert!(!t2.ptr_eq(&t));
        let cart = get_at(&t, "cart").unwrap();
        let cart2 = get_at(&t2, "cart").unwrap();
        assert!(!cart2.ptr_eq(&cart));
        assert!(!get_at(&t2, "cart.saved").unwrap().ptr_eq(&get_at(&t, "cart.saved").unwrap()));

        assert!(get_at(&t2, "user").unwrap().ptr_eq(&get_at(&t, "user").unwrap()));
        assert!(get_at(&t2, "cart.items").unwrap().ptr_eq(&get_at(&t, "cart.items").unwrap()));
    }

    #[test]
    fn set_then_get_returns_same_value() {
        let t = tree();
        let value = StateValue::from(json!({"deep": true}));
        let t2 = set_at(&t, "user.prefs", value.clone());
        assert!(get_at(&t2, "user.prefs").unwrap().ptr_eq(&value));
        assert_eq!(get_at(&t2, "user.name").unwrap().as_str(), Some("ann"));
    }

    #[test]
    fn set_leaves_original_untouched() {
        let t = tree();
        let _ = set_at(&t, "cart.saved.count", StateValue::from(9));
        assert_eq!(get_at(&t, "cart.saved.count").unwrap().as_i64(), Some(0));
    }

    #[test]
    fn set_creates_missing_intermediates() {
        let t = StateValue::map();
        let t2 = set_at(&t, "a.b.c", StateValue::from(1));
        assert_eq!(t2.to_json(), json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_replaces_scalar_intermediate_with_map() {
        let t = StateValue::from(json!({"a": 5}));
        let t2 = set_at(&t, "a.b", StateValue::from(1));
        assert_eq!(t2.to_json(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn set_inside_list_keeps_list() {
        let t = StateValue::from(json!({"rows": [{"v": 1}, {"v": 2}]}));
        let t2 = set_at(&t, "rows.1.v", StateValue::from(3));
        assert_eq!(t2.to_json(), json!({"rows": [{"v": 1}, {"v": 3}]}));
        assert!(get_at(&t2, "rows.0").unwrap().ptr_eq(&get_at(&t, "rows.0").unwrap()));
    }

    #[test]
    fn set_past_list_end_pads_with_null() {
        let t = StateValue::from(json!({"rows": [1, 2]}));
        let t2 = set_at(&t, "rows.4", StateValue::from(9));
        assert_eq!(t2.to_json(), json!({"rows": [1, 2, null, null, 9]}));
        assert_eq!(get_at(&t2, "rows.4").unwrap().as_i64(), Some(9));
    }

    #[test]
    fn set_appends_at_list_len() {
        let t = StateValue::from(json!({"rows": [1, 2]}));
        let t2 = set_at(&t, "rows.2.v", StateValue::from(3));
        assert_eq!(t2.to_json(), json!({"rows": [1, 2, {"v": 3}]}));
    }

    #[test]
    fn set_with_non_index_segment_keeps_list() {
        let t = StateValue::from(json!({"rows": [1, 2], "other": true}));
        let t2 = set_at(&t, "rows.x", StateValue::from(9));
        assert_eq!(t2.to_json(), json!({"rows": [1, 2], "other": true}));
        assert!(get_at(&t2, "rows").unwrap().ptr_eq(&get_at(&t, "rows").unwrap()));
    }

    #[test]
    fn set_on_frozen_tree_works() {
        let t = tree();
        t.deep_freeze();
        let t2 = set_at(&t, "cart.saved.count", StateValue::from(2));
        assert_eq!(get_at(&t2, "cart.saved.count").unwrap().as_i64(), Some(2));
    }
}

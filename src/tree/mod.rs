use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Outcome record for a tree operation. This is also the wire reply of the
/// keymaster RPC protocol, so the field names are load-bearing.
///
/// Path-resolution failures (`NotFound`, put-without-create conflicts) are
/// reported here with `result == false`; they are states, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeResult {
    #[serde(default)]
    pub key: String,
    pub result: bool,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub node: Value,
}

impl TreeResult {
    pub fn ok(key: impl Into<String>, node: Value) -> Self {
        Self {
            key: key.into(),
            result: true,
            err: String::new(),
            node,
        }
    }

    pub fn fail(key: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            result: false,
            err: err.into(),
            node: Value::Null,
        }
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            format!("key: ''\nresult: false\nerr: 'serialization failure: {e}'\nnode: ~\n")
        })
    }

    /// Parse a reply off the wire. A malformed reply becomes a failed
    /// result carrying the parse error, so callers see one shape.
    pub fn from_yaml(s: &str) -> Self {
        serde_yaml::from_str(s)
            .unwrap_or_else(|e| TreeResult::fail("", format!("malformed reply: {e}")))
    }
}

fn segments(keychain: &str) -> Vec<&str> {
    if keychain.is_empty() {
        Vec::new()
    } else {
        keychain.split('.').collect()
    }
}

/// Fetch the node at `keychain`. The empty keychain addresses the root.
pub fn get_node(root: &Value, keychain: &str) -> TreeResult {
    let mut current = root;

    for seg in segments(keychain) {
        match current.get(seg) {
            Some(next) => current = next,
            None => {
                return TreeResult::fail(
                    keychain,
                    format!("No such key: '{seg}' (in '{keychain}')"),
                );
            }
        }
    }

    TreeResult::ok(keychain, current.clone())
}

/// Write `node` at `keychain`. Missing intermediates fail the operation
/// unless `create` is set, in which case they are created as empty
/// mappings. The empty keychain replaces the whole root.
pub fn put_node(root: &mut Value, keychain: &str, node: Value, create: bool) -> TreeResult {
    let segs = segments(keychain);

    if segs.is_empty() {
        *root = node.clone();
        return TreeResult::ok(keychain, node);
    }

    let mut current = root;

    for seg in &segs[..segs.len() - 1] {
        if !matches!(current, Value::Mapping(_)) {
            if !create {
                return TreeResult::fail(
                    keychain,
                    format!("No such key: '{seg}' (in '{keychain}')"),
                );
            }
            *current = Value::Mapping(Mapping::new());
        }

        let map = current.as_mapping_mut().expect("just ensured a mapping");
        let key = Value::String((*seg).to_string());

        if !map.contains_key(&key) {
            if !create {
                return TreeResult::fail(
                    keychain,
                    format!("No such key: '{seg}' (in '{keychain}')"),
                );
            }
            map.insert(key.clone(), Value::Mapping(Mapping::new()));
        }

        current = map.get_mut(&key).expect("just inserted");
    }

    let last = *segs.last().expect("non-empty keychain");

    if !matches!(current, Value::Mapping(_)) {
        if !create {
            return TreeResult::fail(
                keychain,
                format!("No such key: '{last}' (in '{keychain}')"),
            );
        }
        *current = Value::Mapping(Mapping::new());
    }

    let map = current.as_mapping_mut().expect("just ensured a mapping");
    let key = Value::String(last.to_string());

    if !create && !map.contains_key(&key) {
        return TreeResult::fail(
            keychain,
            format!("No such key: '{last}' (in '{keychain}')"),
        );
    }

    map.insert(key, node.clone());
    TreeResult::ok(keychain, node)
}

/// Remove the node at `keychain`. Deleting a missing path fails and leaves
/// the tree untouched.
pub fn delete_node(root: &mut Value, keychain: &str) -> TreeResult {
    let segs = segments(keychain);

    if segs.is_empty() {
        return TreeResult::fail(keychain, "cannot delete the root node");
    }

    let mut current = root;

    for seg in &segs[..segs.len() - 1] {
        match current.get_mut(*seg) {
            Some(next) => current = next,
            None => {
                return TreeResult::fail(
                    keychain,
                    format!("No such key: '{seg}' (in '{keychain}')"),
                );
            }
        }
    }

    let last = *segs.last().expect("non-empty keychain");

    let last_key = Value::String(last.to_string());

    match current.as_mapping_mut() {
        Some(map) => match map.remove(&last_key) {
            Some(removed) => TreeResult::ok(keychain, removed),
            None => TreeResult::fail(
                keychain,
                format!("No such key: '{last}' (in '{keychain}')"),
            ),
        },
        None => TreeResult::fail(
            keychain,
            format!("No such key: '{last}' (in '{keychain}')"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        serde_yaml::from_str(
            r#"
components:
  nettask:
    type: net
    count: 3
connections:
  default:
    - [nettask, A, logger, input]
"#,
        )
        .unwrap()
    }

    #[test]
    fn get_existing_path() {
        let root = sample();
        let r = get_node(&root, "components.nettask.type");
        assert!(r.result);
        assert_eq!(r.node, Value::String("net".into()));
    }

    #[test]
    fn get_missing_path_reports_not_found() {
        let root = sample();
        let r = get_node(&root, "components.oscope.type");
        assert!(!r.result);
        assert!(r.err.contains("oscope"));
    }

    #[test]
    fn empty_keychain_addresses_root() {
        let root = sample();
        let r = get_node(&root, "");
        assert!(r.result);
        assert_eq!(r.node, root);
    }

    #[test]
    fn put_then_get_returns_value() {
        let mut root = sample();
        let r = put_node(&mut root, "components.nettask.count", Value::from(42), false);
        assert!(r.result);
        assert_eq!(get_node(&root, "components.nettask.count").node, Value::from(42));
    }

    #[test]
    fn put_without_create_into_missing_path_fails_unchanged() {
        let mut root = sample();
        let before = root.clone();
        let r = put_node(&mut root, "a.b.c", Value::from(1), false);
        assert!(!r.result);
        assert_eq!(root, before);
    }

    #[test]
    fn put_with_create_builds_intermediates() {
        let mut root = sample();
        let r = put_node(&mut root, "foo.bar.baz", Value::from(42), true);
        assert!(r.result);
        assert_eq!(get_node(&root, "foo.bar.baz").node, Value::from(42));
        // intermediates are mappings
        assert!(get_node(&root, "foo.bar").node.is_mapping());
    }

    #[test]
    fn delete_then_get_reports_not_found() {
        let mut root = sample();
        let r = delete_node(&mut root, "components.nettask.count");
        assert!(r.result);
        assert!(!get_node(&root, "components.nettask.count").result);
        // siblings survive
        assert!(get_node(&root, "components.nettask.type").result);
    }

    #[test]
    fn delete_missing_path_fails_unchanged() {
        let mut root = sample();
        let before = root.clone();
        assert!(!delete_node(&mut root, "components.gone").result);
        assert!(!delete_node(&mut root, "no.such.path").result);
        assert_eq!(root, before);
    }

    #[test]
    fn clone_is_independent() {
        let root = sample();
        let mut copy = root.clone();
        put_node(&mut copy, "components.nettask.count", Value::from(99), false);
        assert_eq!(get_node(&root, "components.nettask.count").node, Value::from(3));
    }

    #[test]
    fn result_record_wire_shape() {
        let r = TreeResult::ok("a.b", Value::from(7));
        let parsed = TreeResult::from_yaml(&r.to_yaml());
        assert!(parsed.result);
        assert_eq!(parsed.key, "a.b");
        assert_eq!(parsed.node, Value::from(7));

        let bad = TreeResult::from_yaml(": not yaml [");
        assert!(!bad.result);
        assert!(bad.err.contains("malformed reply"));
    }
}

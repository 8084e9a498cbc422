use crate::error::MatrixError;
use crate::tree;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::path::Path;

/// Load a YAML configuration document. The document seeds the keymaster
/// store, so anything may appear in it; only the keys the framework reads
/// are validated, at the point of use.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<Value, MatrixError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| MatrixError::config(format!("could not open config file {path:?}: {e}")))?;
    load_config_str(&text)
}

pub fn load_config_str(text: &str) -> Result<Value, MatrixError> {
    serde_yaml::from_str(text).map_err(|e| MatrixError::config(format!("invalid YAML: {e}")))
}

/// Fetch `key` from the tree and deserialize it, failing with a
/// `ConfigError` naming the key when absent or mistyped.
pub fn require<T: DeserializeOwned>(root: &Value, key: &str) -> Result<T, MatrixError> {
    let r = tree::get_node(root, key);
    if !r.result {
        return Err(MatrixError::config(format!("missing key '{key}': {}", r.err)));
    }
    serde_yaml::from_value(r.node)
        .map_err(|e| MatrixError::config(format!("bad value at '{key}': {e}")))
}

/// Like [`require`], but absent keys yield `default`. A present key of the
/// wrong type is still a configuration error.
pub fn optional<T: DeserializeOwned>(
    root: &Value,
    key: &str,
    default: T,
) -> Result<T, MatrixError> {
    let r = tree::get_node(root, key);
    if !r.result {
        return Ok(default);
    }
    serde_yaml::from_value(r.node)
        .map_err(|e| MatrixError::config(format!("bad value at '{key}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
Keymaster:
  URLS:
    Initial:
      - inproc://matrix.keymaster
      - tcp://*:42000
  clone_interval: 500
"#;

    #[test]
    fn typed_access() {
        let root = load_config_str(DOC).unwrap();
        let urls: Vec<String> = require(&root, "Keymaster.URLS.Initial").unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(
            optional::<u64>(&root, "Keymaster.clone_interval", 1000).unwrap(),
            500
        );
        assert_eq!(optional::<u64>(&root, "Keymaster.missing", 1000).unwrap(), 1000);
    }

    #[test]
    fn missing_required_key_is_config_error() {
        let root = load_config_str(DOC).unwrap();
        let err = require::<String>(&root, "Keymaster.flavor").unwrap_err();
        assert!(matches!(err, MatrixError::Config(_)));
        assert!(err.to_string().contains("Keymaster.flavor"));
    }

    #[test]
    fn mistyped_optional_key_is_config_error() {
        let root = load_config_str(DOC).unwrap();
        assert!(optional::<u64>(&root, "Keymaster.URLS", 0).is_err());
    }
}

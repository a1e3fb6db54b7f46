//! Configuration merge logic
//!
//! Layers are JSON values. Objects deep-merge by key; arrays and scalars
//! from a later layer replace earlier ones.

use serde_json::{Map, Value};

/// Deep merge two JSON values.
///
/// Objects merge by key recursively; anything else in `overlay`, including
/// arrays and null, replaces what is in `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut merged), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let next = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, next);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay,
    }
}

/// Merge multiple config layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Set `value` at a dotted key path, creating intermediate objects.
///
/// Used to turn individual CLI flags into an override layer. A non-object
/// found on the way is replaced by an object.
pub fn set_path(root: &mut Value, dotted: &str, value: Value) {
    let mut current = root;
    let mut parts = dotted.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

//! Validation of the props handed to a component at render time.
//!
//! Props travel into the isolate as a JSON literal; keys that could reach
//! `Object.prototype` through the component's own spreading and merging
//! are refused, as is unbounded nesting.

use crate::error::PreviewError;
use serde_json::Value;

const MAX_DEPTH: usize = 32;

const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

pub fn validate_props(props: &Value) -> Result<(), PreviewError> {
    walk(props, 0)
}

fn walk(value: &Value, depth: usize) -> Result<(), PreviewError> {
    if depth > MAX_DEPTH {
        return Err(PreviewError::InvalidProps(format!(
            "nesting deeper than {} levels",
            MAX_DEPTH
        )));
    }

    match value {
        Value::Object(map) => {
            if let Some(key) = map.keys().find(|k| FORBIDDEN_KEYS.contains(&k.as_str())) {
                return Err(PreviewError::InvalidProps(format!("'{}' key is forbidden", key)));
            }
            map.values().try_for_each(|v| walk(v, depth + 1))
        }
        Value::Array(items) => items.iter().try_for_each(|v| walk(v, depth + 1)),
        _ => Ok(()),
    }
}

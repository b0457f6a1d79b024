use serde_json::{Map, Value};

use crate::Error;

/// Deep merge `source` over `target`: nested objects merge key by
/// key, everything else (arrays included) is replaced by the
/// higher priority side.
pub fn merge_objects(
  mut target: Map<String, Value>,
  source: Map<String, Value>,
) -> crate::Result<Map<String, Value>> {
  for (key, value) in source {
    let Some(curr) = target.remove(&key) else {
      target.insert(key, value);
      continue;
    };
    match (curr, value) {
      (Value::Object(curr), Value::Object(value)) => {
        target
          .insert(key, Value::Object(merge_objects(curr, value)?));
      }
      (Value::Object(_), value) => {
        return Err(Error::ObjectFieldTypeMismatch { key, value });
      }
      (_, value) => {
        target.insert(key, value);
      }
    }
  }
  Ok(target)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn obj(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  #[test]
  fn merges_nested_objects() {
    let merged = merge_objects(
      obj(json!({"db": {"host": "a", "port": 1}, "port": 80})),
      obj(json!({"db": {"host": "b"}})),
    )
    .unwrap();
    assert_eq!(
      Value::Object(merged),
      json!({"db": {"host": "b", "port": 1}, "port": 80})
    );
  }

  #[test]
  fn scalar_over_object_is_an_error() {
    let result = merge_objects(
      obj(json!({"db": {"host": "a"}})),
      obj(json!({"db": 5})),
    );
    assert!(result.is_err());
  }
}

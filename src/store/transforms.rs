//! Field transform application.

use crate::error::{FailureCode, StoreFailure};
use crate::types::{FieldValue, Timestamp, WritePayload};
use serde_json::{Map, Value};

/// Apply a field value to the current content of one field.
///
/// Returns `None` when the field should be removed.
pub fn apply_field_value(
    current: Option<&Value>,
    value: &FieldValue,
    now: Timestamp,
) -> Result<Option<Value>, StoreFailure> {
    match value {
        FieldValue::Value(v) => Ok(Some(v.clone())),

        FieldValue::ServerTimestamp => Ok(Some(Value::from(now.0))),

        FieldValue::Delete => Ok(None),

        FieldValue::ArrayUnion(items) => {
            // Non-array fields are overwritten with the union elements
            let mut arr = match current {
                Some(Value::Array(existing)) => existing.clone(),
                _ => Vec::new(),
            };
            for item in items {
                if !arr.contains(item) {
                    arr.push(item.clone());
                }
            }
            Ok(Some(Value::Array(arr)))
        }

        FieldValue::ArrayRemove(items) => {
            let mut arr = match current {
                Some(Value::Array(existing)) => existing.clone(),
                _ => Vec::new(),
            };
            arr.retain(|v| !items.contains(v));
            Ok(Some(Value::Array(arr)))
        }

        FieldValue::Increment(by) => match current {
            None | Some(Value::Null) => Ok(Some(Value::from(*by))),
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(Some(Value::from(i.saturating_add(*by))))
                } else {
                    let f = n.as_f64().unwrap_or_default();
                    Ok(Some(Value::from(f + *by as f64)))
                }
            }
            Some(other) => Err(StoreFailure::new(
                FailureCode::InvalidArgument,
                format!("cannot increment non-numeric value {other}"),
            )),
        },
    }
}

/// Apply a payload to a document's fields.
///
/// Dotted keys address nested maps (`stats.points`), creating intermediate
/// maps as needed.
pub fn apply_payload(
    existing: Option<&Map<String, Value>>,
    payload: &WritePayload,
    now: Timestamp,
) -> Result<Map<String, Value>, StoreFailure> {
    let mut fields = existing.cloned().unwrap_or_default();

    for (name, value) in payload {
        let parts: Vec<&str> = name.split('.').collect();
        apply_nested(&mut fields, &parts, value, now)?;
    }

    Ok(fields)
}

fn apply_nested(
    obj: &mut Map<String, Value>,
    parts: &[&str],
    value: &FieldValue,
    now: Timestamp,
) -> Result<(), StoreFailure> {
    let Some((head, rest)) = parts.split_first() else {
        return Ok(());
    };

    if rest.is_empty() {
        match apply_field_value(obj.get(*head), value, now)? {
            Some(new_value) => {
                obj.insert(head.to_string(), new_value);
            }
            None => {
                obj.remove(*head);
            }
        }
        return Ok(());
    }

    let child = obj
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    match child {
        Value::Object(map) => apply_nested(map, rest, value, now),
        _ => Ok(()),
    }
}

//! Wire types shared by records and queries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};

use crate::{ErrorCode, NimbusError};

/// A reference to a record by class and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "__type", rename = "Pointer", rename_all = "camelCase")]
pub struct Pointer {
    pub class_name: String,
    pub object_id: String,
}

impl Pointer {
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }
}

impl From<Pointer> for Value {
    fn from(pointer: Pointer) -> Self {
        json!({
            "__type": "Pointer",
            "className": pointer.class_name,
            "objectId": pointer.object_id,
        })
    }
}

/// Encode a timestamp as a typed date value.
pub fn date_value(at: DateTime<Utc>) -> Value {
    json!({
        "__type": "Date",
        "iso": at.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Decode a timestamp from either a bare ISO string or a typed date value.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let iso = match value {
        Value::String(s) => s.as_str(),
        Value::Object(map) if map.get("__type").and_then(Value::as_str) == Some("Date") => {
            map.get("iso")?.as_str()?
        }
        _ => return None,
    };
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A pending change to one field of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(Value),
    Unset,
    Increment(Number),
    Add(Vec<Value>),
    AddUnique(Vec<Value>),
    Remove(Vec<Value>),
    Relation {
        added: Vec<Pointer>,
        removed: Vec<Pointer>,
    },
}

impl FieldOp {
    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            FieldOp::Set(_) => "Set",
            FieldOp::Unset => "Delete",
            FieldOp::Increment(_) => "Increment",
            FieldOp::Add(_) => "Add",
            FieldOp::AddUnique(_) => "AddUnique",
            FieldOp::Remove(_) => "Remove",
            FieldOp::Relation { .. } => "Relation",
        }
    }

    /// The JSON sent to the server for this operation.
    pub fn to_json(&self) -> Value {
        match self {
            FieldOp::Set(value) => value.clone(),
            FieldOp::Unset => json!({ "__op": "Delete" }),
            FieldOp::Increment(amount) => json!({ "__op": "Increment", "amount": amount }),
            FieldOp::Add(objects) => json!({ "__op": "Add", "objects": objects }),
            FieldOp::AddUnique(objects) => json!({ "__op": "AddUnique", "objects": objects }),
            FieldOp::Remove(objects) => json!({ "__op": "Remove", "objects": objects }),
            FieldOp::Relation { added, removed } => {
                let add = json!({ "__op": "AddRelation", "objects": added });
                let remove = json!({ "__op": "RemoveRelation", "objects": removed });
                match (added.is_empty(), removed.is_empty()) {
                    (false, true) => add,
                    (true, false) => remove,
                    _ => json!({ "__op": "Batch", "ops": [add, remove] }),
                }
            }
        }
    }

    /// Estimate the field value after this operation runs on the server.
    pub fn apply(&self, current: Option<&Value>) -> Option<Value> {
        match self {
            FieldOp::Set(value) => Some(value.clone()),
            FieldOp::Unset => None,
            FieldOp::Increment(amount) => {
                let base = match current {
                    Some(Value::Number(n)) => n.clone(),
                    _ => Number::from(0),
                };
                // A non-finite sum leaves the field as it was.
                match add_numbers(&base, amount) {
                    Ok(sum) => Some(Value::Number(sum)),
                    Err(_) => current.cloned(),
                }
            }
            FieldOp::Add(objects) => {
                let mut items = current_array(current);
                items.extend(objects.iter().cloned());
                Some(Value::Array(items))
            }
            FieldOp::AddUnique(objects) => {
                let mut items = current_array(current);
                push_unique(&mut items, objects);
                Some(Value::Array(items))
            }
            FieldOp::Remove(objects) => {
                let mut items = current_array(current);
                items.retain(|item| !objects.contains(item));
                Some(Value::Array(items))
            }
            FieldOp::Relation { .. } => current.cloned(),
        }
    }

    /// Combine with the operation already pending on the same field.
    ///
    /// Fails with INCORRECT_TYPE when the pair has no single equivalent
    /// operation (an `Add` after a `Remove`, an `Increment` after an array
    /// write, ...). Neither operation is lost in that case.
    pub fn merge_after(self, previous: &FieldOp) -> Result<FieldOp, NimbusError> {
        let merged = match (self, previous) {
            (next @ (FieldOp::Set(_) | FieldOp::Unset), _) => next,

            (FieldOp::Increment(amount), FieldOp::Set(Value::Number(base))) => {
                FieldOp::Set(Value::Number(add_numbers(base, &amount)?))
            }
            (FieldOp::Increment(amount), FieldOp::Increment(earlier)) => {
                FieldOp::Increment(add_numbers(earlier, &amount)?)
            }
            (FieldOp::Increment(amount), FieldOp::Unset) => FieldOp::Set(Value::Number(amount)),

            (FieldOp::Add(objects), FieldOp::Set(Value::Array(items))) => {
                let mut items = items.clone();
                items.extend(objects);
                FieldOp::Set(Value::Array(items))
            }
            (FieldOp::Add(objects), FieldOp::Add(earlier)) => {
                let mut items = earlier.clone();
                items.extend(objects);
                FieldOp::Add(items)
            }
            (FieldOp::Add(objects), FieldOp::Unset) => FieldOp::Set(Value::Array(objects)),

            (FieldOp::AddUnique(objects), FieldOp::Set(Value::Array(items))) => {
                let mut items = items.clone();
                push_unique(&mut items, &objects);
                FieldOp::Set(Value::Array(items))
            }
            (FieldOp::AddUnique(objects), FieldOp::AddUnique(earlier)) => {
                let mut items = earlier.clone();
                push_unique(&mut items, &objects);
                FieldOp::AddUnique(items)
            }
            (FieldOp::AddUnique(objects), FieldOp::Unset) => {
                let mut items = Vec::new();
                push_unique(&mut items, &objects);
                FieldOp::Set(Value::Array(items))
            }

            (FieldOp::Remove(objects), FieldOp::Set(Value::Array(items))) => {
                let mut items = items.clone();
                items.retain(|item| !objects.contains(item));
                FieldOp::Set(Value::Array(items))
            }
            (FieldOp::Remove(objects), FieldOp::Remove(earlier)) => {
                let mut items = earlier.clone();
                push_unique(&mut items, &objects);
                FieldOp::Remove(items)
            }
            (FieldOp::Remove(_), FieldOp::Unset) => FieldOp::Unset,

            (
                FieldOp::Relation { added, removed },
                FieldOp::Relation {
                    added: earlier_added,
                    removed: earlier_removed,
                },
            ) => {
                let mut merged_added: Vec<Pointer> = earlier_added
                    .iter()
                    .filter(|p| !removed.contains(p))
                    .cloned()
                    .collect();
                let mut merged_removed: Vec<Pointer> = earlier_removed
                    .iter()
                    .filter(|p| !added.contains(p))
                    .cloned()
                    .collect();
                for pointer in added {
                    if !merged_added.contains(&pointer) {
                        merged_added.push(pointer);
                    }
                }
                for pointer in removed {
                    if !merged_removed.contains(&pointer) {
                        merged_removed.push(pointer);
                    }
                }
                FieldOp::Relation {
                    added: merged_added,
                    removed: merged_removed,
                }
            }

            (next, previous) => {
                return Err(NimbusError::invalid(
                    ErrorCode::IncorrectType,
                    format!(
                        "cannot merge {} with the pending {} on the same field",
                        next.name(),
                        previous.name()
                    ),
                ));
            }
        };
        Ok(merged)
    }
}

fn current_array(current: Option<&Value>) -> Vec<Value> {
    current
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn push_unique(items: &mut Vec<Value>, objects: &[Value]) {
    for object in objects {
        if !items.contains(object) {
            items.push(object.clone());
        }
    }
}

fn add_numbers(a: &Number, b: &Number) -> Result<Number, NimbusError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Number::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).ok_or_else(|| {
        NimbusError::invalid(
            ErrorCode::IncorrectType,
            format!("increment of {a} by {b} is not a finite number"),
        )
    })
}

/// Encode a map of pending operations into a request body.
pub(crate) fn encode_ops<'a>(
    ops: impl Iterator<Item = (&'a String, &'a FieldOp)>,
) -> Map<String, Value> {
    ops.map(|(key, op)| (key.clone(), op.to_json())).collect()
}

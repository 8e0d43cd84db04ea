//! Field-op application shared by every backend.
//!
//! Numeric path segments index into arrays. `Set` creates missing parent
//! objects and pads arrays with nulls; `Unset` on an array position nulls
//! the slot rather than shifting the array.

use serde_json::Value as JsonValue;

use crate::{Error, Result, path::FieldPath};

use super::{Document, FieldOp, Write};

pub fn get_path<'a>(document: &'a Document, path: &FieldPath) -> Option<&'a JsonValue> {
    let (first, rest) = path.parts().split_first()?;
    let mut current = document.get(first)?;
    for part in rest {
        current = match current {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn apply_write(document: &mut Document, write: &Write) -> Result<()> {
    match write {
        Write::Fields(ops) => apply(document, ops),
        Write::Replace(replacement) => {
            let id = document.get("_id").cloned();
            *document = replacement.clone();
            if let Some(id) = id {
                document.insert("_id".into(), id);
            }
            Ok(())
        }
    }
}

pub fn apply(document: &mut Document, ops: &[FieldOp]) -> Result<()> {
    for op in ops {
        apply_one(document, op)?;
    }
    Ok(())
}

fn apply_one(document: &mut Document, op: &FieldOp) -> Result<()> {
    if op.path().parts().first().is_some_and(|p| p == "_id") {
        return Err(invalid(op.path(), "the identifier cannot be modified"));
    }
    match op {
        FieldOp::Set(path, value) => {
            *slot_mut(document, path)? = value.clone();
        }
        FieldOp::Unset(path) => unset(document, path),
        FieldOp::Push(path, values) => {
            array_mut(document, path)?.extend(values.iter().cloned());
        }
        FieldOp::PullAt(path, positions) => {
            let items = array_mut(document, path)?;
            let mut positions = positions.clone();
            positions.sort_unstable();
            positions.dedup();
            for position in positions.into_iter().rev() {
                if position < items.len() {
                    items.remove(position);
                }
            }
        }
        FieldOp::PullAll(path, values) => {
            array_mut(document, path)?.retain(|item| !values.contains(item));
        }
        FieldOp::AddToSet(path, values) => {
            let items = array_mut(document, path)?;
            for value in values {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
        }
    }
    Ok(())
}

fn invalid(path: &FieldPath, detail: impl Into<String>) -> Error {
    Error::InvalidValue {
        field: path.to_string(),
        detail: detail.into(),
    }
}

/// Walk to `path`, creating whatever is missing along the way.
fn slot_mut<'a>(document: &'a mut Document, path: &FieldPath) -> Result<&'a mut JsonValue> {
    let (first, rest) = path
        .parts()
        .split_first()
        .ok_or_else(|| invalid(path, "empty path"))?;
    let mut current = document.entry(first.clone()).or_insert(JsonValue::Null);
    for part in rest {
        if current.is_null() {
            *current = match part.parse::<usize>() {
                Ok(_) => JsonValue::Array(Vec::new()),
                Err(_) => JsonValue::Object(Default::default()),
            };
        }
        current = match current {
            JsonValue::Object(map) => map.entry(part.clone()).or_insert(JsonValue::Null),
            JsonValue::Array(items) => {
                let index = part
                    .parse::<usize>()
                    .map_err(|_| invalid(path, format!("`{part}` is not an array index")))?;
                if items.len() <= index {
                    items.resize(index + 1, JsonValue::Null);
                }
                &mut items[index]
            }
            other => {
                return Err(invalid(path, format!("cannot descend into {other}")));
            }
        };
    }
    Ok(current)
}

fn array_mut<'a>(document: &'a mut Document, path: &FieldPath) -> Result<&'a mut Vec<JsonValue>> {
    let slot = slot_mut(document, path)?;
    if slot.is_null() {
        *slot = JsonValue::Array(Vec::new());
    }
    match slot {
        JsonValue::Array(items) => Ok(items),
        other => Err(invalid(path, format!("expected an array, found {other}"))),
    }
}

fn unset(document: &mut Document, path: &FieldPath) {
    let Some((last, parents)) = path.parts().split_last() else {
        return;
    };
    if parents.is_empty() {
        document.remove(last);
        return;
    }
    let parent = FieldPath::from(parents.to_vec());
    let Ok(container) = slot_mut_existing(document, &parent) else {
        return;
    };
    match container {
        JsonValue::Object(map) => {
            map.remove(last);
        }
        JsonValue::Array(items) => {
            if let Some(item) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = JsonValue::Null;
            }
        }
        _ => {}
    }
}

fn slot_mut_existing<'a>(document: &'a mut Document, path: &FieldPath) -> Result<&'a mut JsonValue> {
    let missing = || invalid(path, "path does not exist");
    let (first, rest) = path.parts().split_first().ok_or_else(missing)?;
    let mut current = document.get_mut(first).ok_or_else(missing)?;
    for part in rest {
        current = match current {
            JsonValue::Object(map) => map.get_mut(part).ok_or_else(missing)?,
            JsonValue::Array(items) => part
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(missing)?,
            _ => return Err(missing()),
        };
    }
    Ok(current)
}

//! Applying action effects to shared state.
//!
//! Effects run in declaration order against a working copy; each one sees the
//! writes of the ones before it. The input state is never modified.

use serde_json::{Map, Value};

use tandem_core::definition::Effect;

use crate::expr::{self, key_string, loose_eq, number, Expr, ExprError, Scope};

pub fn apply_effects(
    state: &Map<String, Value>,
    effects: &[Effect],
    scope: &Scope<'_>,
) -> Result<Map<String, Value>, ExprError> {
    let mut root = Value::Object(state.clone());
    for effect in effects {
        apply_one(&mut root, effect, scope)?;
    }
    match root {
        Value::Object(next) => Ok(next),
        other => Err(ExprError::Type(format!("state is no longer an object: {other}"))),
    }
}

fn apply_one(root: &mut Value, effect: &Effect, scope: &Scope<'_>) -> Result<(), ExprError> {
    let bound = scope.bind(&*root);
    let path = target_path(effect.path(), &bound)?;
    let value = match effect {
        Effect::Set { value, .. }
        | Effect::Add { value, .. }
        | Effect::Push { value, .. }
        | Effect::Merge { value, .. } => Some(expr::evaluate(value, &bound)?),
        Effect::Remove { value, .. } => value
            .as_deref()
            .map(|src| expr::evaluate(src, &bound))
            .transpose()?,
    };

    let Some((last, parents)) = path.split_last() else {
        return Err(ExprError::Type("effect path is empty".into()));
    };

    if let Effect::Remove { .. } = effect {
        let Some(container) = walk(root, parents, false)? else {
            return Ok(());
        };
        match value {
            None => remove_key(container, last),
            Some(value) => match existing(container, last) {
                Some(Value::Array(items)) => items.retain(|item| !loose_eq(item, &value)),
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(ExprError::Type(format!("remove target is not an array: {other}")));
                }
            },
        }
        return Ok(());
    }

    let container = walk(root, parents, true)?
        .ok_or_else(|| ExprError::Type(format!("cannot write {}", effect.path())))?;
    let slot = slot(container, last)?;
    let value = value.unwrap_or(Value::Null);

    match effect {
        Effect::Set { .. } => *slot = value,
        Effect::Add { .. } => {
            let current = if slot.is_null() { 0.0 } else { as_f64(slot, "add")? };
            *slot = number(current + as_f64(&value, "add")?);
        }
        Effect::Push { .. } => {
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
            match slot {
                Value::Array(items) => items.push(value),
                other => return Err(ExprError::Type(format!("push target is not an array: {other}"))),
            }
        }
        Effect::Merge { .. } => {
            let Value::Object(incoming) = value else {
                return Err(ExprError::Type(format!("merge value is not an object: {value}")));
            };
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            match slot {
                Value::Object(current) => current.extend(incoming),
                other => return Err(ExprError::Type(format!("merge target is not an object: {other}"))),
            }
        }
        Effect::Remove { .. } => {}
    }
    Ok(())
}

/// Resolve an effect path such as `votes[actor.id]` to concrete keys below
/// the state root.
fn target_path(src: &str, scope: &Value) -> Result<Vec<String>, ExprError> {
    fn collect(expr: &Expr, scope: &Value, out: &mut Vec<String>) -> Result<(), ExprError> {
        match expr {
            Expr::Path(segments) => {
                out.extend(segments.iter().cloned());
                Ok(())
            }
            Expr::Index(base, index) => {
                collect(base, scope, out)?;
                out.push(key_string(&index.eval(scope)?)?);
                Ok(())
            }
            _ => Err(ExprError::Type("effect path must be a state path".into())),
        }
    }

    let mut keys = Vec::new();
    collect(&expr::parse(src)?, scope, &mut keys)?;
    Ok(keys)
}

/// Descend to the container holding the final key. With `create`, missing
/// or null intermediate objects are created.
fn walk<'a>(
    root: &'a mut Value,
    parents: &[String],
    create: bool,
) -> Result<Option<&'a mut Value>, ExprError> {
    let mut current = root;
    for key in parents {
        if create && current.is_null() {
            *current = Value::Object(Map::new());
        }
        if create && !(current.is_object() || current.is_array()) {
            return Err(ExprError::Type(format!("cannot write into {current}")));
        }
        current = match current {
            Value::Object(map) => {
                if create {
                    map.entry(key.clone()).or_insert(Value::Null)
                } else {
                    match map.get_mut(key) {
                        Some(v) => v,
                        None => return Ok(None),
                    }
                }
            }
            Value::Array(items) => match array_index(key, items.len()) {
                Some(i) => &mut items[i],
                None if create => {
                    return Err(ExprError::Type(format!("index {key} out of bounds")));
                }
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    if create && current.is_null() {
        *current = Value::Object(Map::new());
    }
    Ok(Some(current))
}

fn slot<'a>(container: &'a mut Value, key: &str) -> Result<&'a mut Value, ExprError> {
    match container {
        Value::Object(map) => Ok(map.entry(key.to_string()).or_insert(Value::Null)),
        Value::Array(items) => match array_index(key, items.len()) {
            Some(i) => Ok(&mut items[i]),
            None => Err(ExprError::Type(format!("index {key} out of bounds ({})", items.len()))),
        },
        other => Err(ExprError::Type(format!("cannot index into {other}"))),
    }
}

fn existing<'a>(container: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    match container {
        Value::Object(map) => map.get_mut(key),
        Value::Array(items) => match array_index(key, items.len()) {
            Some(i) => Some(&mut items[i]),
            None => None,
        },
        _ => None,
    }
}

fn array_index(key: &str, len: usize) -> Option<usize> {
    key.parse::<usize>().ok().filter(|i| *i < len)
}

fn remove_key(container: &mut Value, key: &str) {
    match container {
        Value::Object(map) => {
            map.remove(key);
        }
        Value::Array(items) => {
            if let Some(i) = array_index(key, items.len()) {
                items.remove(i);
            }
        }
        _ => {}
    }
}

fn as_f64(value: &Value, op: &str) -> Result<f64, ExprError> {
    value
        .as_f64()
        .ok_or_else(|| ExprError::Type(format!("{op} expects a number, got {value}")))
}

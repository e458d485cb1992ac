//! `--set key=value[,key=value...]` overrides
//!
//! Keys are dotted paths relative to `properties`; a segment may address an
//! array element with `name[i]`. Values wrapped in single quotes may contain
//! `,` and `=`. Integers and booleans keep their JSON type.

use serde_json::{Map, Value};

use crate::{Error, Result};

/// One parsed override
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Key(&'a str),
    Index(&'a str, usize),
}

/// Split a `--set` flag on commas outside single quotes
fn split_pairs(flag: &str) -> Vec<String> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in flag.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => pairs.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    pairs.push(current);
    pairs.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

fn typed_value(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

/// Parse every `--set` flag into overrides, in order
pub fn parse_overrides(flags: &[String]) -> Result<Vec<Override>> {
    let mut out = Vec::new();
    for flag in flags {
        for pair in split_pairs(flag) {
            let (key, raw) = pair.split_once('=').ok_or_else(|| {
                Error::invalid_args(format!(
                    "--set value '{}' must have the form key=value",
                    pair
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::invalid_args(format!(
                    "--set value '{}' has an empty key",
                    pair
                )));
            }
            out.push(Override {
                path: key.to_string(),
                value: typed_value(raw),
            });
        }
    }
    Ok(out)
}

fn parse_segment(segment: &str) -> Result<Segment<'_>> {
    let invalid = || Error::invalid_args(format!("invalid --set path segment '{}'", segment));
    match segment.split_once('[') {
        None if !segment.is_empty() => Ok(Segment::Key(segment)),
        None => Err(invalid()),
        Some((name, rest)) => {
            let index = rest
                .strip_suffix(']')
                .and_then(|i| i.parse::<usize>().ok())
                .ok_or_else(invalid)?;
            if name.is_empty() {
                return Err(invalid());
            }
            Ok(Segment::Index(name, index))
        }
    }
}

fn object_mut<'a>(value: &'a mut Value, path: &str) -> Result<&'a mut Map<String, Value>> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        Error::invalid_args(format!("--set path '{}' crosses a non-object value", path))
    })
}

fn element_mut<'a>(array: &'a mut Value, index: usize, path: &str) -> Result<&'a mut Value> {
    if array.is_null() {
        *array = Value::Array(Vec::new());
    }
    let items = array.as_array_mut().ok_or_else(|| {
        Error::invalid_args(format!("--set path '{}' indexes a non-array value", path))
    })?;
    if index == items.len() {
        items.push(Value::Null);
    }
    items.get_mut(index).ok_or_else(|| {
        Error::invalid_args(format!(
            "--set path '{}' index {} is out of range",
            path, index
        ))
    })
}

/// Set one override inside `properties` of the API model document
pub fn apply_override(doc: &mut Value, ov: &Override) -> Result<()> {
    let root = object_mut(doc, &ov.path)?;
    let mut cursor = root
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));

    let segments: Vec<&str> = ov.path.split('.').collect();
    for (i, raw) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        let slot = match parse_segment(raw)? {
            Segment::Key(key) => object_mut(cursor, &ov.path)?
                .entry(key.to_string())
                .or_insert(Value::Null),
            Segment::Index(name, index) => {
                let array = object_mut(cursor, &ov.path)?
                    .entry(name.to_string())
                    .or_insert(Value::Null);
                element_mut(array, index, &ov.path)?
            }
        };
        if last {
            *slot = ov.value.clone();
            return Ok(());
        }
        cursor = slot;
    }
    Ok(())
}

/// Apply every `--set` flag to the document
pub fn apply_set_flags(doc: &mut Value, flags: &[String]) -> Result<()> {
    for ov in parse_overrides(flags)? {
        apply_override(doc, &ov)?;
    }
    Ok(())
}

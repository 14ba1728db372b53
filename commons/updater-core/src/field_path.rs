//! Tag-addressed field access over serializable objects.
//!
//! Paths such as `spec.template.spec.containers[0].image` address fields by
//! their serialization name, the same names used in Kubernetes manifests.
//! Typed objects are walked through their serde representation: the object
//! is encoded to a [`serde_json::Value`], mutated there, decoded back and
//! verified, so the caller's value is only replaced once the whole operation
//! has succeeded.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::PathError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSegment {
    pub tag: String,
    pub index: Option<usize>,
}

impl FieldSegment {
    fn parse(raw: &str) -> Result<Self, PathError> {
        let indexed = raw
            .strip_suffix(']')
            .and_then(|s| s.split_once('['))
            .filter(|(tag, _)| !tag.is_empty());
        let Some((tag, index)) = indexed else {
            return Ok(Self {
                tag: raw.to_string(),
                index: None,
            });
        };
        let invalid = || PathError::InvalidIndex {
            segment: raw.to_string(),
            index: index.to_string(),
        };
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let index = index.parse::<usize>().map_err(|_| invalid())?;
        Ok(Self {
            tag: tag.to_string(),
            index: Some(index),
        })
    }
}

impl fmt::Display for FieldSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.tag, i),
            None => f.write_str(&self.tag),
        }
    }
}

/// A parsed dot-separated field path. Never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<FieldSegment>,
}

impl FieldPath {
    pub fn segments(&self) -> &[FieldSegment] {
        &self.segments
    }

    fn terminal(&self) -> &FieldSegment {
        // parse() refuses empty paths
        &self.segments[self.segments.len() - 1]
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PathError::EmptyPath);
        }
        let segments = s
            .split('.')
            .map(FieldSegment::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Result of a compare-and-set on a scalar leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetOutcome {
    pub previous: String,
    pub changed: bool,
}

/// Set the string field addressed by `path` inside a typed object.
///
/// When the field already holds `value` the object is left untouched and
/// `changed` is false. On any error the object is left untouched as well.
pub fn set_field_by_path<T>(
    object: &mut T,
    path: &FieldPath,
    value: &str,
) -> Result<SetOutcome, PathError>
where
    T: Serialize + DeserializeOwned,
{
    let mut tree = serde_json::to_value(&*object)?;
    let outcome = set_value_by_path(&mut tree, path.segments(), value)?;
    if !outcome.changed {
        if outcome.previous.is_empty() {
            ensure_in_schema::<T>(&tree, path)?;
        }
        return Ok(outcome);
    }
    let updated: T = serde_json::from_value(tree)?;
    if stored_value(&updated, path)?.as_deref() != Some(value) {
        return Err(outside_schema::<T>(path));
    }
    *object = updated;
    Ok(outcome)
}

/// Read the string field addressed by `path` inside a typed object.
///
/// An unset optional field reads as the empty string; a tag the type does
/// not know is `FieldNotFound`.
pub fn get_field_by_path<T>(object: &T, path: &FieldPath) -> Result<String, PathError>
where
    T: Serialize + DeserializeOwned,
{
    let tree = serde_json::to_value(object)?;
    let value = get_value_by_path(&tree, path.segments())?;
    if value.is_empty() {
        ensure_in_schema::<T>(&tree, path)?;
    }
    Ok(value)
}

const SCHEMA_MARKER: &str = "\u{0}updater-schema-marker";

/// An absent leaf is either an unset optional field or a tag outside the
/// type. Writing a marker into a scratch copy and decoding it tells them
/// apart: tags outside the type are dropped on decode.
fn ensure_in_schema<T>(tree: &Value, path: &FieldPath) -> Result<(), PathError>
where
    T: Serialize + DeserializeOwned,
{
    let mut scratch = tree.clone();
    set_value_by_path(&mut scratch, path.segments(), SCHEMA_MARKER)?;
    let decoded: T = serde_json::from_value(scratch)?;
    if stored_value(&decoded, path)?.as_deref() != Some(SCHEMA_MARKER) {
        return Err(outside_schema::<T>(path));
    }
    Ok(())
}

fn stored_value<T>(object: &T, path: &FieldPath) -> Result<Option<String>, PathError>
where
    T: Serialize,
{
    Ok(get_value_by_path(&serde_json::to_value(object)?, path.segments()).ok())
}

fn outside_schema<T>(path: &FieldPath) -> PathError {
    PathError::FieldNotFound {
        tag: path.terminal().tag.clone(),
        object: std::any::type_name::<T>().to_string(),
    }
}

/// Compare-and-set over an untyped tree.
///
/// An absent or null leaf reads as the empty string, mirroring an unset
/// optional field of the typed object.
pub fn set_value_by_path(
    node: &mut Value,
    path: &[FieldSegment],
    value: &str,
) -> Result<SetOutcome, PathError> {
    let (head, rest) = path.split_first().ok_or(PathError::EmptyPath)?;
    let fields = match node {
        Value::Object(fields) => fields,
        other => return Err(not_found(head, other)),
    };

    if rest.is_empty() {
        if head.index.is_some() {
            return Err(PathError::UnsupportedSliceTerminal {
                tag: head.tag.clone(),
            });
        }
        let previous = leaf_string(head, fields.get(&head.tag))?;
        if previous == value {
            return Ok(SetOutcome {
                previous,
                changed: false,
            });
        }
        fields.insert(head.tag.clone(), Value::String(value.to_string()));
        return Ok(SetOutcome {
            previous,
            changed: true,
        });
    }

    let child = match fields.get_mut(&head.tag) {
        Some(child) if !child.is_null() => child,
        _ => return Err(not_found_in(head, fields)),
    };
    let next = match (head.index, child) {
        (None, child) => child,
        (Some(index), Value::Array(items)) => {
            let len = items.len();
            items.get_mut(index).ok_or_else(|| PathError::IndexOutOfRange {
                tag: head.tag.clone(),
                index,
                len,
            })?
        }
        (Some(_), other) => {
            return Err(PathError::NotASlice {
                tag: head.tag.clone(),
                found: kind_name(other),
            });
        }
    };
    set_value_by_path(next, rest, value)
}

/// Pure getter counterpart of [`set_value_by_path`].
pub fn get_value_by_path(node: &Value, path: &[FieldSegment]) -> Result<String, PathError> {
    let (head, rest) = path.split_first().ok_or(PathError::EmptyPath)?;
    let fields = match node {
        Value::Object(fields) => fields,
        other => return Err(not_found(head, other)),
    };
    if rest.is_empty() {
        if head.index.is_some() {
            return Err(PathError::UnsupportedSliceTerminal {
                tag: head.tag.clone(),
            });
        }
        return leaf_string(head, fields.get(&head.tag));
    }
    let child = match fields.get(&head.tag) {
        Some(child) if !child.is_null() => child,
        _ => return Err(not_found_in(head, fields)),
    };
    let next = match (head.index, child) {
        (None, child) => child,
        (Some(index), Value::Array(items)) => {
            items.get(index).ok_or_else(|| PathError::IndexOutOfRange {
                tag: head.tag.clone(),
                index,
                len: items.len(),
            })?
        }
        (Some(_), other) => {
            return Err(PathError::NotASlice {
                tag: head.tag.clone(),
                found: kind_name(other),
            });
        }
    };
    get_value_by_path(next, rest)
}

fn leaf_string(segment: &FieldSegment, leaf: Option<&Value>) -> Result<String, PathError> {
    match leaf {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(PathError::NotAString {
            tag: segment.tag.clone(),
            found: kind_name(other),
        }),
    }
}

fn not_found(segment: &FieldSegment, node: &Value) -> PathError {
    PathError::FieldNotFound {
        tag: segment.tag.clone(),
        object: format!("{} value", kind_name(node)),
    }
}

fn not_found_in(segment: &FieldSegment, fields: &Map<String, Value>) -> PathError {
    let names: Vec<&str> = fields.keys().map(String::as_str).collect();
    PathError::FieldNotFound {
        tag: segment.tag.clone(),
        object: format!("object with fields [{}]", names.join(", ")),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "object",
    }
}

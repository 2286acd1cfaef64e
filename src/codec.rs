//! Enhanced JSON codec for event arguments.
//!
//! The text form is ordinary JSON. Values plain JSON has no room for are
//! written as tagged strings that start with a colon:
//!
//! | value              | text                     |
//! |--------------------|--------------------------|
//! | `Undefined`        | `":undefined"`           |
//! | NaN / ±infinity    | `":NaN"`, `":Infinity"`, `":-Infinity"` |
//! | bytes              | `":base64:<standard>"`   |
//! | `":abc"` (string)  | `"::abc"`                |
//!
//! Strings that genuinely start with a colon get one extra colon so they can
//! never be mistaken for a tag.

use crate::error::CodecError;
use crate::value::Value;
use base64::Engine as _;

const TAG_UNDEFINED: &str = "undefined";
const TAG_NAN: &str = "NaN";
const TAG_INFINITY: &str = "Infinity";
const TAG_NEG_INFINITY: &str = "-Infinity";
const TAG_BASE64: &str = "base64:";

/// Encode an argument list to its text form.
pub fn stringify(args: &[Value]) -> String {
    serde_json::Value::Array(args.iter().map(encode).collect()).to_string()
}

/// Decode the text form back into an argument list.
pub fn parse(text: &str) -> Result<Vec<Value>, CodecError> {
    match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Array(items) => items.into_iter().map(decode).collect(),
        other => Err(CodecError::NotAnArray(json_kind(&other))),
    }
}

/// Encode a single value to its JSON representation.
pub fn encode(value: &Value) -> serde_json::Value {
    match value {
        Value::Undefined => tagged(TAG_UNDEFINED),
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) if f.is_nan() => tagged(TAG_NAN),
        Value::Float(f) if f.is_infinite() => {
            tagged(if *f > 0.0 { TAG_INFINITY } else { TAG_NEG_INFINITY })
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) if s.starts_with(':') => serde_json::Value::String(format!(":{}", s)),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => serde_json::Value::String(format!(
            ":{}{}",
            TAG_BASE64,
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(encode).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), encode(value)))
                .collect(),
        ),
    }
}

/// Decode a JSON representation produced by [`encode`].
pub fn decode(value: serde_json::Value) -> Result<Value, CodecError> {
    Ok(match value {
        serde_json::Value::String(s) => match s.strip_prefix(':') {
            Some(tag) => decode_tag(tag)?,
            None => Value::String(s),
        },
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(decode).collect::<Result<_, _>>()?)
        }
        serde_json::Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| Ok((key, decode(value)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        plain => Value::from(plain),
    })
}

fn decode_tag(tag: &str) -> Result<Value, CodecError> {
    if tag.starts_with(':') {
        return Ok(Value::String(tag.to_string()));
    }
    Ok(match tag {
        TAG_UNDEFINED => Value::Undefined,
        TAG_NAN => Value::Float(f64::NAN),
        TAG_INFINITY => Value::Float(f64::INFINITY),
        TAG_NEG_INFINITY => Value::Float(f64::NEG_INFINITY),
        _ => match tag.strip_prefix(TAG_BASE64) {
            Some(encoded) => {
                Value::Bytes(base64::engine::general_purpose::STANDARD.decode(encoded)?)
            }
            // Unknown tags from newer peers degrade to the bare string.
            None => Value::String(tag.to_string()),
        },
    })
}

fn tagged(tag: &str) -> serde_json::Value {
    serde_json::Value::String(format!(":{}", tag))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

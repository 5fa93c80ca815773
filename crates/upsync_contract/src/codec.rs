use rmp_serde::{decode::Error as DecodeError, encode::Error as EncodeError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to lift payload into a JSON value: {0}")]
    ToValue(#[source] serde_json::Error),
    #[error("failed to encode messagepack payload: {0}")]
    Encode(#[source] EncodeError),
    #[error("failed to decode messagepack payload: {0}")]
    Decode(#[source] DecodeError),
    #[error("decoded payload does not match the expected shape: {0}")]
    FromValue(#[source] serde_json::Error),
}

/// Encodes `value` as named MessagePack with map keys in sorted order, so the
/// same logical payload always yields the same bytes.
pub fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(value).map_err(CodecError::ToValue)?;
    rmp_serde::to_vec_named(&sort_keys(value)).map_err(CodecError::Encode)
}

pub fn decode_canonical<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let value: Value = rmp_serde::from_slice(bytes).map_err(CodecError::Decode)?;
    serde_json::from_value(value).map_err(CodecError::FromValue)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(key, item)| (key, sort_keys(item)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        scalar => scalar,
    }
}

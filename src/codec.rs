//! CBOR encoding of message bodies and task payloads.

use ciborium::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)?;
    Ok(buffer)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(ciborium::from_reader(bytes)?)
}

/// Captures a value as a CBOR tree to be embedded in a larger message.
pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    Ok(Value::serialized(value)?)
}

pub(crate) fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, CodecError> {
    Ok(value.deserialized()?)
}

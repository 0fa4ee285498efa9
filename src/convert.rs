//! Value serialization behind a capability trait.
//!
//! Everything that flows through a channel or future is a [`Payload`]: the
//! converter-encoded bytes of a value. Typed primitives encode on the way in
//! and decode on the way out, so a replayed execution observes byte-identical
//! traffic regardless of the in-memory types involved.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ConversionError;

/// Encoded bytes of a single value.
pub type Payload = Vec<u8>;

/// Serializes and deserializes values by type.
///
/// The trait is object-safe: implementations translate between bytes and a
/// [`serde_json::Value`] tree, while the generic [`encode_arg`]/[`decode_arg`]
/// helpers bridge to concrete Rust types.
pub trait DataConverter: Send + Sync {
    fn to_payload(&self, value: &Value) -> Result<Payload, ConversionError>;
    fn from_payload(&self, payload: &[u8]) -> Result<Value, ConversionError>;
}

/// Default converter: compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDataConverter;

impl DataConverter for JsonDataConverter {
    fn to_payload(&self, value: &Value) -> Result<Payload, ConversionError> {
        serde_json::to_vec(value).map_err(|e| ConversionError::new(e.to_string()))
    }

    fn from_payload(&self, payload: &[u8]) -> Result<Value, ConversionError> {
        serde_json::from_slice(payload).map_err(|e| ConversionError::new(e.to_string()))
    }
}

pub fn default_data_converter() -> Arc<dyn DataConverter> {
    Arc::new(JsonDataConverter)
}

pub fn encode_arg<T: Serialize>(
    converter: &dyn DataConverter,
    value: &T,
) -> Result<Payload, ConversionError> {
    let value = serde_json::to_value(value).map_err(|e| ConversionError::new(e.to_string()))?;
    converter.to_payload(&value)
}

pub fn decode_arg<T: DeserializeOwned>(
    converter: &dyn DataConverter,
    payload: &[u8],
) -> Result<T, ConversionError> {
    let value = converter.from_payload(payload)?;
    serde_json::from_value(value).map_err(|e| ConversionError::new(e.to_string()))
}

/// Packs an argument list into a single payload.
pub fn encode_args(
    converter: &dyn DataConverter,
    values: &[Value],
) -> Result<Payload, ConversionError> {
    converter.to_payload(&Value::Array(values.to_vec()))
}

/// Reverse of [`encode_args`]. A payload holding a single bare value is
/// treated as a one-element list.
pub fn decode_args(
    converter: &dyn DataConverter,
    payload: &[u8],
) -> Result<Vec<Value>, ConversionError> {
    match converter.from_payload(payload)? {
        Value::Array(values) => Ok(values),
        other => Ok(vec![other]),
    }
}

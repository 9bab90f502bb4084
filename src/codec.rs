//! Pluggable JSON encoding for frames, publish payloads and token responses.

use crate::error::{Result, StreamError};
use serde_json::Value;

/// JSON encoder/decoder used by the client.
pub trait JsonCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerdeJsonCodec;

impl JsonCodec for SerdeJsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StreamError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

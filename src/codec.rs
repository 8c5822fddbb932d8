//! Body codecs for v2 frames.
//!
//! The binary framer moves the routing fields of a message into frame
//! headers and hands whatever is left to a [`Codec`].  The codec only
//! sees a JSON value; how it lays that value out in bytes is its own
//! business.

use std::fmt::Debug;

use serde_json::Value;

use crate::error::FrameError;

pub trait Codec: Send + Sync + Debug {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, FrameError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, FrameError>;
}

/// UTF-8 JSON bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(value).map_err(|err| FrameError::Codec(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, FrameError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

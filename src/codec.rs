//! Payload serialization for the wire protocol.
//!
//! The codec maps protocol envelopes to frame payload bytes and back; the
//! length-prefixed framing itself lives in [`crate::ipc`]. The codec is
//! injected into the pool so embedders can swap the encoding, as long as the
//! same codec runs on both ends of the pipe.

use crate::error::Result;
use crate::protocol::{Request, Response};

/// Bi-directional serialization of requests and responses.
pub trait Codec: Send + Sync + 'static {
    fn encode_request(&self, request: &Request) -> Result<Vec<u8>>;
    fn decode_request(&self, bytes: &[u8]) -> Result<Request>;
    fn encode_response(&self, response: &Response) -> Result<Vec<u8>>;
    fn decode_response(&self, bytes: &[u8]) -> Result<Response>;
}

/// Default codec: JSON via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_request(&self, request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<Request> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<Response> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

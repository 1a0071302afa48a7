use std::any::Any;
use std::fmt;

use crate::errors::CodecError;
use crate::types::Body;

/// Encodes and decodes message bodies of one type.
///
/// A codec is only consulted when a message crosses a process boundary; local
/// deliveries share the body as-is. The name travels in the wire envelope so
/// the receiving node can pick the matching decoder.
pub trait MessageCodec: Send + Sync + fmt::Debug {
    /// Unique name of this codec.
    fn name(&self) -> &str;

    /// Encode a body. Implementations downcast `body` to their own type and
    /// fail with [`CodecError::Encode`] when it is something else.
    fn encode(&self, body: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes produced by [`MessageCodec::encode`] on another node.
    fn decode(&self, bytes: &[u8]) -> Result<Body, CodecError>;
}

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use switchyard_api::codec::MessageCodec;
use switchyard_api::errors::CodecError;
use switchyard_api::types::Body;

use super::reply::ReplyException;
use crate::error::BusError;

pub const STRING_CODEC: &str = "string";
pub const BYTES_CODEC: &str = "bytes";
pub const I64_CODEC: &str = "i64";
pub const BOOL_CODEC: &str = "bool";
pub const JSON_CODEC: &str = "json";
pub const REPLY_EXCEPTION_CODEC: &str = "reply-exception";

/// Codec for any serde type, carried as JSON.
pub struct JsonCodec<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), _marker: PhantomData }
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").field("name", &self.name).field("type", &type_name::<T>()).finish()
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, body: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
        let value = body.downcast_ref::<T>().ok_or_else(|| CodecError::Encode {
            codec: self.name.clone(),
            reason: format!("body is not a `{}`", type_name::<T>()),
        })?;
        serde_json::to_vec(value).map_err(|e| CodecError::Encode { codec: self.name.clone(), reason: e.to_string() })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body, CodecError> {
        let value: T = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::Decode { codec: self.name.clone(), reason: e.to_string() })?;
        Ok(Arc::new(value))
    }
}

/// Raw UTF-8 for `String` bodies.
#[derive(Debug, Default)]
pub struct StringCodec;

impl MessageCodec for StringCodec {
    fn name(&self) -> &str {
        STRING_CODEC
    }

    fn encode(&self, body: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
        body.downcast_ref::<String>()
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| mismatch(STRING_CODEC, "String"))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body, CodecError> {
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::Decode { codec: STRING_CODEC.to_string(), reason: e.to_string() })?;
        Ok(Arc::new(s))
    }
}

/// Passes `Vec<u8>` bodies through unchanged.
#[derive(Debug, Default)]
pub struct BytesCodec;

impl MessageCodec for BytesCodec {
    fn name(&self) -> &str {
        BYTES_CODEC
    }

    fn encode(&self, body: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
        body.downcast_ref::<Vec<u8>>().cloned().ok_or_else(|| mismatch(BYTES_CODEC, "Vec<u8>"))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body, CodecError> {
        Ok(Arc::new(bytes.to_vec()))
    }
}

/// Big-endian eight bytes.
#[derive(Debug, Default)]
pub struct I64Codec;

impl MessageCodec for I64Codec {
    fn name(&self) -> &str {
        I64_CODEC
    }

    fn encode(&self, body: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
        body.downcast_ref::<i64>().map(|v| v.to_be_bytes().to_vec()).ok_or_else(|| mismatch(I64_CODEC, "i64"))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body, CodecError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| CodecError::Decode {
            codec: I64_CODEC.to_string(),
            reason: format!("expected 8 bytes, got {}", bytes.len()),
        })?;
        Ok(Arc::new(i64::from_be_bytes(raw)))
    }
}

#[derive(Debug, Default)]
pub struct BoolCodec;

impl MessageCodec for BoolCodec {
    fn name(&self) -> &str {
        BOOL_CODEC
    }

    fn encode(&self, body: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
        body.downcast_ref::<bool>().map(|v| vec![u8::from(*v)]).ok_or_else(|| mismatch(BOOL_CODEC, "bool"))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Body, CodecError> {
        match bytes {
            [0] => Ok(Arc::new(false)),
            [1] => Ok(Arc::new(true)),
            _ => Err(CodecError::Decode { codec: BOOL_CODEC.to_string(), reason: "expected a single 0 or 1 byte".to_string() }),
        }
    }
}

fn mismatch(codec: &str, expected: &str) -> CodecError {
    CodecError::Encode { codec: codec.to_string(), reason: format!("body is not a `{expected}`") }
}

/// Codecs by name, plus the default codec for each body type.
pub struct CodecRegistry {
    by_name: RwLock<HashMap<String, Arc<dyn MessageCodec>>>,
    defaults: RwLock<HashMap<TypeId, Arc<dyn MessageCodec>>>,
}

impl CodecRegistry {
    /// A registry with the built-in codecs.
    pub fn new() -> Self {
        let registry = Self { by_name: RwLock::new(HashMap::new()), defaults: RwLock::new(HashMap::new()) };
        registry.register_default::<String>(Arc::new(StringCodec));
        registry.register_default::<Vec<u8>>(Arc::new(BytesCodec));
        registry.register_default::<i64>(Arc::new(I64Codec));
        registry.register_default::<bool>(Arc::new(BoolCodec));
        registry.register_default::<serde_json::Value>(Arc::new(JsonCodec::<serde_json::Value>::new(JSON_CODEC)));
        registry.register_default::<ReplyException>(Arc::new(JsonCodec::<ReplyException>::new(REPLY_EXCEPTION_CODEC)));
        registry
    }

    /// Make `codec` selectable by name.
    pub fn register(&self, codec: Arc<dyn MessageCodec>) {
        self.by_name.write().insert(codec.name().to_string(), codec);
    }

    /// Register `codec` by name and as the default for bodies of type `T`.
    pub fn register_default<T: Any>(&self, codec: Arc<dyn MessageCodec>) {
        self.register(Arc::clone(&codec));
        self.defaults.write().insert(TypeId::of::<T>(), codec);
    }

    pub fn unregister(&self, name: &str) {
        self.by_name.write().remove(name);
        self.defaults.write().retain(|_, codec| codec.name() != name);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn MessageCodec>> {
        self.by_name.read().get(name).cloned()
    }

    /// The codec to use for a body: the named one if given, else the
    /// default for its type.
    pub(crate) fn select(&self, name: Option<&str>, type_id: TypeId, type_name: &str) -> Result<Arc<dyn MessageCodec>, BusError> {
        match name {
            Some(name) => self
                .lookup(name)
                .ok_or_else(|| BusError::Codec(CodecError::UnknownCodec(name.to_string()))),
            None => self
                .defaults
                .read()
                .get(&type_id)
                .cloned()
                .ok_or_else(|| BusError::NoCodec(type_name.to_string())),
        }
    }

    pub(crate) fn decode(&self, name: &str, bytes: &[u8]) -> Result<Body, CodecError> {
        let codec = self.lookup(name).ok_or_else(|| CodecError::UnknownCodec(name.to_string()))?;
        codec.decode(bytes)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.by_name.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("CodecRegistry").field("codecs", &names).finish()
    }
}

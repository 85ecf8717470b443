//! Wire codec: JSON encoding and decoding of domain messages.
//!
//! The transport moves opaque bytes; [`JsonCodec`] maps them to typed
//! messages through a registry keyed by the package's
//! [`MESSAGE_TYPE_HEADER`]. Every message type a deployment sends or
//! receives must be registered before the codec is frozen.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{DecodeError, EncodeError};
use crate::message::{AnyMessage, Message};
use crate::transport::{IncomingPackage, MESSAGE_TYPE_HEADER};

/// Turns an incoming package into a typed message.
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, package: &dyn IncomingPackage) -> Result<AnyMessage, DecodeError>;
}

/// Turns a typed message into payload bytes.
pub trait MessageEncoder: Send + Sync {
    fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, EncodeError>;
}

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<AnyMessage, serde_json::Error> + Send + Sync>;
type EncodeFn = Box<dyn Fn(&AnyMessage) -> Result<Vec<u8>, EncodeError> + Send + Sync>;

/// JSON codec over a frozen type-key registry.
///
/// Built once at bootstrap via [`JsonCodec::builder`]; immutable and
/// shareable afterwards.
pub struct JsonCodec {
    decoders: HashMap<&'static str, DecodeFn>,
    encoders: HashMap<&'static str, EncodeFn>,
}

impl JsonCodec {
    pub fn builder() -> JsonCodecBuilder {
        JsonCodecBuilder {
            decoders: HashMap::new(),
            encoders: HashMap::new(),
        }
    }

    /// Whether `type_key` is registered.
    pub fn knows(&self, type_key: &str) -> bool {
        self.decoders.contains_key(type_key)
    }
}

impl std::fmt::Debug for JsonCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec")
            .field("registered", &self.decoders.len())
            .finish()
    }
}

impl MessageDecoder for JsonCodec {
    fn decode(&self, package: &dyn IncomingPackage) -> Result<AnyMessage, DecodeError> {
        let type_key = package
            .headers()
            .get(MESSAGE_TYPE_HEADER)
            .ok_or(DecodeError::MissingTypeHeader {
                header: MESSAGE_TYPE_HEADER,
            })?;

        let decode = self
            .decoders
            .get(type_key.as_str())
            .ok_or_else(|| DecodeError::UnknownMessageType {
                type_key: type_key.clone(),
            })?;

        decode(package.payload()).map_err(|source| DecodeError::MalformedPayload {
            type_key: type_key.clone(),
            source,
        })
    }
}

impl MessageEncoder for JsonCodec {
    fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, EncodeError> {
        let encode =
            self.encoders
                .get(message.type_key())
                .ok_or_else(|| EncodeError::UnknownMessageType {
                    type_key: message.type_key().to_string(),
                })?;
        encode(message)
    }
}

/// Builder collecting message type registrations for a [`JsonCodec`].
pub struct JsonCodecBuilder {
    decoders: HashMap<&'static str, DecodeFn>,
    encoders: HashMap<&'static str, EncodeFn>,
}

impl JsonCodecBuilder {
    /// Register a message type for both directions.
    ///
    /// Later registrations under the same type key replace earlier ones.
    pub fn register<M>(mut self) -> Self
    where
        M: Message + Serialize + DeserializeOwned,
    {
        self.decoders.insert(
            M::TYPE_KEY,
            Box::new(|payload| serde_json::from_slice::<M>(payload).map(AnyMessage::new)),
        );
        self.encoders.insert(
            M::TYPE_KEY,
            Box::new(|message| {
                let concrete =
                    message
                        .downcast_ref::<M>()
                        .ok_or_else(|| EncodeError::UnknownMessageType {
                            type_key: message.type_key().to_string(),
                        })?;
                serde_json::to_vec(concrete).map_err(|source| EncodeError::Serialize {
                    type_key: M::TYPE_KEY.to_string(),
                    source,
                })
            }),
        );
        self
    }

    pub fn build(self) -> JsonCodec {
        JsonCodec {
            decoders: self.decoders,
            encoders: self.encoders,
        }
    }
}

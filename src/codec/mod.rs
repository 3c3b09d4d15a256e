//! Payload codecs.
//!
//! User message types implement [`WireMessage`]: a byte-encoding function
//! and a byte-decoding function per type, no runtime reflection. The
//! [`MsgPackCodec`] helpers make a serde type's implementation a one-liner;
//! raw byte containers pass through untouched.
//!
//! # Example
//!
//! ```
//! use framewire::codec::{MsgPackCodec, WireMessage};
//! use framewire::Result;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat {
//!     from: String,
//!     text: String,
//! }
//!
//! impl WireMessage for Chat {
//!     fn encode(&self) -> Result<Vec<u8>> {
//!         MsgPackCodec::encode(self)
//!     }
//!     fn decode(bytes: &[u8]) -> Result<Self> {
//!         MsgPackCodec::decode(bytes)
//!     }
//! }
//! ```

use bytes::Bytes;

use crate::error::Result;

/// A message type that knows how to cross the wire.
pub trait WireMessage: Send + Sync + Sized + 'static {
    /// Encode to payload bytes.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Decode from payload bytes.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// MessagePack codec for structured data, via `rmp-serde`.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a serde value to MessagePack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(value)?)
    }

    /// Decode MessagePack bytes to a serde value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Raw pass-through: the payload is the message.
impl WireMessage for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

/// Raw pass-through with cheap cloning.
impl WireMessage for Bytes {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

impl WireMessage for String {
    fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn msgpack_roundtrip_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };
        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn msgpack_decode_rejects_garbage() {
        let result: Result<TestStruct> = MsgPackCodec::decode(&[0xC1, 0xC1, 0xC1]);
        assert!(result.is_err());
    }

    #[test]
    fn raw_vec_passthrough() {
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(payload.encode().unwrap(), payload);
        assert_eq!(Vec::<u8>::decode(&payload).unwrap(), payload);
    }

    #[test]
    fn raw_bytes_passthrough() {
        let payload = Bytes::from_static(b"binary");
        assert_eq!(payload.encode().unwrap(), b"binary");
        assert_eq!(Bytes::decode(b"binary").unwrap(), payload);
    }

    #[test]
    fn string_roundtrip() {
        let s = "hello".to_string();
        let encoded = s.encode().unwrap();
        assert_eq!(String::decode(&encoded).unwrap(), s);
    }
}

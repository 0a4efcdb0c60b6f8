//! Encoding of group contents for the backing store.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Turns a value into bytes for the store and back.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A value that stays encoded until first accessed.
#[derive(Debug)]
pub struct Marshalled<T> {
    bytes: Vec<u8>,
    value: Option<T>,
}

impl<T> Marshalled<T> {
    /// Wrap bytes read from the store.
    pub fn encoded(bytes: Vec<u8>) -> Self {
        Self { bytes, value: None }
    }

    /// Wrap a value that is already in memory.
    pub fn decoded(value: T) -> Self {
        Self {
            bytes: Vec::new(),
            value: Some(value),
        }
    }

    pub fn is_decoded(&self) -> bool {
        self.value.is_some()
    }

    /// Decode on first call, then hand out the in-memory value.
    pub fn get_mut(&mut self, codec: &dyn Codec<T>) -> Result<&mut T> {
        let value = match self.value.take() {
            Some(value) => value,
            None => {
                let value = codec.decode(&self.bytes)?;
                self.bytes = Vec::new();
                value
            }
        };
        Ok(self.value.insert(value))
    }

    /// Bytes for a write-back; re-encodes only if the value was decoded.
    pub fn to_bytes(&self, codec: &dyn Codec<T>) -> Result<Vec<u8>> {
        match &self.value {
            Some(value) => codec.encode(value),
            None => Ok(self.bytes.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let bytes = Codec::<Vec<String>>::encode(&codec, &vec!["a".to_string()]).unwrap();
        let decoded: Vec<String> = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, vec!["a".to_string()]);
    }

    #[test]
    fn test_decode_failure_is_codec_error() {
        let result: Result<Vec<String>> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn test_marshalled_decodes_lazily() {
        let codec = JsonCodec;
        let mut value: Marshalled<Vec<u32>> = Marshalled::encoded(b"[1,2]".to_vec());
        assert!(!value.is_decoded());
        assert_eq!(value.to_bytes(&codec).unwrap(), b"[1,2]".to_vec());

        value.get_mut(&codec).unwrap().push(3);
        assert!(value.is_decoded());
        assert_eq!(value.to_bytes(&codec).unwrap(), b"[1,2,3]".to_vec());
    }

    #[test]
    fn test_marshalled_keeps_bytes_after_failed_decode() {
        let codec = JsonCodec;
        let mut value: Marshalled<Vec<u32>> = Marshalled::encoded(b"{".to_vec());
        assert!(value.get_mut(&codec).is_err());
        assert!(!value.is_decoded());
        assert_eq!(value.to_bytes(&codec).unwrap(), b"{".to_vec());
    }
}

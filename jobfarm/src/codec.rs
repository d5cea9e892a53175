use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value did not encode: {0}")]
    Encode(String),
    #[error("payload did not decode: {0}")]
    Decode(String),
}

/// Converts user values to and from byte strings for the wire.
///
/// The farm never inspects the bytes; anything that round-trips is a valid
/// codec. Item and result types usually share one codec instance, so the
/// provided [`BincodeCodec`] implements `Codec<T>` for every serde type.
pub trait Codec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Default codec backed by bincode's standard configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{BincodeCodec, Codec};

    #[test]
    fn round_trips_plain_values() {
        let codec = BincodeCodec;

        let bytes = codec.encode(&42i32).unwrap();
        assert_eq!(42i32, codec.decode(&bytes).unwrap());

        let bytes = codec.encode(&String::from("halo")).unwrap();
        let decoded: String = codec.decode(&bytes).unwrap();
        assert_eq!("halo", decoded);
    }

    #[test]
    fn unit_encodes_to_nothing() {
        let codec = BincodeCodec;
        let bytes = codec.encode(&()).unwrap();

        assert!(bytes.is_empty());
        let _: () = codec.decode(&bytes).unwrap();
    }

    #[test]
    fn decode_of_garbage_reports() {
        let codec = BincodeCodec;
        let result: Result<String, _> = codec.decode(&[0xff, 0xff, 0xff]);

        assert!(result.is_err());
    }
}

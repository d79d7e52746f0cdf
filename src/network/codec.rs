//! Bincode codec for game inputs.
//!
//! Each [`Config::Input`](crate::Config::Input) is turned into bytes with
//! bincode's fixed-int configuration before the delta compressor runs. Fixed
//! ints keep every value of an input type the same length, which the
//! compressor relies on. Byte order follows the session's [`Endianness`].
//!
//! ```
//! use bastion_netcode::network::codec::{decode_value, encode};
//! use bastion_netcode::Endianness;
//!
//! let bytes = encode(&(-2i16, 9u8), Endianness::Big).expect("tuple encodes");
//! assert_eq!(bytes, vec![0xFF, 0xFE, 9]);
//! let back: (i16, u8) = decode_value(&bytes, Endianness::Big).expect("tuple decodes");
//! assert_eq!(back, (-2, 9));
//! ```

use bincode::config::{BigEndian, Config as BincodeConfig, Configuration, Fixint, LittleEndian};
use serde::{de::DeserializeOwned, Serialize};

use crate::network::wire::Endianness;

/// A failed input conversion.
///
/// bincode's own errors only carry a message worth keeping, so that is all
/// this holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError {
    /// `true` when serializing, `false` when deserializing.
    pub encoding: bool,
    /// bincode's description.
    pub message: String,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = if self.encoding { "serialize" } else { "deserialize" };
        write!(f, "could not {direction} input: {}", self.message)
    }
}

impl std::error::Error for CodecError {}

type Little = Configuration<LittleEndian, Fixint>;
type Big = Configuration<BigEndian, Fixint>;

fn little() -> Little {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

fn big() -> Big {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_big_endian()
}

fn append_with<T: Serialize, C: BincodeConfig>(
    value: &T,
    buffer: &mut Vec<u8>,
    config: C,
) -> Result<usize, CodecError> {
    bincode::serde::encode_into_std_write(value, buffer, config).map_err(|err| CodecError {
        encoding: true,
        message: err.to_string(),
    })
}

fn decode_with<T: DeserializeOwned, C: BincodeConfig>(
    bytes: &[u8],
    config: C,
) -> Result<(T, usize), CodecError> {
    bincode::serde::decode_from_slice(bytes, config).map_err(|err| CodecError {
        encoding: false,
        message: err.to_string(),
    })
}

/// Serializes `value` into a fresh buffer.
pub fn encode<T: Serialize>(value: &T, endianness: Endianness) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    encode_append(value, endianness, &mut buffer)?;
    Ok(buffer)
}

/// Serializes `value` onto the end of `buffer` and returns how many bytes it took.
pub fn encode_append<T: Serialize>(
    value: &T,
    endianness: Endianness,
    buffer: &mut Vec<u8>,
) -> Result<usize, CodecError> {
    match endianness {
        Endianness::Little => append_with(value, buffer, little()),
        Endianness::Big => append_with(value, buffer, big()),
    }
}

/// Deserializes a value from the front of `bytes`, also returning the bytes it used.
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    endianness: Endianness,
) -> Result<(T, usize), CodecError> {
    match endianness {
        Endianness::Little => decode_with(bytes, little()),
        Endianness::Big => decode_with(bytes, big()),
    }
}

/// [`decode`] without the length.
pub fn decode_value<T: DeserializeOwned>(
    bytes: &[u8],
    endianness: Endianness,
) -> Result<T, CodecError> {
    Ok(decode(bytes, endianness)?.0)
}

/// Length of `T::default()` once serialized. Every input of type `T` must have this length.
pub fn input_size<T: Serialize + Default>(endianness: Endianness) -> Result<usize, CodecError> {
    encode_append(&T::default(), endianness, &mut Vec::new())
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
    struct Pad {
        held: u16,
        stick: [i8; 2],
        taunt: bool,
    }

    #[test]
    fn pad_survives_either_byte_order() {
        let pad = Pad {
            held: 0x0301,
            stick: [-128, 127],
            taunt: true,
        };
        for endianness in [Endianness::Little, Endianness::Big] {
            let bytes = encode(&pad, endianness).unwrap();
            assert_eq!(bytes.len(), 5);
            assert_eq!(decode::<Pad>(&bytes, endianness).unwrap(), (pad, 5));
        }
    }

    #[test]
    fn integers_never_shrink() {
        assert_eq!(encode(&0u64, Endianness::Little).unwrap().len(), 8);
        assert_eq!(encode(&u64::MAX, Endianness::Little).unwrap().len(), 8);
        assert_eq!(input_size::<Pad>(Endianness::Big).unwrap(), 5);
        assert_eq!(input_size::<()>(Endianness::Big).unwrap(), 0);
    }

    #[test]
    fn byte_order_is_visible_on_the_wire() {
        assert_eq!(encode(&0xA1B2u16, Endianness::Little).unwrap(), [0xB2, 0xA1]);
        assert_eq!(encode(&0xA1B2u16, Endianness::Big).unwrap(), [0xA1, 0xB2]);
    }

    #[test]
    fn appending_keeps_earlier_bytes() {
        let mut buffer = vec![0xEE];
        assert_eq!(encode_append(&[1u8, 2, 3], Endianness::Little, &mut buffer).unwrap(), 3);
        assert_eq!(buffer, [0xEE, 1, 2, 3]);
    }

    #[test]
    fn short_buffer_is_a_decode_error() {
        let err = decode_value::<u32>(&[1, 2], Endianness::Little).unwrap_err();
        assert!(!err.encoding);
        assert!(err.to_string().starts_with("could not deserialize input"));
    }
}
